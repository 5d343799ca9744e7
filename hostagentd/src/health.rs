//! Application health probe.
//!
//! The `healthcheck` shortcut asks the local application server for its
//! configured health endpoint and reports the raw status code. Probe
//! failures are reported as "-1" rather than an error so the caller
//! always gets an answer, and transitions between codes are recorded in
//! the event log.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::SharedConfig;
use crate::events::EventLog;

pub const PROBE_UNREACHABLE: &str = "-1";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HealthProbe {
    http: reqwest::Client,
    config: SharedConfig,
    events: Arc<EventLog>,
    last_code: Mutex<String>,
}

impl HealthProbe {
    pub fn new(config: SharedConfig, events: Arc<EventLog>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .unwrap_or_default(),
            config,
            events,
            last_code: Mutex::new(String::new()),
        }
    }

    /// Probe the application and return its HTTP status code as a
    /// string, or "-1" when the application is unreachable.
    pub async fn check(&self) -> String {
        let (port, path) = {
            let config = self.config.read().unwrap_or_else(|e| e.into_inner());
            (config.service_port(), config.healthcheck_url())
        };
        let url = format!("http://127.0.0.1:{port}{path}");

        let code = match self.http.head(&url).send().await {
            Ok(resp) => resp.status().as_u16().to_string(),
            Err(e) => {
                debug!(%url, "health probe failed: {e}");
                PROBE_UNREACHABLE.to_string()
            }
        };

        self.note_transition(&url, &code);
        code
    }

    fn note_transition(&self, url: &str, code: &str) {
        let mut last = self.last_code.lock().unwrap_or_else(|e| e.into_inner());
        if *last == code {
            return;
        }
        let previous = std::mem::replace(&mut *last, code.to_string());
        drop(last);

        let message = if previous.is_empty() {
            format!("health probe of {url} reports {code}")
        } else {
            format!("health probe of {url} changed from {previous} to {code}")
        };
        if let Err(e) = self.events.info("healthcheck", &message) {
            warn!("failed to record health transition: {e:#}");
        }
    }
}
