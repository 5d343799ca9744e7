//! Request processing pipeline.
//!
//! One encrypted request in, one encrypted response out. The pipeline
//! opens the envelope, builds a task from the payload, runs it, applies
//! any configuration document the task produced, and seals the response
//! under the request nonce. A request that cannot be authenticated gets
//! exactly one retry, and only after the stored host identity was
//! actually corrected from the live metadata source.
//!
//! Rejected requests produce an empty response so the caller learns
//! nothing about why the envelope failed.

use std::sync::Arc;

use chrono::Utc;
use hostagent_proto::envelope::{
    current_timestamp, decrypt_request, encrypt_response, DecryptedRequest, EnvelopeError,
    HostIdentity,
};
use tracing::{info, warn};

use crate::config::{AgentConfig, IdentitySource, SharedConfig};
use crate::events::EventLog;
use crate::provision::Provisioner;
use crate::registry::TaskRegistry;

/// Result of processing one request.
pub struct ProcessOutcome {
    /// Sealed response envelope, or empty when the request was rejected.
    pub response: String,
    /// Whether the rejection looked like clock skew rather than a bad
    /// or replayed envelope.
    pub clock_drift: bool,
}

impl ProcessOutcome {
    fn rejected(clock_drift: bool) -> Self {
        Self {
            response: String::new(),
            clock_drift,
        }
    }
}

pub struct RequestProcessor {
    registry: TaskRegistry,
    config: SharedConfig,
    identity_source: Arc<dyn IdentitySource>,
    provisioner: Arc<dyn Provisioner>,
    events: Arc<EventLog>,
}

impl RequestProcessor {
    pub fn new(
        registry: TaskRegistry,
        config: SharedConfig,
        identity_source: Arc<dyn IdentitySource>,
        provisioner: Arc<dyn Provisioner>,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            registry,
            config,
            identity_source,
            provisioner,
            events,
        }
    }

    fn identity(&self) -> HostIdentity {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .identity()
    }

    /// Open the request envelope, retrying once when authentication
    /// fails and the stored identity turns out to be stale.
    async fn open(&self, raw: &str) -> Result<(DecryptedRequest, HostIdentity), ProcessOutcome> {
        let identity = self.identity();
        match decrypt_request(raw, &identity, Utc::now()) {
            Ok(request) => return Ok((request, identity)),
            Err(EnvelopeError::Auth) => {}
            Err(e) => return Err(self.reject(&e)),
        }

        // Authentication failed. The stored identity may be stale, so
        // reconcile it against the live metadata source and retry once
        // only if something actually changed.
        let instance_id = self.identity_source.fetch_instance_id().await;
        let reservation_id = self.identity_source.fetch_reservation_id().await;
        let changed = {
            let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
            config.apply_verified_identity(instance_id, reservation_id)
        };
        if !changed {
            return Err(self.reject(&EnvelopeError::Auth));
        }

        let identity = self.identity();
        match decrypt_request(raw, &identity, Utc::now()) {
            Ok(request) => Ok((request, identity)),
            Err(e) => Err(self.reject(&e)),
        }
    }

    fn reject(&self, error: &EnvelopeError) -> ProcessOutcome {
        warn!("request rejected: {error}");
        if let Err(e) = self.events.warn("processor", &format!("request rejected: {error}")) {
            warn!("failed to record rejection: {e:#}");
        }
        let clock_drift = matches!(error, EnvelopeError::Rejected(v) if v.is_clock_drift());
        ProcessOutcome::rejected(clock_drift)
    }

    /// Process one raw request envelope into a raw response envelope.
    pub async fn process(&self, raw: &str) -> ProcessOutcome {
        let (request, identity) = match self.open(raw).await {
            Ok(opened) => opened,
            Err(outcome) => return outcome,
        };

        let mut task = match self.registry.create_from_descriptor(&request.payload) {
            Ok(task) => task,
            Err(e) => {
                warn!("unusable request payload: {e:#}");
                return ProcessOutcome::rejected(false);
            }
        };

        let operation = task.operation().to_string();
        info!(%operation, "executing task");

        // Execute on a task of its own so a panic is caught at the join
        // instead of unwinding through the worker.
        let joined = tokio::spawn(async move {
            let result = task.execute().await;
            (result, task)
        })
        .await;
        let (result, mut task) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                warn!(%operation, "task execution panicked: {e}");
                if let Err(le) = self
                    .events
                    .critical(&operation, &format!("task panicked: {e}"))
                {
                    warn!("failed to record task failure: {le:#}");
                }
                return ProcessOutcome::rejected(false);
            }
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(%operation, "task execution failed: {e:#}");
                if let Err(le) = self
                    .events
                    .critical(&operation, &format!("task failed: {e:#}"))
                {
                    warn!("failed to record task failure: {le:#}");
                }
                return ProcessOutcome::rejected(false);
            }
        };

        if let Some(new_config) = task.take_new_config() {
            if let Err(e) = self.apply_config(new_config).await {
                warn!(%operation, "applying new configuration failed: {e:#}");
            }
        }

        match encrypt_response(&response, &request.nonce, &current_timestamp(), &identity) {
            Ok(sealed) => ProcessOutcome {
                response: sealed,
                clock_drift: false,
            },
            Err(e) => {
                warn!(%operation, "failed to seal response: {e}");
                ProcessOutcome::rejected(false)
            }
        }
    }

    /// Swap in a replacement configuration document and apply its
    /// host-level settings. Also used by the maintenance timer.
    pub async fn apply_config(&self, new_config: AgentConfig) -> anyhow::Result<()> {
        {
            let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
            *config = new_config;
        }
        let snapshot = self
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        self.provisioner.apply_environment(&snapshot).await?;
        self.provisioner.apply_app_version(&snapshot).await?;
        self.events
            .milestone("processor", "configuration document replaced")?;
        Ok(())
    }
}
