//! Built-in administration tasks.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use hostagent_proto::envelope::parse_timestamp;
use hostagent_proto::response::generate_response;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::{AgentConfig, SharedConfig};
use crate::events::EventLog;
use crate::provision::Provisioner;
use crate::registry::{BindError, Task, TaskParams, TaskRegistry};
use crate::AGENT_VERSION;

pub const OP_STATUS: &str = "Status";
pub const OP_TAIL: &str = "Tail";
pub const OP_SYSTEM_INFO: &str = "SystemInfo";
pub const OP_EVENTS: &str = "Events";
pub const OP_RESTART_APP_SERVER: &str = "RestartAppServer";
pub const OP_UPDATE_APP_VERSION: &str = "UpdateAppVersion";
pub const OP_UPDATE_CONFIGURATION: &str = "UpdateConfiguration";

const TAIL_DEFAULT_LINES: usize = 200;

/// Fetches replacement configuration documents on behalf of the
/// UpdateConfiguration task and the maintenance timer.
#[async_trait]
pub trait ConfigFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<AgentConfig>;
}

/// Fetcher backed by a plain HTTP GET of the configured location.
pub struct HttpConfigFetcher {
    http: reqwest::Client,
}

impl HttpConfigFetcher {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpConfigFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigFetcher for HttpConfigFetcher {
    async fn fetch(&self, url: &str) -> Result<AgentConfig> {
        info!(%url, "fetching replacement configuration");
        let body = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("configuration fetch from {url} failed"))?
            .error_for_status()
            .with_context(|| format!("configuration fetch from {url} rejected"))?
            .text()
            .await?;
        AgentConfig::new(&body)
    }
}

/// Shared dependencies handed to every task constructor.
#[derive(Clone)]
pub struct TaskContext {
    pub config: SharedConfig,
    pub events: Arc<EventLog>,
    pub provisioner: Arc<dyn Provisioner>,
    pub fetcher: Arc<dyn ConfigFetcher>,
    /// High-water mark of events already reported by a Status response.
    pub status_marker: Arc<Mutex<DateTime<Utc>>>,
}

impl TaskContext {
    pub fn new(
        config: SharedConfig,
        events: Arc<EventLog>,
        provisioner: Arc<dyn Provisioner>,
        fetcher: Arc<dyn ConfigFetcher>,
    ) -> Self {
        Self {
            config,
            events,
            provisioner,
            fetcher,
            status_marker: Arc::new(Mutex::new(Utc::now())),
        }
    }

    fn snapshot(&self) -> AgentConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Registry with every built-in operation registered.
pub fn standard_registry(ctx: TaskContext) -> TaskRegistry {
    let mut registry = TaskRegistry::new();

    let c = ctx.clone();
    registry.register(OP_STATUS, move || Box::new(StatusTask { ctx: c.clone() }));

    let c = ctx.clone();
    registry.register(OP_TAIL, move || {
        Box::new(TailTask {
            ctx: c.clone(),
            params: TaskParams::default(),
        })
    });

    registry.register(OP_SYSTEM_INFO, || Box::new(SystemInfoTask));

    let c = ctx.clone();
    registry.register(OP_EVENTS, move || {
        Box::new(EventsTask {
            ctx: c.clone(),
            params: TaskParams::default(),
        })
    });

    let c = ctx.clone();
    registry.register(OP_RESTART_APP_SERVER, move || {
        Box::new(RestartAppServerTask { ctx: c.clone() })
    });

    let c = ctx.clone();
    registry.register(OP_UPDATE_APP_VERSION, move || {
        Box::new(UpdateAppVersionTask {
            ctx: c.clone(),
            params: TaskParams::default(),
        })
    });

    let c = ctx;
    registry.register(OP_UPDATE_CONFIGURATION, move || {
        Box::new(UpdateConfigurationTask {
            ctx: c.clone(),
            new_config: None,
        })
    });

    registry
}

/// Reports versions and every event recorded since the last report.
pub struct StatusTask {
    ctx: TaskContext,
}

#[async_trait]
impl Task for StatusTask {
    fn operation(&self) -> &str {
        OP_STATUS
    }

    fn set_parameter(&mut self, _key: &str, _value: String) -> Result<(), BindError> {
        Ok(())
    }

    async fn execute(&mut self) -> Result<String> {
        let since = *self
            .ctx
            .status_marker
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let events = self.ctx.events.load_since(since)?;
        *self
            .ctx
            .status_marker
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Utc::now();

        let config = self.ctx.snapshot();
        Ok(generate_response(
            OP_STATUS,
            json!({
                "agentVersion": AGENT_VERSION,
                "applicationVersion": config.application_version(),
                "events": events,
            }),
        ))
    }
}

/// Returns the tail of the newest file in a configured log location,
/// base64-encoded so arbitrary log bytes survive the JSON envelope.
pub struct TailTask {
    ctx: TaskContext,
    params: TaskParams,
}

impl TailTask {
    fn resolve_directory(&self, name: &str) -> Option<PathBuf> {
        self.ctx
            .snapshot()
            .log_locations()
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, path)| PathBuf::from(path))
    }

    fn newest_file(dir: &PathBuf) -> Result<Option<PathBuf>> {
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("cannot read log directory {}", dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            if newest.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
                newest = Some((modified, entry.path()));
            }
        }
        Ok(newest.map(|(_, path)| path))
    }

    fn last_lines(contents: &str, count: usize) -> String {
        let lines: Vec<&str> = contents.lines().collect();
        let start = lines.len().saturating_sub(count);
        lines[start..].join("\n")
    }
}

#[async_trait]
impl Task for TailTask {
    fn operation(&self) -> &str {
        OP_TAIL
    }

    fn set_parameter(&mut self, key: &str, value: String) -> Result<(), BindError> {
        self.params.bind(key, value)
    }

    async fn execute(&mut self) -> Result<String> {
        let Some(name) = self.params.get("log").map(str::to_string) else {
            return Ok(generate_response(
                OP_TAIL,
                json!({"response": "failed", "message": "missing required parameter \"log\""}),
            ));
        };
        let lines = self
            .params
            .get("lines")
            .and_then(|v| v.parse().ok())
            .unwrap_or(TAIL_DEFAULT_LINES);

        let Some(dir) = self.resolve_directory(&name) else {
            return Ok(generate_response(
                OP_TAIL,
                json!({"response": "failed", "message": format!("unknown log location {name:?}")}),
            ));
        };

        let Some(file) = Self::newest_file(&dir)? else {
            return Ok(generate_response(
                OP_TAIL,
                json!({"response": "failed", "message": format!("no files under {}", dir.display())}),
            ));
        };

        let contents = tokio::fs::read_to_string(&file)
            .await
            .with_context(|| format!("cannot read {}", file.display()))?;
        let tail = Self::last_lines(&contents, lines);

        Ok(generate_response(
            OP_TAIL,
            json!({
                "file": file.display().to_string(),
                "tail": general_purpose::STANDARD.encode(tail),
            }),
        ))
    }
}

/// Reports agent version and basic process facts.
pub struct SystemInfoTask;

#[async_trait]
impl Task for SystemInfoTask {
    fn operation(&self) -> &str {
        OP_SYSTEM_INFO
    }

    fn set_parameter(&mut self, _key: &str, _value: String) -> Result<(), BindError> {
        Ok(())
    }

    async fn execute(&mut self) -> Result<String> {
        Ok(generate_response(
            OP_SYSTEM_INFO,
            json!({
                "agentVersion": AGENT_VERSION,
                "pid": std::process::id(),
                "os": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
            }),
        ))
    }
}

/// Returns recorded events inside an explicit time range.
pub struct EventsTask {
    ctx: TaskContext,
    params: TaskParams,
}

#[async_trait]
impl Task for EventsTask {
    fn operation(&self) -> &str {
        OP_EVENTS
    }

    fn set_parameter(&mut self, key: &str, value: String) -> Result<(), BindError> {
        self.params.bind(key, value)
    }

    async fn execute(&mut self) -> Result<String> {
        let start = self
            .params
            .get("startTime")
            .and_then(parse_timestamp)
            .unwrap_or_else(|| Utc::now() - chrono::Duration::hours(24));
        let end = self
            .params
            .get("endTime")
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);

        let events = self.ctx.events.load_range(start, end)?;
        Ok(generate_response(OP_EVENTS, json!({ "events": events })))
    }
}

/// Restarts the application server through the provisioner.
pub struct RestartAppServerTask {
    ctx: TaskContext,
}

#[async_trait]
impl Task for RestartAppServerTask {
    fn operation(&self) -> &str {
        OP_RESTART_APP_SERVER
    }

    fn set_parameter(&mut self, _key: &str, _value: String) -> Result<(), BindError> {
        Ok(())
    }

    async fn execute(&mut self) -> Result<String> {
        match self.ctx.provisioner.restart_app_server().await {
            Ok(()) => {
                self.ctx
                    .events
                    .milestone(OP_RESTART_APP_SERVER, "application server restarted")?;
                Ok(generate_response(OP_RESTART_APP_SERVER, json!({})))
            }
            Err(e) => {
                warn!("application server restart failed: {e:#}");
                self.ctx
                    .events
                    .critical(OP_RESTART_APP_SERVER, &format!("restart failed: {e:#}"))?;
                Ok(generate_response(
                    OP_RESTART_APP_SERVER,
                    json!({"response": "failed", "message": e.to_string()}),
                ))
            }
        }
    }
}

/// Moves the application to a new version through the provisioner. An
/// optional `version` parameter updates the configured target first;
/// otherwise the version already in the configuration is applied.
pub struct UpdateAppVersionTask {
    ctx: TaskContext,
    params: TaskParams,
}

#[async_trait]
impl Task for UpdateAppVersionTask {
    fn operation(&self) -> &str {
        OP_UPDATE_APP_VERSION
    }

    fn set_parameter(&mut self, key: &str, value: String) -> Result<(), BindError> {
        self.params.bind(key, value)
    }

    async fn execute(&mut self) -> Result<String> {
        if let Some(version) = self.params.get("version") {
            let mut config = self
                .ctx
                .config
                .write()
                .unwrap_or_else(|e| e.into_inner());
            config.set("application/version", version);
        }

        let snapshot = self.ctx.snapshot();
        match self.ctx.provisioner.apply_app_version(&snapshot).await {
            Ok(()) => {
                let version = snapshot.application_version().unwrap_or_default();
                self.ctx.events.milestone(
                    OP_UPDATE_APP_VERSION,
                    &format!("application moved to version {version:?}"),
                )?;
                Ok(generate_response(
                    OP_UPDATE_APP_VERSION,
                    json!({ "version": version }),
                ))
            }
            Err(e) => {
                warn!("application version update failed: {e:#}");
                self.ctx
                    .events
                    .critical(OP_UPDATE_APP_VERSION, &format!("update failed: {e:#}"))?;
                Ok(generate_response(
                    OP_UPDATE_APP_VERSION,
                    json!({"response": "failed", "message": e.to_string()}),
                ))
            }
        }
    }
}

/// Fetches a replacement configuration document. The new document is
/// surfaced through `take_new_config` so the request processor can swap
/// it in and apply host-level changes after the task completes.
pub struct UpdateConfigurationTask {
    ctx: TaskContext,
    new_config: Option<AgentConfig>,
}

#[async_trait]
impl Task for UpdateConfigurationTask {
    fn operation(&self) -> &str {
        OP_UPDATE_CONFIGURATION
    }

    fn set_parameter(&mut self, _key: &str, _value: String) -> Result<(), BindError> {
        Ok(())
    }

    async fn execute(&mut self) -> Result<String> {
        let Some(url) = self.ctx.snapshot().config_url() else {
            return Ok(generate_response(
                OP_UPDATE_CONFIGURATION,
                json!({"response": "failed", "message": "no configuration url set"}),
            ));
        };

        match self.ctx.fetcher.fetch(&url).await {
            Ok(config) => {
                self.new_config = Some(config);
                self.ctx
                    .events
                    .milestone(OP_UPDATE_CONFIGURATION, "new configuration fetched")?;
                Ok(generate_response(OP_UPDATE_CONFIGURATION, json!({})))
            }
            Err(e) => {
                warn!("configuration update failed: {e:#}");
                self.ctx
                    .events
                    .warn(OP_UPDATE_CONFIGURATION, &format!("update failed: {e:#}"))?;
                Ok(generate_response(
                    OP_UPDATE_CONFIGURATION,
                    json!({"response": "failed", "message": e.to_string()}),
                ))
            }
        }
    }

    fn take_new_config(&mut self) -> Option<AgentConfig> {
        self.new_config.take()
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Fetcher returning a canned document.
    pub struct StaticConfigFetcher(pub AgentConfig);

    #[async_trait]
    impl ConfigFetcher for StaticConfigFetcher {
        async fn fetch(&self, _url: &str) -> Result<AgentConfig> {
            Ok(self.0.clone())
        }
    }

    /// Fetcher that always fails.
    pub struct FailingConfigFetcher;

    #[async_trait]
    impl ConfigFetcher for FailingConfigFetcher {
        async fn fetch(&self, url: &str) -> Result<AgentConfig> {
            anyhow::bail!("unreachable configuration url {url}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::config;
    use crate::provision::testing::RecordingProvisioner;
    use tempfile::TempDir;

    fn context(fetcher: Arc<dyn ConfigFetcher>) -> (TaskContext, TempDir, Arc<RecordingProvisioner>) {
        let dir = TempDir::new().unwrap();
        let events = Arc::new(EventLog::open(dir.path().join("events.jsonl")).unwrap());
        let provisioner = Arc::new(RecordingProvisioner::default());
        let cfg = AgentConfig::new(
            &format!(
                r#"{{
                    "instanceId": "i-8e4e00ca",
                    "reservationId": "r-f41760b0",
                    "application": {{"version": "1.2.3"}},
                    "agent": {{"configUrl": "http://localhost/config.json"}},
                    "logs": [{{"name": "app", "path": {:?}}}]
                }}"#,
                dir.path().join("logs").display().to_string()
            ),
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        let ctx = TaskContext::new(config::shared(cfg), events, provisioner.clone(), fetcher);
        (ctx, dir, provisioner)
    }

    fn parsed(raw: String) -> Value {
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn status_reports_versions_and_drains_events() {
        let (ctx, _dir, _) = context(Arc::new(FailingConfigFetcher));
        ctx.events.info("test", "something happened").unwrap();

        let mut task = StatusTask { ctx: ctx.clone() };
        let first = parsed(task.execute().await.unwrap());
        assert_eq!(first["operation"], "Status");
        assert_eq!(first["response"], "ok");
        assert_eq!(first["agentVersion"], AGENT_VERSION);
        assert_eq!(first["applicationVersion"], "1.2.3");
        assert_eq!(first["events"].as_array().unwrap().len(), 1);

        // Reported events are not repeated on the next call.
        let mut task = StatusTask { ctx };
        let second = parsed(task.execute().await.unwrap());
        assert!(second["events"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tail_returns_newest_file_contents() {
        let (ctx, dir, _) = context(Arc::new(FailingConfigFetcher));
        let logs = dir.path().join("logs");
        std::fs::write(logs.join("app.log"), "one\ntwo\nthree\n").unwrap();

        let mut task = TailTask {
            ctx,
            params: TaskParams::default(),
        };
        task.set_parameter("log", "app".into()).unwrap();
        task.set_parameter("lines", "2".into()).unwrap();

        let response = parsed(task.execute().await.unwrap());
        assert_eq!(response["response"], "ok");
        let tail = general_purpose::STANDARD
            .decode(response["tail"].as_str().unwrap())
            .unwrap();
        assert_eq!(String::from_utf8(tail).unwrap(), "two\nthree");
    }

    #[tokio::test]
    async fn tail_without_log_parameter_fails_cleanly() {
        let (ctx, _dir, _) = context(Arc::new(FailingConfigFetcher));
        let mut task = TailTask {
            ctx,
            params: TaskParams::default(),
        };
        let response = parsed(task.execute().await.unwrap());
        assert_eq!(response["response"], "failed");
    }

    #[tokio::test]
    async fn restart_invokes_provisioner() {
        let (ctx, _dir, provisioner) = context(Arc::new(FailingConfigFetcher));
        let mut task = RestartAppServerTask { ctx };
        let response = parsed(task.execute().await.unwrap());
        assert_eq!(response["response"], "ok");
        assert_eq!(provisioner.calls(), vec!["restart_app_server"]);
    }

    #[tokio::test]
    async fn update_app_version_applies_requested_version() {
        let (ctx, _dir, provisioner) = context(Arc::new(FailingConfigFetcher));
        let mut task = UpdateAppVersionTask {
            ctx: ctx.clone(),
            params: TaskParams::default(),
        };
        task.set_parameter("version", "4.0.0".into()).unwrap();

        let response = parsed(task.execute().await.unwrap());
        assert_eq!(response["response"], "ok");
        assert_eq!(response["version"], "4.0.0");
        assert_eq!(provisioner.calls(), vec!["apply_app_version"]);
        assert_eq!(ctx.snapshot().application_version().unwrap(), "4.0.0");
    }

    #[tokio::test]
    async fn update_app_version_defaults_to_configured_version() {
        let (ctx, _dir, provisioner) = context(Arc::new(FailingConfigFetcher));
        let mut task = UpdateAppVersionTask {
            ctx,
            params: TaskParams::default(),
        };

        let response = parsed(task.execute().await.unwrap());
        assert_eq!(response["version"], "1.2.3");
        assert_eq!(provisioner.calls(), vec!["apply_app_version"]);
    }

    #[tokio::test]
    async fn update_configuration_surfaces_new_document() {
        let mut replacement = AgentConfig::default();
        replacement.set("application/version", "2.0.0");
        let (ctx, _dir, _) = context(Arc::new(StaticConfigFetcher(replacement)));

        let mut task = UpdateConfigurationTask {
            ctx,
            new_config: None,
        };
        let response = parsed(task.execute().await.unwrap());
        assert_eq!(response["response"], "ok");

        let new = task.take_new_config().unwrap();
        assert_eq!(new.application_version().unwrap(), "2.0.0");
        // The document is taken exactly once.
        assert!(task.take_new_config().is_none());
    }

    #[tokio::test]
    async fn update_configuration_fetch_failure_reports_failed() {
        let (ctx, _dir, _) = context(Arc::new(FailingConfigFetcher));
        let mut task = UpdateConfigurationTask {
            ctx,
            new_config: None,
        };
        let response = parsed(task.execute().await.unwrap());
        assert_eq!(response["response"], "failed");
        assert!(task.take_new_config().is_none());
    }

    #[tokio::test]
    async fn system_info_reports_agent_version() {
        let mut task = SystemInfoTask;
        let response = parsed(task.execute().await.unwrap());
        assert_eq!(response["agentVersion"], AGENT_VERSION);
        assert_eq!(response["os"], std::env::consts::OS);
    }
}
