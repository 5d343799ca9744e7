//! Agent configuration.
//!
//! The configuration is a JSON document delivered by the control plane
//! (first framed payload on the control channel) or loaded from disk for
//! local runs. Values are addressed by slash-separated paths so nested
//! sections stay cheap to reach, and the whole document can be swapped
//! atomically when an `UpdateConfiguration` task delivers a replacement.

use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hostagent_proto::envelope::HostIdentity;
use serde_json::Value;
use tracing::{info, warn};

/// Live configuration shared between the listener, the request
/// processor and the maintenance timer. Readers always observe either
/// the old or the new document in full.
pub type SharedConfig = Arc<RwLock<AgentConfig>>;

pub fn shared(config: AgentConfig) -> SharedConfig {
    Arc::new(RwLock::new(config))
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    doc: Value,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            doc: Value::Object(serde_json::Map::new()),
        }
    }
}

impl AgentConfig {
    pub fn new(json: &str) -> Result<Self> {
        let doc: Value = serde_json::from_str(json).context("configuration is not valid JSON")?;
        Ok(Self::from_value(doc))
    }

    pub fn from_value(doc: Value) -> Self {
        Self { doc }
    }

    /// Fetch a value by slash-separated path, rendered as a string.
    pub fn get(&self, path: &str) -> Option<String> {
        let mut node = &self.doc;
        for key in path.split('/') {
            node = node.get(key)?;
        }
        match node {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Set a string value by slash-separated path, creating intermediate
    /// objects as needed.
    pub fn set(&mut self, path: &str, value: &str) {
        if !self.doc.is_object() {
            self.doc = Value::Object(serde_json::Map::new());
        }
        let mut node = &mut self.doc;
        let mut parts = path.split('/').peekable();
        while let Some(key) = parts.next() {
            let map = match node.as_object_mut() {
                Some(m) => m,
                None => return,
            };
            if parts.peek().is_none() {
                map.insert(key.to_string(), Value::String(value.to_string()));
                return;
            }
            node = map
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
        }
    }

    pub fn instance_id(&self) -> Option<String> {
        self.get("instanceId")
    }

    pub fn reservation_id(&self) -> Option<String> {
        self.get("reservationId")
    }

    pub fn identity(&self) -> HostIdentity {
        HostIdentity::new(
            self.instance_id().unwrap_or_default(),
            self.reservation_id().unwrap_or_default(),
        )
    }

    pub fn application_version(&self) -> Option<String> {
        self.get("application/version")
    }

    pub fn healthcheck_url(&self) -> String {
        self.get("application/healthcheckUrl")
            .unwrap_or_else(|| "/".to_string())
    }

    pub fn service_port(&self) -> u16 {
        self.get("application/servicePort")
            .and_then(|p| p.parse().ok())
            .unwrap_or(80)
    }

    /// Version the control plane wants the agent itself to be running.
    pub fn available_agent_version(&self) -> Option<String> {
        self.get("agent/availableVersion")
    }

    /// Location to re-poll for a replacement configuration document.
    pub fn config_url(&self) -> Option<String> {
        self.get("agent/configUrl")
    }

    /// Named log directories scanned by the Tail task.
    pub fn log_locations(&self) -> Vec<(String, String)> {
        let Some(entries) = self.doc.get("logs").and_then(Value::as_array) else {
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(|entry| {
                let name = entry.get("name")?.as_str()?;
                let path = entry.get("path")?.as_str()?;
                Some((name.to_string(), path.to_string()))
            })
            .collect()
    }

    /// Reconcile stored identity with values fetched from the live host
    /// metadata source. Returns true when either stored value changed,
    /// which makes a failed decrypt eligible for its single retry.
    pub fn apply_verified_identity(
        &mut self,
        instance_id: Option<String>,
        reservation_id: Option<String>,
    ) -> bool {
        let mut changed = false;

        if let Some(fetched) = instance_id {
            if !self
                .instance_id()
                .map(|v| v.eq_ignore_ascii_case(&fetched))
                .unwrap_or(false)
            {
                warn!(expected = ?self.instance_id(), found = %fetched, "instance id updated from host metadata");
                self.set("instanceId", &fetched);
                changed = true;
            }
        }

        if let Some(fetched) = reservation_id {
            if !self
                .reservation_id()
                .map(|v| v.eq_ignore_ascii_case(&fetched))
                .unwrap_or(false)
            {
                warn!(expected = ?self.reservation_id(), found = %fetched, "reservation id updated from host metadata");
                self.set("reservationId", &fetched);
                changed = true;
            }
        }

        changed
    }
}

/// Live host identity lookup, consulted when a request fails to
/// authenticate against the stored identity.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn fetch_instance_id(&self) -> Option<String>;
    async fn fetch_reservation_id(&self) -> Option<String>;
}

/// Identity source backed by the instance metadata HTTP endpoint.
pub struct MetadataIdentitySource {
    base_url: String,
    http: reqwest::Client,
}

impl MetadataIdentitySource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    async fn fetch(&self, key: &str) -> Option<String> {
        let url = format!("{}/{key}", self.base_url.trim_end_matches('/'));
        info!(%url, "fetching host metadata");
        match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                resp.text().await.ok().map(|v| v.trim().to_string())
            }
            Ok(resp) => {
                warn!(%url, status = %resp.status(), "host metadata lookup failed");
                None
            }
            Err(e) => {
                warn!(%url, "host metadata lookup failed: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl IdentitySource for MetadataIdentitySource {
    async fn fetch_instance_id(&self) -> Option<String> {
        self.fetch("instance-id").await
    }

    async fn fetch_reservation_id(&self) -> Option<String> {
        self.fetch("reservation-id").await
    }
}

/// Fixed identity source for tests and for hosts without a metadata
/// endpoint.
pub struct StaticIdentitySource {
    pub instance_id: Option<String>,
    pub reservation_id: Option<String>,
}

#[async_trait]
impl IdentitySource for StaticIdentitySource {
    async fn fetch_instance_id(&self) -> Option<String> {
        self.instance_id.clone()
    }

    async fn fetch_reservation_id(&self) -> Option<String> {
        self.reservation_id.clone()
    }
}
