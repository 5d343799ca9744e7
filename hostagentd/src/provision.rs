//! Host provisioning hooks.
//!
//! The agent itself never knows how the application server is installed;
//! it hands environment changes and restart requests to a provisioner.
//! The default implementation only logs, which is the right behavior for
//! local runs and for hosts where an init system owns the app lifecycle.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::config::AgentConfig;

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Apply host-level settings carried by a new configuration document.
    async fn apply_environment(&self, config: &AgentConfig) -> Result<()>;

    /// Move the application to the version named by the configuration.
    async fn apply_app_version(&self, config: &AgentConfig) -> Result<()>;

    /// Restart the application server process.
    async fn restart_app_server(&self) -> Result<()>;
}

/// Provisioner that records intent in the log and does nothing else.
pub struct NoopProvisioner;

#[async_trait]
impl Provisioner for NoopProvisioner {
    async fn apply_environment(&self, config: &AgentConfig) -> Result<()> {
        info!(port = config.service_port(), "environment settings applied");
        Ok(())
    }

    async fn apply_app_version(&self, config: &AgentConfig) -> Result<()> {
        info!(version = ?config.application_version(), "application version applied");
        Ok(())
    }

    async fn restart_app_server(&self) -> Result<()> {
        info!("application server restart requested");
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records calls so tests can assert provisioning side effects.
    #[derive(Default)]
    pub struct RecordingProvisioner {
        pub calls: Mutex<Vec<String>>,
    }

    impl RecordingProvisioner {
        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Provisioner for RecordingProvisioner {
        async fn apply_environment(&self, _config: &AgentConfig) -> Result<()> {
            self.record("apply_environment");
            Ok(())
        }

        async fn apply_app_version(&self, _config: &AgentConfig) -> Result<()> {
            self.record("apply_app_version");
            Ok(())
        }

        async fn restart_app_server(&self) -> Result<()> {
            self.record("restart_app_server");
            Ok(())
        }
    }
}
