//! Task registry and dispatch.
//!
//! Decrypted request payloads are JSON descriptors naming an operation
//! and an optional parameter bag. The registry maps operation names to
//! task constructors; an unrecognized name still yields a task, one that
//! reports the failure in a well-formed response envelope instead of
//! tearing down the connection.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use hostagent_proto::response::generate_response;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use crate::config::AgentConfig;

/// A parameter name was bound more than once on the same task.
#[derive(Debug, Error)]
#[error("parameter {0:?} bound twice")]
pub struct BindError(pub String);

/// Insert-once parameter bag handed to tasks before execution.
#[derive(Default, Debug)]
pub struct TaskParams {
    values: HashMap<String, String>,
}

impl TaskParams {
    pub fn bind(&mut self, key: &str, value: String) -> Result<(), BindError> {
        if self.values.contains_key(key) {
            return Err(BindError(key.to_string()));
        }
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// One executable administration operation.
#[async_trait]
pub trait Task: Send {
    fn operation(&self) -> &str;

    /// Bind one request parameter. Duplicate names are an error.
    fn set_parameter(&mut self, key: &str, value: String) -> Result<(), BindError>;

    /// Run the task and produce a response envelope string.
    async fn execute(&mut self) -> Result<String>;

    /// Replacement configuration produced by this execution, if any.
    /// Taken once by the request processor after a successful run.
    fn take_new_config(&mut self) -> Option<AgentConfig> {
        None
    }
}

/// Wire shape of a decrypted request payload.
#[derive(Deserialize, Debug)]
pub struct TaskDescriptor {
    pub name: String,
    #[serde(default)]
    pub parameters: Option<Value>,
}

type TaskCtor = Box<dyn Fn() -> Box<dyn Task> + Send + Sync>;

#[derive(Default)]
pub struct TaskRegistry {
    ctors: HashMap<String, TaskCtor>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, ctor: F)
    where
        F: Fn() -> Box<dyn Task> + Send + Sync + 'static,
    {
        self.ctors.insert(name.to_string(), Box::new(ctor));
    }

    pub fn operations(&self) -> Vec<&str> {
        self.ctors.keys().map(String::as_str).collect()
    }

    /// Instantiate a task from a decrypted payload.
    ///
    /// A payload that is not valid descriptor JSON is the only hard
    /// error. Unknown operations and unusable parameters degrade to a
    /// runnable task or a logged skip so the caller always gets an
    /// envelope back.
    pub fn create_from_descriptor(&self, payload: &str) -> Result<Box<dyn Task>> {
        let descriptor: TaskDescriptor =
            serde_json::from_str(payload).map_err(|e| anyhow::anyhow!("bad task payload: {e}"))?;

        let mut task = match self.ctors.get(&descriptor.name) {
            Some(ctor) => ctor(),
            None => {
                warn!(operation = %descriptor.name, "no handler registered");
                Box::new(UnknownOperationTask {
                    name: descriptor.name.clone(),
                })
            }
        };

        match descriptor.parameters {
            None | Some(Value::Null) => {}
            Some(Value::Object(params)) => {
                for (key, value) in params {
                    match value {
                        Value::String(s) => task.set_parameter(&key, s)?,
                        other => {
                            warn!(operation = %descriptor.name, parameter = %key,
                                "skipping non-string parameter: {other}");
                        }
                    }
                }
            }
            Some(other) => {
                warn!(operation = %descriptor.name, "ignoring non-object parameter bag: {other}");
            }
        }

        Ok(task)
    }
}

/// Fallback task produced for operations with no registered handler.
pub struct UnknownOperationTask {
    name: String,
}

#[async_trait]
impl Task for UnknownOperationTask {
    fn operation(&self) -> &str {
        &self.name
    }

    fn set_parameter(&mut self, _key: &str, _value: String) -> Result<(), BindError> {
        Ok(())
    }

    async fn execute(&mut self) -> Result<String> {
        Ok(generate_response(
            &self.name,
            json!({
                "response": "failed",
                "message": format!("no registered handler for operation {:?}", self.name),
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTask {
        params: TaskParams,
    }

    #[async_trait]
    impl Task for EchoTask {
        fn operation(&self) -> &str {
            "Echo"
        }

        fn set_parameter(&mut self, key: &str, value: String) -> Result<(), BindError> {
            self.params.bind(key, value)
        }

        async fn execute(&mut self) -> Result<String> {
            let msg = self.params.get("message").unwrap_or("").to_string();
            Ok(generate_response("Echo", Value::String(msg)))
        }
    }

    fn registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register("Echo", || {
            Box::new(EchoTask {
                params: TaskParams::default(),
            })
        });
        registry
    }

    #[tokio::test]
    async fn dispatches_registered_operation() {
        let registry = registry();
        let mut task = registry
            .create_from_descriptor(r#"{"name":"Echo","parameters":{"message":"hi"}}"#)
            .unwrap();
        let response: Value = serde_json::from_str(&task.execute().await.unwrap()).unwrap();
        assert_eq!(response["operation"], "Echo");
        assert_eq!(response["response"], "hi");
    }

    #[tokio::test]
    async fn unknown_operation_still_yields_an_envelope() {
        let registry = registry();
        let mut task = registry
            .create_from_descriptor(r#"{"name":"Reformat"}"#)
            .unwrap();
        assert_eq!(task.operation(), "Reformat");

        let response: Value = serde_json::from_str(&task.execute().await.unwrap()).unwrap();
        assert_eq!(response["operation"], "Reformat");
        assert_eq!(response["response"], "failed");
    }

    #[test]
    fn malformed_payload_is_a_hard_error() {
        assert!(registry().create_from_descriptor("{{{").is_err());
    }

    #[test]
    fn duplicate_parameter_binding_fails() {
        let mut params = TaskParams::default();
        params.bind("log", "app".into()).unwrap();
        let err = params.bind("log", "other".into()).unwrap_err();
        assert_eq!(err.0, "log");
    }

    #[test]
    fn non_string_parameters_are_skipped() {
        let registry = registry();
        let task = registry
            .create_from_descriptor(r#"{"name":"Echo","parameters":{"message":"ok","count":3}}"#)
            .unwrap();
        assert_eq!(task.operation(), "Echo");
    }
}
