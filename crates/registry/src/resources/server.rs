use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use connection::{SshConnection, SshSettings};
use schema::{Connection, ResourceManager, ResourceValue, ServerResource};
use serde::Deserialize;

fn default_port() -> u16 {
    22
}

fn default_username() -> String {
    "root".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// An explicitly addressed machine reachable over SSH. The plainest resource
/// kind: no provisioning, no discovery, just a connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSpec {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

pub struct ServerManager;

#[async_trait]
impl ResourceManager for ServerManager {
    fn name(&self) -> &'static str {
        "server"
    }

    fn parse_resource(&self, raw: &serde_json::Value) -> anyhow::Result<Arc<dyn ResourceValue>> {
        let spec: ServerSpec =
            serde_json::from_value(raw.clone()).context("bad server resource configuration")?;
        Ok(Arc::new(ServerValue { spec }))
    }
}

pub struct ServerValue {
    spec: ServerSpec,
}

impl ResourceValue for ServerValue {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_server(&self) -> Option<&dyn ServerResource> {
        Some(self)
    }
}

#[async_trait]
impl ServerResource for ServerValue {
    async fn open_connection(&self) -> anyhow::Result<Arc<dyn Connection>> {
        let connection = SshConnection::connect(SshSettings {
            host: self.spec.host.clone(),
            port: self.spec.port,
            username: self.spec.username.clone(),
            password: self.spec.password.clone(),
            private_key: self.spec.private_key.clone(),
            connect_timeout: Duration::from_secs(self.spec.connect_timeout_secs.max(1)),
        })
        .await?;
        Ok(Arc::new(connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_sparse_config() {
        let raw = serde_json::json!({"host": "10.0.0.4"});
        let value = ServerManager.parse_resource(&raw).expect("parse");
        let server = value.as_any().downcast_ref::<ServerValue>().expect("type");
        assert_eq!(server.spec.port, 22);
        assert_eq!(server.spec.username, "root");
        assert!(value.as_server().is_some());
    }

    #[test]
    fn missing_host_is_rejected() {
        let raw = serde_json::json!({"port": 22});
        assert!(ServerManager.parse_resource(&raw).is_err());
    }
}
