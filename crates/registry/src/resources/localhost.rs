use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use connection::LocalConnection;
use schema::{Connection, ResourceManager, ResourceValue, ServerResource};

/// The machine convoy itself runs on, useful for driving local state and for
/// exercising the pipeline without a network.
pub struct LocalhostManager;

#[async_trait]
impl ResourceManager for LocalhostManager {
    fn name(&self) -> &'static str {
        "localhost"
    }

    fn parse_resource(&self, _raw: &serde_json::Value) -> anyhow::Result<Arc<dyn ResourceValue>> {
        Ok(Arc::new(LocalhostValue))
    }
}

pub struct LocalhostValue;

impl ResourceValue for LocalhostValue {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_server(&self) -> Option<&dyn ServerResource> {
        Some(self)
    }
}

#[async_trait]
impl ServerResource for LocalhostValue {
    async fn open_connection(&self) -> anyhow::Result<Arc<dyn Connection>> {
        Ok(Arc::new(LocalConnection::new()))
    }
}
