use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use command_tree::{codec, DynValue};
use schema::{CalculateArgs, ModuleManager};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Always-on reporting module: hostname and network interfaces of the
/// managed host. Its state is copied into the resource's attribute bag after
/// state collection so templates can reference it.
pub struct SystemManager;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub hostname: String,
    /// Interface name → addresses.
    pub interfaces: BTreeMap<String, Vec<String>>,
}

#[derive(Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Deserialize)]
struct IpAddrInfo {
    #[serde(default)]
    local: Option<String>,
}

#[async_trait]
impl ModuleManager for SystemManager {
    fn name(&self) -> &'static str {
        "system"
    }

    fn parse_instance(&self, _raw: &serde_json::Value) -> anyhow::Result<DynValue> {
        anyhow::bail!("the system module takes no configuration")
    }

    async fn get_state(&self, _query: DynValue) -> anyhow::Result<DynValue> {
        let hostname_out = Command::new("hostname")
            .output()
            .await
            .context("could not read the hostname")?;
        let hostname = String::from_utf8_lossy(&hostname_out.stdout).trim().to_string();

        let addr_out = Command::new("ip")
            .args(["-j", "addr"])
            .output()
            .await
            .context("could not list network interfaces")?;
        if !addr_out.status.success() {
            anyhow::bail!(
                "ip -j addr failed: {}",
                String::from_utf8_lossy(&addr_out.stderr).trim()
            );
        }
        let links: Vec<IpLink> =
            serde_json::from_slice(&addr_out.stdout).context("could not parse ip -j addr output")?;

        let mut interfaces = BTreeMap::new();
        for link in links {
            let addresses: Vec<String> =
                link.addr_info.into_iter().filter_map(|info| info.local).collect();
            interfaces.insert(link.ifname, addresses);
        }

        Ok(DynValue::new(SystemState {
            hostname,
            interfaces,
        }))
    }

    async fn calculate_commands(&self, _args: CalculateArgs<'_>) -> anyhow::Result<()> {
        // reporting only, nothing to change
        Ok(())
    }

    fn register_wire_types(&self) {
        codec::register_value::<SystemState>("system_state");
    }
}
