//! Pipeline tests against mock managers: the phase barrier, error
//! propagation between phases, and decommission discovery.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use command_tree::{Command, DynValue};
use convoy::deploy::{deploy, DeployOptions};
use convoy::template::SimpleTemplateSource;
use schema::{
    CalculateArgs, Config, Environment, Logger, ManagerSet, ModuleManager, Resource,
    ResourceManager, ResourceValue,
};

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<(String, Instant)>>>,
}

impl Recorder {
    fn record(&self, event: impl Into<String>) {
        self.events
            .lock()
            .expect("lock")
            .push((event.into(), Instant::now()));
    }

    fn when(&self, event: &str) -> Option<Instant> {
        self.events
            .lock()
            .expect("lock")
            .iter()
            .find(|(name, _)| name == event)
            .map(|(_, at)| *at)
    }

    fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .expect("lock")
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

struct MockValue {
    name: String,
}

impl ResourceValue for MockValue {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn value_name(resource: &Arc<dyn ResourceValue>) -> String {
    resource
        .as_any()
        .downcast_ref::<MockValue>()
        .map(|value| value.name.clone())
        .unwrap_or_default()
}

struct MockResourceManager {
    recorder: Recorder,
    delays: BTreeMap<String, Duration>,
    fail: Option<String>,
}

#[async_trait]
impl ResourceManager for MockResourceManager {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn parse_resource(
        &self,
        _raw: &serde_json::Value,
    ) -> anyhow::Result<Arc<dyn ResourceValue>> {
        Ok(Arc::new(MockValue {
            name: String::new(),
        }))
    }

    fn supports_provision(&self) -> bool {
        true
    }

    async fn provision(
        &self,
        _group: Option<&DynValue>,
        resource: &Arc<dyn ResourceValue>,
        logger: &dyn Logger,
    ) -> anyhow::Result<()> {
        let name = value_name(resource);
        if let Some(delay) = self.delays.get(&name) {
            tokio::time::sleep(*delay).await;
        }
        logger.log(format!("provisioned {name}"));
        self.recorder.record(format!("provisioned:{name}"));
        if self.fail.as_deref() == Some(name.as_str()) {
            anyhow::bail!("provisioning {name} blew up");
        }
        Ok(())
    }
}

struct MockModule {
    recorder: Recorder,
}

#[async_trait]
impl ModuleManager for MockModule {
    fn name(&self) -> &'static str {
        "mockmod"
    }

    fn parse_instance(&self, raw: &serde_json::Value) -> anyhow::Result<DynValue> {
        Ok(DynValue::new(raw.clone()))
    }

    async fn get_state(&self, _query: DynValue) -> anyhow::Result<DynValue> {
        Ok(DynValue::new(serde_json::Value::Null))
    }

    async fn calculate_commands(&self, args: CalculateArgs<'_>) -> anyhow::Result<()> {
        let name = args
            .scope
            .get("self")
            .and_then(|own| own.get("name"))
            .and_then(|name| name.as_str())
            .unwrap_or_default()
            .to_string();
        self.recorder.record(format!("calculated:{name}"));
        Ok(())
    }
}

fn build_environment(
    managers: &ManagerSet,
    resource_names: &[&str],
) -> (Arc<Config>, Arc<Environment>) {
    let manager = managers.resources.get("mock").expect("mock manager");
    let mut resources = BTreeMap::new();
    for name in resource_names {
        let mut resource = Resource::new(
            *name,
            Arc::clone(manager),
            Arc::new(MockValue {
                name: (*name).to_string(),
            }) as Arc<dyn ResourceValue>,
        );
        resource
            .modules
            .insert("mockmod".to_string(), vec![DynValue::new(serde_json::json!({}))]);
        resource.set_attribute("name", serde_json::Value::String((*name).to_string()));
        resources.insert((*name).to_string(), Arc::new(resource));
    }
    let environment = Arc::new(Environment {
        name: "test".to_string(),
        vars: BTreeMap::new(),
        groups: BTreeMap::new(),
        resources,
        resources_by_package: BTreeMap::new(),
        hooks: Vec::new(),
        decommission_tag: "convoy-test".to_string(),
    });
    let config = Arc::new(Config {
        environments: BTreeMap::from([("test".to_string(), Arc::clone(&environment))]),
        packages: BTreeMap::new(),
        template_source: Arc::new(SimpleTemplateSource::new()),
    });
    (config, environment)
}

fn options() -> DeployOptions {
    DeployOptions {
        workers: 4,
        allow_decommission: false,
        agent_bin: None,
    }
}

#[tokio::test]
async fn phases_advance_in_lock_step() {
    let recorder = Recorder::default();
    let managers = Arc::new(
        ManagerSet::default()
            .with_resource(Arc::new(MockResourceManager {
                recorder: recorder.clone(),
                delays: BTreeMap::from([("slow".to_string(), Duration::from_millis(200))]),
                fail: None,
            }))
            .with_module(Arc::new(MockModule {
                recorder: recorder.clone(),
            })),
    );
    let (config, environment) = build_environment(&managers, &["fast", "slow"]);

    let started = Instant::now();
    let ok = deploy(config, environment, managers, options())
        .await
        .expect("deploy");
    assert!(ok, "events: {:?}", recorder.names());
    assert!(started.elapsed() >= Duration::from_millis(200));

    // both resources were provisioned (phase 1) and calculated (phase 3),
    // and no calculation happened before the slow provision finished
    let names = recorder.names();
    assert_eq!(names.iter().filter(|n| n.starts_with("provisioned:")).count(), 2);
    assert_eq!(names.iter().filter(|n| n.starts_with("calculated:")).count(), 2);
    let slow_provisioned = recorder.when("provisioned:slow").expect("slow provision");
    for name in ["fast", "slow"] {
        let calculated = recorder.when(&format!("calculated:{name}")).expect("calculated");
        assert!(
            calculated >= slow_provisioned,
            "{name} entered phase 3 before the barrier"
        );
    }
}

#[tokio::test]
async fn a_failing_resource_stops_global_progression() {
    let recorder = Recorder::default();
    let managers = Arc::new(
        ManagerSet::default()
            .with_resource(Arc::new(MockResourceManager {
                recorder: recorder.clone(),
                delays: BTreeMap::new(),
                fail: Some("one".to_string()),
            }))
            .with_module(Arc::new(MockModule {
                recorder: recorder.clone(),
            })),
    );
    let (config, environment) = build_environment(&managers, &["one", "two"]);

    let ok = deploy(config, environment, managers, options())
        .await
        .expect("deploy");
    assert!(!ok);
    // phase 1 ran for both, nothing entered phase 3
    let names = recorder.names();
    assert_eq!(names.iter().filter(|n| n.starts_with("provisioned:")).count(), 2);
    assert!(names.iter().all(|n| !n.starts_with("calculated:")));
}

struct DiscoveringManager {
    recorder: Recorder,
}

#[async_trait]
impl ResourceManager for DiscoveringManager {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn parse_resource(
        &self,
        _raw: &serde_json::Value,
    ) -> anyhow::Result<Arc<dyn ResourceValue>> {
        Ok(Arc::new(MockValue {
            name: String::new(),
        }))
    }

    fn supports_discovery(&self) -> bool {
        true
    }

    async fn find_unused(
        &self,
        desired: &BTreeMap<String, Vec<String>>,
        decommission_tag: &str,
        decommission_root: &Command,
        _logger: &dyn Logger,
    ) -> anyhow::Result<Vec<String>> {
        assert_eq!(decommission_tag, "convoy-test");
        let known: Vec<&String> = desired.values().flatten().collect();
        assert!(!known.is_empty());
        let recorder = self.recorder.clone();
        decommission_root.add(
            "Remove old1",
            command_tree::ClosureCommand::new(move |cmd| {
                let recorder = recorder.clone();
                async move {
                    recorder.record("decommissioned:old1");
                    cmd.log("removed old1");
                }
            }),
        );
        Ok(vec!["old1".to_string()])
    }
}

#[tokio::test]
async fn decommission_is_advisory_by_default() {
    let recorder = Recorder::default();
    let managers = Arc::new(
        ManagerSet::default().with_resource(Arc::new(DiscoveringManager {
            recorder: recorder.clone(),
        })),
    );
    let (config, environment) = build_environment(&managers, &["only"]);

    let ok = deploy(config, environment, managers, options())
        .await
        .expect("deploy");
    assert!(ok);
    assert!(recorder.when("decommissioned:old1").is_none());
}

#[tokio::test]
async fn decommission_executes_when_allowed() {
    let recorder = Recorder::default();
    let managers = Arc::new(
        ManagerSet::default().with_resource(Arc::new(DiscoveringManager {
            recorder: recorder.clone(),
        })),
    );
    let (config, environment) = build_environment(&managers, &["only"]);

    let ok = deploy(
        config,
        environment,
        managers,
        DeployOptions {
            workers: 2,
            allow_decommission: true,
            agent_bin: None,
        },
    )
    .await
    .expect("deploy");
    assert!(ok);
    assert!(recorder.when("decommissioned:old1").is_some());
}
