//! Two- and three-node convergence over loopback UDP: membership via
//! seed join, agreement replication, plugin/task side effects, and
//! late-joiner catch-up.

use async_trait::async_trait;
use oxtel_common::error::CoreResult;
use oxtel_common::event::{Event, EventHandler};
use oxtel_common::manage::TribeDelegate;
use oxtel_common::types::{PluginId, PluginType, ScheduleSpec, TaskManifest};
use oxtel_tribe::{Tribe, TribeConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct Recording {
    loads: Mutex<Vec<PluginId>>,
    unloads: Mutex<Vec<PluginId>>,
    created: Mutex<Vec<Uuid>>,
}

impl Recording {
    fn loads(&self) -> Vec<PluginId> {
        self.loads.lock().unwrap().clone()
    }
    fn created(&self) -> Vec<Uuid> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl TribeDelegate for Recording {
    async fn load_plugin(&self, id: &PluginId, _origin_rest: Option<&str>) -> CoreResult<()> {
        self.loads.lock().unwrap().push(id.clone());
        Ok(())
    }

    async fn unload_plugin(&self, id: &PluginId) -> CoreResult<()> {
        self.unloads.lock().unwrap().push(id.clone());
        Ok(())
    }

    async fn create_task(&self, id: Uuid, _manifest: &TaskManifest) -> CoreResult<()> {
        self.created.lock().unwrap().push(id);
        Ok(())
    }

    async fn start_task(&self, _id: Uuid) -> CoreResult<()> {
        Ok(())
    }

    async fn stop_task(&self, _id: Uuid) -> CoreResult<()> {
        Ok(())
    }

    async fn remove_task(&self, _id: Uuid) -> CoreResult<()> {
        Ok(())
    }
}

fn config(name: &str, seed: Option<std::net::SocketAddr>) -> TribeConfig {
    TribeConfig {
        node_name: name.to_string(),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        seed,
        rest_addr: Some(format!("{name}:8181")),
        gossip_interval: Duration::from_millis(100),
        probe_timeout: Duration::from_millis(300),
        suspect_timeout: Duration::from_millis(800),
        failed_grace: Duration::from_secs(3600),
        anti_entropy_interval: Duration::from_millis(300),
    }
}

async fn node(name: &str, seed: Option<std::net::SocketAddr>) -> (Arc<Tribe>, Arc<Recording>) {
    let tribe = Tribe::new(config(name, seed)).await.unwrap();
    let delegate = Arc::new(Recording::default());
    tribe.set_delegate(delegate.clone());
    tribe.start();
    (tribe, delegate)
}

fn mock_plugin() -> PluginId {
    PluginId::new(PluginType::Collector, "mock", 1)
}

fn manifest() -> TaskManifest {
    TaskManifest {
        name: Some("replicated".to_string()),
        schedule: ScheduleSpec {
            interval_ms: 1000,
            start: None,
            stop: None,
            duration_ms: None,
        },
        workflow: serde_json::json!({
            "collect": {
                "metrics": { "/intel/mock/foo": 0 },
                "publish": [ { "plugin_name": "file" } ]
            }
        }),
        no_start: false,
    }
}

#[tokio::test]
async fn members_and_agreements_converge_across_nodes() {
    let (n1, _d1) = node("node-1", None).await;
    let (n2, d2) = node("node-2", Some(n1.local_addr())).await;

    // seed join propagates membership both ways
    tokio::time::sleep(Duration::from_millis(600)).await;
    let names: Vec<String> = n1.members().into_iter().map(|m| m.name).collect();
    assert!(names.contains(&"node-2".to_string()), "seed sees joiner");
    let names: Vec<String> = n2.members().into_iter().map(|m| m.name).collect();
    assert!(names.contains(&"node-1".to_string()), "joiner sees seed");

    n1.add_agreement("deploy").unwrap();
    n1.join_agreement("deploy", "node-1").unwrap();
    n1.join_agreement("deploy", "node-2").unwrap();

    // node-1 loads a plugin and creates a task; tribe observes the
    // events exactly as the daemon's event bus would deliver them
    n1.handle_event(&Event::PluginLoaded {
        id: mock_plugin(),
        signed: false,
    });
    let task_id = Uuid::new_v4();
    n1.handle_event(&Event::TaskCreated {
        id: task_id,
        manifest: manifest(),
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    // node-2 applied the side effects
    assert_eq!(d2.loads(), vec![mock_plugin()]);
    assert_eq!(d2.created(), vec![task_id]);

    // and both nodes hold identical agreement content
    let a1 = n1.agreement("deploy").unwrap();
    let a2 = n2.agreement("deploy").unwrap();
    assert_eq!(a1.plugin_entries(), a2.plugin_entries());
    assert_eq!(
        a1.task_entries().len(),
        a2.task_entries().len()
    );
    assert_eq!(a1.member_names(), a2.member_names());

    n2.shutdown().await;
    n1.shutdown().await;
}

#[tokio::test]
async fn late_joiner_catches_up_on_existing_agreement_content() {
    let (n1, _d1) = node("alpha", None).await;

    n1.add_agreement("fleet").unwrap();
    n1.join_agreement("fleet", "alpha").unwrap();
    n1.handle_event(&Event::PluginLoaded {
        id: mock_plugin(),
        signed: true,
    });

    let (n3, d3) = node("gamma", Some(n1.local_addr())).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    // gamma knows the agreement but is not yet a member: no side effects
    assert!(n3.agreement("fleet").is_ok());
    assert!(d3.loads().is_empty());

    n1.join_agreement("fleet", "gamma").unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(d3.loads(), vec![mock_plugin()]);

    n3.shutdown().await;
    n1.shutdown().await;
}

#[tokio::test]
async fn non_members_record_state_but_run_nothing() {
    let (n1, _d1) = node("solo-1", None).await;
    let (n2, d2) = node("solo-2", Some(n1.local_addr())).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    n1.add_agreement("private").unwrap();
    n1.join_agreement("private", "solo-1").unwrap();
    n1.handle_event(&Event::PluginLoaded {
        id: mock_plugin(),
        signed: false,
    });

    tokio::time::sleep(Duration::from_secs(1)).await;

    // replicated state is visible, but solo-2 is not a member so no
    // local load happened
    let agreement = n2.agreement("private").unwrap();
    assert_eq!(agreement.plugin_entries().len(), 1);
    assert!(d2.loads().is_empty());

    n2.shutdown().await;
    n1.shutdown().await;
}
