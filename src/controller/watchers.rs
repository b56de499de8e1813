//! Watch loops feeding the controller
//!
//! Nodes carry no owner reference, so a material node change re-triggers
//! every DeviceConfig. DaemonSet and worker pod events are resolved to their
//! owning DeviceConfig and handled directly. A DaemonSet only re-triggers its
//! owner's full reconcile on a generation or deletion transition; counter
//! updates stay on the aggregation path.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use futures::channel::mpsc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, warn};

use crate::crd::DeviceConfig;

use super::labels::WORKER_ACTION_LABEL;
use super::ownership::owning_device_config;
use super::status::StatusAggregator;
use super::worker::WorkerManager;

/// The node fields whose change can alter a binding decision
#[derive(Clone, Debug, PartialEq, Eq)]
struct NodeSnapshot {
    kernel_version: String,
    boot_id: String,
    generation: Option<i64>,
    labels: BTreeMap<String, String>,
}

impl NodeSnapshot {
    fn of(node: &Node) -> Self {
        let info = node.status.as_ref().and_then(|s| s.node_info.as_ref());
        Self {
            kernel_version: info.map(|i| i.kernel_version.clone()).unwrap_or_default(),
            boot_id: info.map(|i| i.boot_id.clone()).unwrap_or_default(),
            generation: node.metadata.generation,
            labels: node.labels().clone(),
        }
    }
}

/// Drops node updates that cannot change any binding decision
#[derive(Default)]
pub struct NodeChangeFilter {
    seen: HashMap<String, NodeSnapshot>,
}

impl NodeChangeFilter {
    /// Record `event` and tell whether DeviceConfigs need re-evaluation
    pub fn should_trigger(&mut self, event: &Event<Node>) -> bool {
        match event {
            Event::Applied(node) => {
                let snapshot = NodeSnapshot::of(node);
                match self.seen.insert(node.name_any(), snapshot.clone()) {
                    Some(previous) => previous != snapshot,
                    None => true,
                }
            }
            Event::Deleted(node) => {
                self.seen.remove(&node.name_any());
                true
            }
            Event::Restarted(nodes) => {
                self.seen = nodes
                    .iter()
                    .map(|node| (node.name_any(), NodeSnapshot::of(node)))
                    .collect();
                true
            }
        }
    }
}

/// Generation and deletion state last seen per DaemonSet
#[derive(Default)]
pub struct DaemonSetChangeFilter {
    seen: HashMap<(String, String), (Option<i64>, bool)>,
}

impl DaemonSetChangeFilter {
    /// Record `ds` and tell whether its owner needs a full reconcile
    pub fn should_trigger(&mut self, ds: &DaemonSet) -> bool {
        let key = (ds.namespace().unwrap_or_default(), ds.name_any());
        let state = (
            ds.metadata.generation,
            ds.metadata.deletion_timestamp.is_some(),
        );
        match self.seen.insert(key, state) {
            Some(previous) => previous != state,
            None => true,
        }
    }
}

/// Controller mapper turning material DaemonSet transitions into a
/// reconcile request for the owning DeviceConfig
pub fn daemonset_owner_trigger(
    filter: Arc<Mutex<DaemonSetChangeFilter>>,
) -> impl Fn(DaemonSet) -> Option<ObjectRef<DeviceConfig>> + Send + Sync + 'static {
    move |ds: DaemonSet| {
        let material = match filter.lock() {
            Ok(mut filter) => filter.should_trigger(&ds),
            Err(_) => true,
        };
        if !material {
            return None;
        }
        match owning_device_config(&ds) {
            Ok(parent) => parent.map(|p| ObjectRef::new(&p.name).within(&p.namespace)),
            Err(e) => {
                warn!("Skipping DaemonSet {}: {}", ds.name_any(), e);
                None
            }
        }
    }
}

/// Signal `trigger` for every material node change
pub async fn run_node_trigger(client: Client, mut trigger: mpsc::Sender<()>) {
    let nodes: Api<Node> = Api::all(client);
    let mut filter = NodeChangeFilter::default();
    let mut stream = watcher(nodes, watcher::Config::default())
        .default_backoff()
        .boxed();

    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                if filter.should_trigger(&event) {
                    // A full channel already holds a pending reconcile-all
                    let _ = trigger.try_send(());
                }
            }
            Err(e) => warn!("Node watch error: {}", e),
        }
    }
}

/// Fold DaemonSet changes into their DeviceConfig's status
pub async fn run_workload_status_loop(client: Client, aggregator: Arc<StatusAggregator>) {
    let daemonsets: Api<DaemonSet> = Api::all(client);
    let mut stream = watcher(daemonsets, watcher::Config::default())
        .default_backoff()
        .boxed();

    while let Some(event) = stream.next().await {
        let touched = match event {
            Ok(Event::Applied(ds)) | Ok(Event::Deleted(ds)) => vec![ds],
            Ok(Event::Restarted(list)) => list,
            Err(e) => {
                warn!("DaemonSet watch error: {}", e);
                continue;
            }
        };
        for ds in touched {
            aggregate_daemonset(&aggregator, &ds).await;
        }
    }
}

async fn aggregate_daemonset(aggregator: &StatusAggregator, ds: &DaemonSet) {
    let namespace = ds.namespace().unwrap_or_else(|| "default".to_string());
    let name = ds.name_any();
    match owning_device_config(ds) {
        Ok(Some(parent)) => {
            if let Err(e) = aggregator.reconcile_child_status(&parent, &name).await {
                error!(
                    "Status aggregation of DaemonSet {}/{} into {} failed: {}",
                    namespace, name, parent, e
                );
            }
        }
        Ok(None) => {}
        Err(e) => warn!("Skipping DaemonSet {}/{}: {}", namespace, name, e),
    }
}

/// Hand worker pod updates to the orchestrator
pub async fn run_worker_pod_loop(client: Client, workers: Arc<WorkerManager>) {
    let pods: Api<Pod> = Api::all(client);
    let config = watcher::Config::default().labels(WORKER_ACTION_LABEL);
    let mut stream = watcher(pods, config).default_backoff().boxed();

    while let Some(event) = stream.next().await {
        let touched = match event {
            Ok(Event::Applied(pod)) => vec![pod],
            Ok(Event::Restarted(list)) => list,
            Ok(Event::Deleted(pod)) => {
                debug!("Worker pod {} deleted", pod.name_any());
                continue;
            }
            Err(e) => {
                warn!("Worker pod watch error: {}", e);
                continue;
            }
        };
        for pod in touched {
            if let Err(e) = workers.observe(&pod).await {
                error!(
                    "Handling worker pod {}/{} failed: {}",
                    pod.namespace().unwrap_or_default(),
                    pod.name_any(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DaemonSetStatus;
    use k8s_openapi::api::core::v1::{NodeStatus, NodeSystemInfo};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};

    fn node(name: &str, boot: &str, labels: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                generation: Some(1),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            status: Some(NodeStatus {
                node_info: Some(NodeSystemInfo {
                    boot_id: boot.to_string(),
                    kernel_version: "6.8.0".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_first_sighting_triggers() {
        let mut filter = NodeChangeFilter::default();
        assert!(filter.should_trigger(&Event::Applied(node("n1", "b1", &[]))));
    }

    #[test]
    fn test_unchanged_update_filtered() {
        let mut filter = NodeChangeFilter::default();
        filter.should_trigger(&Event::Applied(node("n1", "b1", &[])));

        let mut heartbeat = node("n1", "b1", &[]);
        heartbeat.metadata.resource_version = Some("99".to_string());
        assert!(!filter.should_trigger(&Event::Applied(heartbeat)));
    }

    #[test]
    fn test_label_and_boot_changes_trigger() {
        let mut filter = NodeChangeFilter::default();
        filter.should_trigger(&Event::Applied(node("n1", "b1", &[])));
        assert!(filter.should_trigger(&Event::Applied(node(
            "n1",
            "b1",
            &[("gpu.operator.amd.com/ns.dc1.driver", "vf-passthrough")]
        ))));
        assert!(filter.should_trigger(&Event::Applied(node(
            "n1",
            "b2",
            &[("gpu.operator.amd.com/ns.dc1.driver", "vf-passthrough")]
        ))));
    }

    #[test]
    fn test_delete_and_restart_always_trigger() {
        let mut filter = NodeChangeFilter::default();
        filter.should_trigger(&Event::Applied(node("n1", "b1", &[])));
        assert!(filter.should_trigger(&Event::Deleted(node("n1", "b1", &[]))));
        assert!(filter.should_trigger(&Event::Restarted(vec![node("n1", "b1", &[])])));
        assert!(!filter.should_trigger(&Event::Applied(node("n1", "b1", &[]))));
    }

    fn daemonset(generation: i64, deleting: bool, available: i32) -> DaemonSet {
        DaemonSet {
            metadata: ObjectMeta {
                name: Some("dc1-device-plugin".to_string()),
                namespace: Some("ns".to_string()),
                generation: Some(generation),
                deletion_timestamp: deleting.then(|| Time(Default::default())),
                owner_references: Some(vec![OwnerReference {
                    api_version: "amd.com/v1alpha1".to_string(),
                    kind: "DeviceConfig".to_string(),
                    name: "dc1".to_string(),
                    uid: "uid-dc1".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            status: Some(DaemonSetStatus {
                desired_number_scheduled: 3,
                number_available: Some(available),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_daemonset_counter_updates_filtered() {
        let mut filter = DaemonSetChangeFilter::default();
        assert!(filter.should_trigger(&daemonset(1, false, 0)));
        assert!(!filter.should_trigger(&daemonset(1, false, 1)));
        assert!(!filter.should_trigger(&daemonset(1, false, 3)));
    }

    #[test]
    fn test_daemonset_generation_and_deletion_trigger() {
        let mut filter = DaemonSetChangeFilter::default();
        filter.should_trigger(&daemonset(1, false, 3));
        assert!(filter.should_trigger(&daemonset(2, false, 3)));
        assert!(filter.should_trigger(&daemonset(2, true, 3)));
        assert!(!filter.should_trigger(&daemonset(2, true, 2)));
    }

    #[test]
    fn test_daemonset_trigger_targets_owner() {
        let mapper = daemonset_owner_trigger(Arc::new(Mutex::new(DaemonSetChangeFilter::default())));
        assert_eq!(
            mapper(daemonset(1, false, 0)),
            Some(ObjectRef::new("dc1").within("ns"))
        );
        assert_eq!(mapper(daemonset(1, false, 2)), None);

        let mut orphan = daemonset(5, false, 0);
        orphan.metadata.owner_references = None;
        assert_eq!(mapper(orphan), None);
    }
}
