//! VFIO worker orchestration
//!
//! Owns the worker pod of each (DeviceConfig, node) pair and is the only
//! writer of the per-DeviceConfig node labels.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::crd::{DeviceConfig, DriverType};
use crate::error::Result;

use super::cluster::ClusterClient;
use super::labels::{driver_type_label, vfio_ready_label, WorkerAction, WORKER_ACTION_LABEL};
use super::metrics;
use super::ownership::{owning_device_config, ParentKey};
use super::resources::{build_worker_pod, worker_pod_name, worker_pod_patch};
use super::retry::{read_modify_write, RetryPolicy, WriteOutcome};

/// Waiting reason reported once the container runtime lost track of a container
const CONTAINER_STATUS_UNKNOWN: &str = "ContainerStatusUnknown";

/// Result of [`WorkerManager::ensure`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// A new worker pod was submitted
    Created,
    /// The worker pod for this action already existed
    Updated,
    /// Another action is still in flight on this node
    Deferred,
}

/// Result of [`WorkerManager::observe`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodOutcome {
    /// Not a worker pod of a DeviceConfig
    Ignored,
    /// Still pending or running
    InProgress,
    /// Finished successfully, node label updated and pod deleted
    Completed(WorkerAction),
    /// Failed or lost, deleted without touching the node
    Reaped,
}

pub struct WorkerManager {
    cluster: Arc<dyn ClusterClient>,
    utils_image: String,
    retry: RetryPolicy,
}

impl WorkerManager {
    pub fn new(cluster: Arc<dyn ClusterClient>, utils_image: String, retry: RetryPolicy) -> Self {
        Self {
            cluster,
            utils_image,
            retry,
        }
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterClient> {
        &self.cluster
    }

    /// Make sure the worker pod performing `action` exists on `node_name`.
    ///
    /// Never creates a second pod for the pair. An existing pod with another
    /// action, or one already terminating, defers this request.
    #[instrument(skip(self, config), fields(name = %config.name_any(), namespace = config.namespace()))]
    pub async fn ensure(
        &self,
        config: &DeviceConfig,
        node_name: &str,
        action: WorkerAction,
    ) -> Result<EnsureOutcome> {
        let namespace = config.namespace().unwrap_or_else(|| "default".to_string());
        let name = worker_pod_name(&config.name_any(), node_name);

        let outcome = match self.cluster.get_pod(&namespace, &name).await? {
            None => {
                let pod = build_worker_pod(config, node_name, action, &self.utils_image);
                match self.cluster.create_pod(&namespace, &pod).await {
                    Ok(()) => {
                        info!("Created {} worker pod {}/{}", action, namespace, name);
                        EnsureOutcome::Created
                    }
                    Err(e) if e.is_already_exists() => {
                        debug!("Worker pod {}/{} created concurrently", namespace, name);
                        EnsureOutcome::Updated
                    }
                    Err(e) => return Err(e),
                }
            }
            Some(existing) => {
                let current = existing
                    .labels()
                    .get(WORKER_ACTION_LABEL)
                    .and_then(|v| v.parse::<WorkerAction>().ok());
                if existing.metadata.deletion_timestamp.is_some() || current != Some(action) {
                    info!(
                        "Worker pod {}/{} busy with {:?}, deferring {}",
                        namespace, name, current, action
                    );
                    EnsureOutcome::Deferred
                } else {
                    self.cluster
                        .patch_pod(&namespace, &name, &worker_pod_patch(config, action))
                        .await?;
                    EnsureOutcome::Updated
                }
            }
        };

        let label = match outcome {
            EnsureOutcome::Created => "created",
            EnsureOutcome::Updated => "updated",
            EnsureOutcome::Deferred => "deferred",
        };
        metrics::inc_worker_pod(action.as_str(), label);
        Ok(outcome)
    }

    /// React to the current state of a worker pod
    #[instrument(skip(self, pod), fields(pod = %pod.name_any(), namespace = pod.namespace()))]
    pub async fn observe(&self, pod: &Pod) -> Result<PodOutcome> {
        let Some(action_label) = pod.labels().get(WORKER_ACTION_LABEL) else {
            return Ok(PodOutcome::Ignored);
        };
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        let name = pod.name_any();

        if has_unknown_container_status(pod) {
            warn!("Deleting worker pod {}/{} with lost container status", namespace, name);
            self.cluster.delete_pod(&namespace, &name).await?;
            metrics::inc_worker_pod(action_label, "status_unknown");
            return Ok(PodOutcome::Reaped);
        }

        let Some(parent) = owning_device_config(pod)? else {
            info!("Cannot find DeviceConfig owner for worker pod {}/{}", namespace, name);
            return Ok(PodOutcome::Ignored);
        };
        let action = match action_label.parse::<WorkerAction>() {
            Ok(action) => action,
            Err(e) => {
                warn!("Worker pod {}/{}: {}", namespace, name, e);
                return Ok(PodOutcome::Ignored);
            }
        };

        let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
        match phase {
            Some("Succeeded") => {
                let Some(node_name) = pod.spec.as_ref().and_then(|s| s.node_name.as_deref())
                else {
                    warn!("Worker pod {}/{} has no node", namespace, name);
                    return Ok(PodOutcome::Ignored);
                };
                match action {
                    WorkerAction::Load => self.set_ready_label(&parent, node_name).await?,
                    WorkerAction::Unload => self.clear_ready_label(&parent, node_name).await?,
                };
                info!("Removing worker pod {}/{} after completion", namespace, name);
                self.cluster.delete_pod(&namespace, &name).await?;
                metrics::inc_worker_pod(action.as_str(), "succeeded");
                Ok(PodOutcome::Completed(action))
            }
            Some(phase @ ("Failed" | "Unknown")) => {
                info!("Removing worker pod {}/{} in phase {}", namespace, name, phase);
                self.cluster.delete_pod(&namespace, &name).await?;
                metrics::inc_worker_pod(action.as_str(), "failed");
                Ok(PodOutcome::Reaped)
            }
            _ => Ok(PodOutcome::InProgress),
        }
    }

    pub async fn set_ready_label(&self, parent: &ParentKey, node_name: &str) -> Result<WriteOutcome> {
        self.mutate_node_label(node_name, &vfio_ready_label(parent), Some(""), "vfio.ready")
            .await
    }

    pub async fn clear_ready_label(
        &self,
        parent: &ParentKey,
        node_name: &str,
    ) -> Result<WriteOutcome> {
        self.mutate_node_label(node_name, &vfio_ready_label(parent), None, "vfio.ready")
            .await
    }

    pub async fn set_driver_type_label(
        &self,
        parent: &ParentKey,
        node_name: &str,
        driver_type: DriverType,
    ) -> Result<WriteOutcome> {
        self.mutate_node_label(
            node_name,
            &driver_type_label(parent),
            Some(driver_type.as_str()),
            "driver",
        )
        .await
    }

    pub async fn remove_driver_type_label(
        &self,
        parent: &ParentKey,
        node_name: &str,
    ) -> Result<WriteOutcome> {
        self.mutate_node_label(node_name, &driver_type_label(parent), None, "driver")
            .await
    }

    /// Patch a single label key on a freshly read node, skipping the write
    /// when the node already carries the wanted value
    async fn mutate_node_label(
        &self,
        node_name: &str,
        key: &str,
        value: Option<&str>,
        family: &str,
    ) -> Result<WriteOutcome> {
        let cluster = self.cluster.as_ref();
        let outcome = read_modify_write(
            self.retry,
            node_name,
            move || cluster.get_node(node_name),
            |node: &Node| {
                let current = node.labels().get(key).map(String::as_str);
                if current == value {
                    None
                } else {
                    let mut labels = BTreeMap::new();
                    labels.insert(key.to_string(), value.map(str::to_string));
                    Some(labels)
                }
            },
            move |labels: BTreeMap<String, Option<String>>| async move {
                cluster.patch_node_labels(node_name, &labels).await
            },
        )
        .await?;

        match outcome {
            WriteOutcome::Written => {
                let op = if value.is_some() { "set" } else { "remove" };
                info!(node = node_name, label = key, "{} node label", op);
                metrics::inc_label_mutation(family, op);
            }
            WriteOutcome::TargetGone => debug!(node = node_name, "Node gone, label left alone"),
            WriteOutcome::Unchanged => {}
        }
        Ok(outcome)
    }
}

fn has_unknown_container_status(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    status
        .init_container_statuses
        .iter()
        .chain(status.container_statuses.iter())
        .flatten()
        .filter_map(|cs| cs.state.as_ref()?.waiting.as_ref()?.reason.as_deref())
        .any(|reason| reason == CONTAINER_STATUS_UNKNOWN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::cluster::MockClusterClient;
    use crate::crd::{DeviceConfigSpec, DEFAULT_UTILS_IMAGE};
    use crate::error::api_error;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateWaiting, ContainerStatus, PodSpec, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn config() -> DeviceConfig {
        let mut dc = DeviceConfig::new("dc1", DeviceConfigSpec::default());
        dc.metadata.namespace = Some("ns".to_string());
        dc.metadata.uid = Some("uid-dc1".to_string());
        dc
    }

    fn manager(mock: MockClusterClient) -> WorkerManager {
        WorkerManager::new(
            Arc::new(mock),
            DEFAULT_UTILS_IMAGE.to_string(),
            RetryPolicy::default(),
        )
    }

    fn worker_pod(action: WorkerAction, phase: &str) -> Pod {
        let mut pod = build_worker_pod(&config(), "n1", action, DEFAULT_UTILS_IMAGE);
        pod.status = Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        });
        pod
    }

    fn node(labels: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("n1".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ensure_creates_missing_pod() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_pod()
            .withf(|ns, name| ns == "ns" && name == "worker-dc1-n1")
            .returning(|_, _| Ok(None));
        mock.expect_create_pod()
            .withf(|_, pod| pod.labels().get(WORKER_ACTION_LABEL).map(String::as_str) == Some("load"))
            .times(1)
            .returning(|_, _| Ok(()));

        let outcome = manager(mock)
            .ensure(&config(), "n1", WorkerAction::Load)
            .await
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::Created);
    }

    #[tokio::test]
    async fn test_ensure_tolerates_concurrent_create() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_pod().returning(|_, _| Ok(None));
        mock.expect_create_pod()
            .returning(|_, _| Err(api_error(409, "AlreadyExists")));

        let outcome = manager(mock)
            .ensure(&config(), "n1", WorkerAction::Load)
            .await
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::Updated);
    }

    #[tokio::test]
    async fn test_ensure_patches_existing_pod_with_same_action() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_pod()
            .returning(|_, _| Ok(Some(worker_pod(WorkerAction::Load, "Running"))));
        mock.expect_create_pod().never();
        mock.expect_patch_pod().times(1).returning(|_, _, _| Ok(()));

        let outcome = manager(mock)
            .ensure(&config(), "n1", WorkerAction::Load)
            .await
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::Updated);
    }

    #[tokio::test]
    async fn test_ensure_defers_while_other_action_in_flight() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_pod()
            .returning(|_, _| Ok(Some(worker_pod(WorkerAction::Unload, "Running"))));
        mock.expect_create_pod().never();
        mock.expect_patch_pod().never();

        let outcome = manager(mock)
            .ensure(&config(), "n1", WorkerAction::Load)
            .await
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::Deferred);
    }

    #[tokio::test]
    async fn test_ensure_defers_on_terminating_pod() {
        let mut pod = worker_pod(WorkerAction::Load, "Succeeded");
        pod.metadata.deletion_timestamp = Some(Time(Default::default()));

        let mut mock = MockClusterClient::new();
        mock.expect_get_pod().returning(move |_, _| Ok(Some(pod.clone())));
        mock.expect_create_pod().never();
        mock.expect_patch_pod().never();

        let outcome = manager(mock)
            .ensure(&config(), "n1", WorkerAction::Load)
            .await
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::Deferred);
    }

    #[tokio::test]
    async fn test_succeeded_load_sets_ready_label_then_deletes() {
        let ready = vfio_ready_label(&ParentKey::new("ns", "dc1"));
        let expected = ready.clone();

        let mut mock = MockClusterClient::new();
        mock.expect_get_node().returning(|_| Ok(Some(node(&[]))));
        mock.expect_patch_node_labels()
            .withf(move |name, labels| {
                name == "n1"
                    && labels.len() == 1
                    && labels.get(&expected) == Some(&Some(String::new()))
            })
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_delete_pod()
            .withf(|ns, name| ns == "ns" && name == "worker-dc1-n1")
            .times(1)
            .returning(|_, _| Ok(()));

        let outcome = manager(mock)
            .observe(&worker_pod(WorkerAction::Load, "Succeeded"))
            .await
            .unwrap();
        assert_eq!(outcome, PodOutcome::Completed(WorkerAction::Load));
    }

    #[tokio::test]
    async fn test_succeeded_unload_clears_ready_label() {
        let ready = vfio_ready_label(&ParentKey::new("ns", "dc1"));
        let labelled = node(&[(ready.as_str(), "")]);
        let expected = ready.clone();

        let mut mock = MockClusterClient::new();
        mock.expect_get_node()
            .returning(move |_| Ok(Some(labelled.clone())));
        mock.expect_patch_node_labels()
            .withf(move |_, labels| labels.get(&expected) == Some(&None))
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_delete_pod().times(1).returning(|_, _| Ok(()));

        let outcome = manager(mock)
            .observe(&worker_pod(WorkerAction::Unload, "Succeeded"))
            .await
            .unwrap();
        assert_eq!(outcome, PodOutcome::Completed(WorkerAction::Unload));
    }

    #[tokio::test]
    async fn test_failed_pod_deleted_without_label_change() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_node().never();
        mock.expect_patch_node_labels().never();
        mock.expect_delete_pod().times(1).returning(|_, _| Ok(()));

        let outcome = manager(mock)
            .observe(&worker_pod(WorkerAction::Load, "Failed"))
            .await
            .unwrap();
        assert_eq!(outcome, PodOutcome::Reaped);
    }

    #[tokio::test]
    async fn test_lost_container_status_deleted_while_running() {
        let mut pod = worker_pod(WorkerAction::Load, "Running");
        if let Some(status) = pod.status.as_mut() {
            status.container_statuses = Some(vec![ContainerStatus {
                name: "worker".to_string(),
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some(CONTAINER_STATUS_UNKNOWN.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]);
        }

        let mut mock = MockClusterClient::new();
        mock.expect_patch_node_labels().never();
        mock.expect_delete_pod().times(1).returning(|_, _| Ok(()));

        let outcome = manager(mock).observe(&pod).await.unwrap();
        assert_eq!(outcome, PodOutcome::Reaped);
    }

    #[tokio::test]
    async fn test_lost_init_container_status_deleted() {
        let mut pod = worker_pod(WorkerAction::Load, "Pending");
        if let Some(status) = pod.status.as_mut() {
            status.init_container_statuses = Some(vec![ContainerStatus {
                name: "pci-device-detector".to_string(),
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some(CONTAINER_STATUS_UNKNOWN.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]);
        }

        let mut mock = MockClusterClient::new();
        mock.expect_patch_node_labels().never();
        mock.expect_delete_pod()
            .withf(|ns, name| ns == "ns" && name == "worker-dc1-n1")
            .times(1)
            .returning(|_, _| Ok(()));

        let outcome = manager(mock).observe(&pod).await.unwrap();
        assert_eq!(outcome, PodOutcome::Reaped);
    }

    #[tokio::test]
    async fn test_running_pod_left_alone() {
        let mock = MockClusterClient::new();
        let outcome = manager(mock)
            .observe(&worker_pod(WorkerAction::Load, "Running"))
            .await
            .unwrap();
        assert_eq!(outcome, PodOutcome::InProgress);
    }

    #[tokio::test]
    async fn test_unowned_pod_ignored() {
        let mut pod = worker_pod(WorkerAction::Load, "Succeeded");
        pod.metadata.owner_references = None;

        let mock = MockClusterClient::new();
        let outcome = manager(mock).observe(&pod).await.unwrap();
        assert_eq!(outcome, PodOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_label_already_present_skips_patch() {
        let parent = ParentKey::new("ns", "dc1");
        let ready = vfio_ready_label(&parent);
        let labelled = node(&[(ready.as_str(), "")]);

        let mut mock = MockClusterClient::new();
        mock.expect_get_node()
            .returning(move |_| Ok(Some(labelled.clone())));
        mock.expect_patch_node_labels().never();

        let outcome = manager(mock).set_ready_label(&parent, "n1").await.unwrap();
        assert_eq!(outcome, WriteOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_driver_type_label_value() {
        let parent = ParentKey::new("ns", "dc1");
        let key = driver_type_label(&parent);

        let mut mock = MockClusterClient::new();
        mock.expect_get_node().returning(|_| Ok(Some(node(&[]))));
        mock.expect_patch_node_labels()
            .withf(move |_, labels| labels.get(&key) == Some(&Some("pf-passthrough".to_string())))
            .times(1)
            .returning(|_, _| Ok(()));

        let outcome = manager(mock)
            .set_driver_type_label(&parent, "n1", DriverType::PfPassthrough)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
    }
}
