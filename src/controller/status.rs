//! Workload status aggregation
//!
//! Mirrors the counters of the DaemonSets a DeviceConfig owns into its status.
//! Each workload kind owns one counter triple in the status, and only that
//! triple is ever patched.

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::DaemonSet;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::crd::{DeviceConfig, DeviceConfigStatus, WorkloadStatus};
use crate::error::Result;

use super::cluster::ClusterClient;
use super::metrics;
use super::ownership::ParentKey;
use super::retry::{read_modify_write, RetryPolicy, WriteOutcome};

/// Managed workload kinds, told apart by DaemonSet name suffix
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    MetricsExporter,
    DevicePlugin,
    ConfigManager,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 3] = [
        WorkloadKind::MetricsExporter,
        WorkloadKind::DevicePlugin,
        WorkloadKind::ConfigManager,
    ];

    pub fn suffix(&self) -> &'static str {
        match self {
            WorkloadKind::MetricsExporter => "-metrics-exporter",
            WorkloadKind::DevicePlugin => "-device-plugin",
            WorkloadKind::ConfigManager => "-device-config-manager",
        }
    }

    /// Key of this kind's triple under `.status`
    pub fn status_field(&self) -> &'static str {
        match self {
            WorkloadKind::MetricsExporter => "metricsExporter",
            WorkloadKind::DevicePlugin => "devicePlugin",
            WorkloadKind::ConfigManager => "configManager",
        }
    }

    pub fn from_workload_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| name.ends_with(kind.suffix()))
    }

    /// DaemonSet name of this kind for a DeviceConfig
    pub fn workload_name(&self, parent: &str) -> String {
        format!("{}{}", parent, self.suffix())
    }

    fn recorded(&self, status: &DeviceConfigStatus) -> WorkloadStatus {
        match self {
            WorkloadKind::MetricsExporter => status.metrics_exporter,
            WorkloadKind::DevicePlugin => status.device_plugin,
            WorkloadKind::ConfigManager => status.config_manager,
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status_field())
    }
}

/// Counters observed on a DaemonSet; a missing DaemonSet counts as zero
pub fn observed_counters(daemonset: Option<&DaemonSet>) -> WorkloadStatus {
    let Some(status) = daemonset.and_then(|ds| ds.status.as_ref()) else {
        return WorkloadStatus::default();
    };
    WorkloadStatus {
        nodes_matching_selector_number: status.number_available.unwrap_or(0),
        desired_number: status.desired_number_scheduled,
        available_number: status.number_available.unwrap_or(0),
    }
}

/// Status merge-patch touching only `kind`'s triple, guarded by the
/// resourceVersion it was computed from
pub fn status_patch(
    kind: WorkloadKind,
    counters: WorkloadStatus,
    resource_version: Option<&str>,
) -> Value {
    let mut patch = json!({ "status": { kind.status_field(): counters } });
    if let Some(rv) = resource_version {
        patch["metadata"] = json!({ "resourceVersion": rv });
    }
    patch
}

/// Result of one aggregation pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregateOutcome {
    /// Name does not belong to a known workload kind
    UnknownWorkload,
    /// DeviceConfig no longer exists
    ParentGone,
    /// Status already reflected the counters
    Unchanged,
    Patched,
}

/// Folds DaemonSet counters into DeviceConfig status
pub struct StatusAggregator {
    cluster: Arc<dyn ClusterClient>,
    retry: RetryPolicy,
}

impl StatusAggregator {
    pub fn new(cluster: Arc<dyn ClusterClient>, retry: RetryPolicy) -> Self {
        Self { cluster, retry }
    }

    /// Bring `parent`'s status triple for `workload_name` in line with the
    /// DaemonSet's current counters.
    #[instrument(skip(self, parent), fields(parent = %parent))]
    pub async fn reconcile_child_status(
        &self,
        parent: &ParentKey,
        workload_name: &str,
    ) -> Result<AggregateOutcome> {
        let Some(kind) = WorkloadKind::from_workload_name(workload_name) else {
            debug!("Ignoring DaemonSet {} with unknown suffix", workload_name);
            return Ok(AggregateOutcome::UnknownWorkload);
        };

        let cluster = self.cluster.as_ref();
        let target = parent.to_string();

        let result = read_modify_write(
            self.retry,
            &target,
            move || self.read_state(parent, workload_name),
            |(config, counters): &(DeviceConfig, WorkloadStatus)| {
                let recorded = config
                    .status
                    .as_ref()
                    .map(|s| kind.recorded(s))
                    .unwrap_or_default();
                if recorded == *counters {
                    None
                } else {
                    Some(status_patch(
                        kind,
                        *counters,
                        config.metadata.resource_version.as_deref(),
                    ))
                }
            },
            move |patch: Value| async move {
                cluster
                    .patch_device_config_status(&parent.namespace, &parent.name, &patch)
                    .await
            },
        )
        .await;

        let outcome = match result {
            Ok(WriteOutcome::TargetGone) => AggregateOutcome::ParentGone,
            Ok(WriteOutcome::Unchanged) => AggregateOutcome::Unchanged,
            Ok(WriteOutcome::Written) => {
                info!("Updated {} status of {}", kind, parent);
                AggregateOutcome::Patched
            }
            Err(e) => {
                metrics::inc_status_patch(kind.status_field(), "error");
                return Err(e);
            }
        };
        metrics::inc_status_patch(kind.status_field(), outcome.as_str());
        Ok(outcome)
    }

    /// Re-drive every workload kind of a DeviceConfig.
    ///
    /// A failing kind does not stop the others; the last error is returned
    /// once every kind had its attempt.
    pub async fn reconcile_all_workloads(&self, parent: &ParentKey) -> Result<()> {
        let mut failure = None;
        for kind in WorkloadKind::ALL {
            let workload = kind.workload_name(&parent.name);
            if let Err(e) = self.reconcile_child_status(parent, &workload).await {
                warn!("Aggregating {} of {} failed: {}", workload, parent, e);
                failure = Some(e);
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn read_state(
        &self,
        parent: &ParentKey,
        workload_name: &str,
    ) -> Result<Option<(DeviceConfig, WorkloadStatus)>> {
        let Some(config) = self
            .cluster
            .get_device_config(&parent.namespace, &parent.name)
            .await?
        else {
            return Ok(None);
        };
        let daemonset = self
            .cluster
            .get_daemonset(&parent.namespace, workload_name)
            .await?;
        Ok(Some((config, observed_counters(daemonset.as_ref()))))
    }
}

impl AggregateOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateOutcome::UnknownWorkload => "unknown_workload",
            AggregateOutcome::ParentGone => "parent_gone",
            AggregateOutcome::Unchanged => "unchanged",
            AggregateOutcome::Patched => "patched",
        }
    }
}
