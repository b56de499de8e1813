//! Controller module for DeviceConfig reconciliation
//!
//! This module contains the controller loop, the node binding state machine,
//! the VFIO worker orchestration and the workload status aggregation.

pub mod binding;
pub mod cluster;
pub mod labels;
pub mod metrics;
pub mod ownership;
mod reconciler;
mod resources;
pub mod retry;
pub mod status;
pub mod watchers;
pub mod worker;

pub use binding::{evaluate, BindingState, BootLedger, NodeBinder};
pub use cluster::{ClusterClient, KubeCluster};
pub use labels::{driver_type_label, vfio_ready_label, WorkerAction, WORKER_ACTION_LABEL};
pub use ownership::{owning_device_config, owning_parent, ParentKey};
pub use reconciler::{run_controller, ControllerState, DeviceConfigReconciler, DEVICE_CONFIG_FINALIZER};
pub use resources::{build_worker_pod, worker_pod_name};
pub use retry::{read_modify_write, RetryPolicy, WriteOutcome};
pub use status::{AggregateOutcome, StatusAggregator, WorkloadKind};
pub use worker::{EnsureOutcome, PodOutcome, WorkerManager};
