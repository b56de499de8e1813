//! Prometheus metrics for the GPU device operator

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// Labels for worker pod lifecycle events
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WorkerPodLabels {
    pub action: String,
    pub outcome: String,
}

/// Labels for node label writes
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LabelMutationLabels {
    pub label: String,
    pub op: String,
}

/// Labels for status patches
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusPatchLabels {
    pub workload: String,
    pub outcome: String,
}

/// Labels for binding decisions
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BindingLabels {
    pub state: String,
}

pub static WORKER_PODS: Lazy<Family<WorkerPodLabels, Counter>> = Lazy::new(Family::default);

pub static NODE_LABEL_MUTATIONS: Lazy<Family<LabelMutationLabels, Counter>> =
    Lazy::new(Family::default);

pub static STATUS_PATCHES: Lazy<Family<StatusPatchLabels, Counter>> =
    Lazy::new(Family::default);

pub static BINDING_DECISIONS: Lazy<Family<BindingLabels, Counter>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();
    registry.register(
        "gpu_operator_worker_pods",
        "VFIO worker pods created, deferred and reaped",
        WORKER_PODS.clone(),
    );
    registry.register(
        "gpu_operator_node_label_mutations",
        "Node label writes issued by the operator",
        NODE_LABEL_MUTATIONS.clone(),
    );
    registry.register(
        "gpu_operator_status_patches",
        "DeviceConfig status patch attempts per workload",
        STATUS_PATCHES.clone(),
    );
    registry.register(
        "gpu_operator_binding_decisions",
        "Node binding states evaluated",
        BINDING_DECISIONS.clone(),
    );
    registry
});

pub fn inc_worker_pod(action: &str, outcome: &str) {
    WORKER_PODS
        .get_or_create(&WorkerPodLabels {
            action: action.to_string(),
            outcome: outcome.to_string(),
        })
        .inc();
}

/// `label` is the label family (`driver` or `vfio.ready`), not the full key
pub fn inc_label_mutation(label: &str, op: &str) {
    NODE_LABEL_MUTATIONS
        .get_or_create(&LabelMutationLabels {
            label: label.to_string(),
            op: op.to_string(),
        })
        .inc();
}

pub fn inc_status_patch(workload: &str, outcome: &str) {
    STATUS_PATCHES
        .get_or_create(&StatusPatchLabels {
            workload: workload.to_string(),
            outcome: outcome.to_string(),
        })
        .inc();
}

pub fn inc_binding_decision(state: &str) {
    BINDING_DECISIONS
        .get_or_create(&BindingLabels {
            state: state.to_string(),
        })
        .inc();
}
