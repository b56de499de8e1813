//! Kubernetes resource builders for VFIO worker pods
//!
//! A worker pod runs once on one node to bind or release the GPU functions
//! listed for its DeviceConfig, then exits.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, HostPathVolumeSource, LocalObjectReference, Pod, PodSpec,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use serde_json::{json, Value};

use crate::crd::DeviceConfig;

use super::labels::{WorkerAction, WORKER_ACTION_LABEL};

const VFIO_BIND_SCRIPT: &str = include_str!("../../scripts/vfio_bind.sh");
const VFIO_UNBIND_SCRIPT: &str = include_str!("../../scripts/vfio_unbind.sh");

pub const WORKER_CONTAINER_NAME: &str = "worker";
pub const DEVICE_DETECTOR_CONTAINER_NAME: &str = "pci-device-detector";

/// Host directories the bind scripts need, as (volume name, path)
const HOST_MOUNTS: &[(&str, &str)] = &[("sys", "/sys"), ("lib", "/lib/modules"), ("dev", "/dev")];

/// Get the standard labels for a worker pod
fn standard_labels(config: &DeviceConfig, action: WorkerAction) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/name".to_string(),
        "gpu-vfio-worker".to_string(),
    );
    labels.insert("app.kubernetes.io/instance".to_string(), config.name_any());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "gpu-device-operator".to_string(),
    );
    labels.insert(WORKER_ACTION_LABEL.to_string(), action.to_string());
    labels
}

/// Create an OwnerReference for garbage collection
pub fn owner_reference(config: &DeviceConfig) -> OwnerReference {
    OwnerReference {
        api_version: DeviceConfig::api_version(&()).to_string(),
        kind: DeviceConfig::kind(&()).to_string(),
        name: config.name_any(),
        uid: config.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Deterministic worker pod name for a (DeviceConfig, node) pair
pub fn worker_pod_name(config_name: &str, node_name: &str) -> String {
    format!("worker-{}-{}", config_name, node_name)
}

/// Image used by the worker containers
pub fn worker_image(config: &DeviceConfig, default_image: &str) -> String {
    config
        .spec
        .common_config
        .utils_container
        .image
        .clone()
        .unwrap_or_else(|| default_image.to_string())
}

// ============================================================================
// Worker Pod
// ============================================================================

/// Build the worker pod performing `action` on `node_name`
pub fn build_worker_pod(
    config: &DeviceConfig,
    node_name: &str,
    action: WorkerAction,
    default_image: &str,
) -> Pod {
    let image = worker_image(config, default_image);
    let device_ids = config.spec.driver.vfio_device_ids();
    let utils = &config.spec.common_config.utils_container;

    let script = match action {
        WorkerAction::Load => VFIO_BIND_SCRIPT,
        WorkerAction::Unload => VFIO_UNBIND_SCRIPT,
    };

    let mut worker = privileged_container(WORKER_CONTAINER_NAME, &image);
    worker.command = Some(vec![
        "/bin/bash".to_string(),
        "-c".to_string(),
        script.to_string(),
    ]);
    worker.env = Some(vec![EnvVar {
        name: "DEVICE_IDS".to_string(),
        value: Some(device_ids.join(" ")),
        ..Default::default()
    }]);

    // Released functions may already be gone, only a bind waits for hardware
    let mut init_containers = match action {
        WorkerAction::Load => {
            let mut detector = privileged_container(DEVICE_DETECTOR_CONTAINER_NAME, &image);
            detector.command = Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                device_detector_command(&device_ids),
            ]);
            Some(vec![detector])
        }
        WorkerAction::Unload => None,
    };

    let mut containers = vec![worker];
    if let Some(policy) = &utils.image_pull_policy {
        containers
            .iter_mut()
            .chain(init_containers.iter_mut().flatten())
            .for_each(|c| c.image_pull_policy = Some(policy.clone()));
    }

    let image_pull_secrets = utils
        .image_registry_secret
        .as_ref()
        .map(|secret| {
            vec![LocalObjectReference {
                name: Some(secret.name.clone()),
            }]
        });

    Pod {
        metadata: ObjectMeta {
            name: Some(worker_pod_name(&config.name_any(), node_name)),
            namespace: config.namespace(),
            labels: Some(standard_labels(config, action)),
            owner_references: Some(vec![owner_reference(config)]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node_name.to_string()),
            init_containers,
            containers,
            restart_policy: Some("OnFailure".to_string()),
            image_pull_secrets,
            volumes: Some(host_volumes()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Merge-patch re-asserting the labels and owner of an existing worker pod
pub fn worker_pod_patch(config: &DeviceConfig, action: WorkerAction) -> Value {
    json!({
        "metadata": {
            "labels": standard_labels(config, action),
            "ownerReferences": [owner_reference(config)],
        }
    })
}

fn privileged_container(name: &str, image: &str) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        security_context: Some(SecurityContext {
            run_as_user: Some(0),
            privileged: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(
            HOST_MOUNTS
                .iter()
                .map(|(volume, path)| VolumeMount {
                    name: volume.to_string(),
                    mount_path: path.to_string(),
                    ..Default::default()
                })
                .collect(),
        ),
        ..Default::default()
    }
}

fn host_volumes() -> Vec<Volume> {
    HOST_MOUNTS
        .iter()
        .map(|(volume, path)| Volume {
            name: volume.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: path.to_string(),
                type_: Some("Directory".to_string()),
            }),
            ..Default::default()
        })
        .collect()
}

/// Shell loop blocking until one of `device_ids` shows up on the PCI bus
fn device_detector_command(device_ids: &[String]) -> String {
    let patterns = device_ids
        .iter()
        .map(|id| format!("-e {}", id))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "while ! lspci -nn | grep -q {}; do echo \"PCI device not found\"; sleep 2; done",
        patterns
    )
}
