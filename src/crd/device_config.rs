//! DeviceConfig Custom Resource Definition
//!
//! The DeviceConfig CRD describes how AMD GPUs are enabled on a set of nodes.
//! This operator consumes the driver and utils-container settings and owns the
//! per-workload counters in the status.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{CommonConfig, DriverSpec, DriverType, WorkloadStatus};

/// The DeviceConfig CRD represents the GPU configuration of a group of nodes.
///
/// # Example
///
/// ```yaml
/// apiVersion: amd.com/v1alpha1
/// kind: DeviceConfig
/// metadata:
///   name: dc1
///   namespace: kube-amd-gpu
/// spec:
///   selector:
///     feature.node.kubernetes.io/amd-gpu: "true"
///   driver:
///     enable: true
///     driverType: vf-passthrough
///   commonConfig:
///     utilsContainer:
///       image: docker.io/rocm/gpu-operator-utils:latest
///       imagePullPolicy: IfNotPresent
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "amd.com",
    version = "v1alpha1",
    kind = "DeviceConfig",
    namespaced,
    status = "DeviceConfigStatus",
    shortname = "gpue",
    printcolumn = r#"{"name":"Driver","type":"string","jsonPath":".spec.driver.driverType"}"#,
    printcolumn = r#"{"name":"Plugin Ready","type":"integer","jsonPath":".status.devicePlugin.availableNumber"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfigSpec {
    /// Node labels selecting the nodes this DeviceConfig manages
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,

    /// Driver configuration
    #[serde(default)]
    pub driver: DriverSpec,

    /// Settings shared across operands
    #[serde(default)]
    pub common_config: CommonConfig,
}

/// Observed state of a DeviceConfig
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfigStatus {
    /// Device plugin DaemonSet counters
    #[serde(default)]
    pub device_plugin: WorkloadStatus,

    /// Metrics exporter DaemonSet counters
    #[serde(default)]
    pub metrics_exporter: WorkloadStatus,

    /// Device config manager DaemonSet counters
    #[serde(default)]
    pub config_manager: WorkloadStatus,
}

const PULL_POLICIES: &[&str] = &["Always", "IfNotPresent", "Never"];

impl DeviceConfigSpec {
    /// Validate the spec before any node is touched
    pub fn validate(&self) -> Result<(), String> {
        for key in self.selector.keys() {
            if key.trim().is_empty() {
                return Err("selector keys must not be empty".to_string());
            }
        }

        if let Some(policy) = &self.common_config.utils_container.image_pull_policy {
            if !PULL_POLICIES.contains(&policy.as_str()) {
                return Err(format!(
                    "commonConfig.utilsContainer.imagePullPolicy must be one of {}, got {:?}",
                    PULL_POLICIES.join(", "),
                    policy
                ));
            }
        }

        if let Some(image) = &self.common_config.utils_container.image {
            if image.trim().is_empty() {
                return Err("commonConfig.utilsContainer.image must not be empty".to_string());
            }
        }

        for id in &self.driver.vfio_config.device_ids {
            let valid = id.len() == 4 && id.chars().all(|c| c.is_ascii_hexdigit());
            if !valid {
                return Err(format!(
                    "driver.vfioConfig.deviceIDs entries must be 4 hex digits, got {:?}",
                    id
                ));
            }
        }

        Ok(())
    }

    /// Label selector string for listing the managed nodes
    pub fn node_selector(&self) -> String {
        self.selector
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Whether the driver-type label should be present on selected nodes
    pub fn manages_driver(&self) -> bool {
        self.driver.enable
    }

    pub fn driver_type(&self) -> DriverType {
        self.driver.driver_type
    }
}
