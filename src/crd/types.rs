//! Shared types for DeviceConfig specifications
//!
//! These types are used across the CRD definitions and controller logic.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default image for the VFIO worker pods
pub const DEFAULT_UTILS_IMAGE: &str = "docker.io/rocm/gpu-operator-utils:latest";

/// PCI device IDs of SR-IOV virtual functions bound for vf-passthrough
pub const DEFAULT_VF_DEVICE_IDS: &[&str] = &[
    "7410", // MI210 VF
    "74b5", // MI300X VF
    "74b9", // MI325X VF
    "7461", // Radeon Pro V710 MxGPU
    "73ae", // Radeon Pro V620 MxGPU
    "75b0", // MI350X
    "75b3", // MI355X
];

/// PCI device IDs of physical functions bound for pf-passthrough
pub const DEFAULT_PF_DEVICE_IDS: &[&str] = &[
    "75a3", // MI355X
    "75a0", // MI350X
    "74a5", // MI325X
    "74a2", // MI308X
    "74b6", // MI308X
    "74a8", // MI308X HF
    "74a0", // MI300A
    "74a1", // MI300X
    "74a9", // MI300X HF
    "74bd", // MI300X HF
    "740f", // MI210
    "7408", // MI250X
    "740c", // MI250/MI250X
];

/// Driver mode requested for the selected nodes
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum DriverType {
    /// In-kernel amdgpu driver for bare metal nodes or guest VMs
    #[default]
    #[serde(rename = "container")]
    Container,
    /// Host driver creates SR-IOV VFs, the VFs are bound to vfio-pci
    #[serde(rename = "vf-passthrough")]
    VfPassthrough,
    /// Physical functions are bound to vfio-pci directly
    #[serde(rename = "pf-passthrough")]
    PfPassthrough,
}

impl DriverType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverType::Container => "container",
            DriverType::VfPassthrough => "vf-passthrough",
            DriverType::PfPassthrough => "pf-passthrough",
        }
    }

    /// Whether devices must be bound to vfio-pci by a worker pod
    pub fn is_passthrough(&self) -> bool {
        matches!(self, DriverType::VfPassthrough | DriverType::PfPassthrough)
    }

    /// Built-in PCI device IDs for this driver type
    pub fn default_device_ids(&self) -> &'static [&'static str] {
        match self {
            DriverType::Container => &[],
            DriverType::VfPassthrough => DEFAULT_VF_DEVICE_IDS,
            DriverType::PfPassthrough => DEFAULT_PF_DEVICE_IDS,
        }
    }
}

impl fmt::Display for DriverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container" => Ok(DriverType::Container),
            "vf-passthrough" => Ok(DriverType::VfPassthrough),
            "pf-passthrough" => Ok(DriverType::PfPassthrough),
            other => Err(format!("unknown driver type {:?}", other)),
        }
    }
}

/// Driver configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverSpec {
    /// Manage the driver on the selected nodes (default: true)
    #[serde(default = "default_true")]
    pub enable: bool,

    /// Driver mode (container, vf-passthrough or pf-passthrough)
    #[serde(default)]
    pub driver_type: DriverType,

    /// Settings for binding PCI devices to vfio-pci
    #[serde(default)]
    pub vfio_config: VfioConfig,
}

impl Default for DriverSpec {
    fn default() -> Self {
        Self {
            enable: true,
            driver_type: DriverType::default(),
            vfio_config: VfioConfig::default(),
        }
    }
}

impl DriverSpec {
    /// Device IDs handed to the VFIO worker; falls back to the built-in list
    pub fn vfio_device_ids(&self) -> Vec<String> {
        if self.vfio_config.device_ids.is_empty() {
            self.driver_type
                .default_device_ids()
                .iter()
                .map(|id| id.to_string())
                .collect()
        } else {
            self.vfio_config.device_ids.clone()
        }
    }
}

/// VFIO binding configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VfioConfig {
    /// PCI device IDs to bind to vfio-pci (e.g. "74b5")
    #[serde(default, rename = "deviceIDs", skip_serializing_if = "Vec::is_empty")]
    pub device_ids: Vec<String>,
}

/// Settings shared by the operands
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommonConfig {
    /// Utils container used by the VFIO worker pods
    #[serde(default)]
    pub utils_container: UtilsContainer,
}

/// Utils container image settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UtilsContainer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Always, IfNotPresent or Never
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Pull secret for the utils image
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_registry_secret: Option<SecretReference>,
}

/// Reference to a Secret in the DeviceConfig namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SecretReference {
    pub name: String,
}

/// Counters mirrored from one managed DaemonSet
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    /// Number of nodes the DaemonSet targets
    #[serde(default)]
    pub nodes_matching_selector_number: i32,
    /// Number of pods that should be running
    #[serde(default)]
    pub desired_number: i32,
    /// Number of pods running and available
    #[serde(default)]
    pub available_number: i32,
}

fn default_true() -> bool {
    true
}
