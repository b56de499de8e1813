//! Node and pod label schema
//!
//! Node labels are keyed by the owning DeviceConfig's namespace and name so
//! several DeviceConfigs can share a node without touching each other's keys.

use std::fmt;
use std::str::FromStr;

use super::ownership::ParentKey;

/// Domain prefix shared by every label this operator writes
pub const LABEL_DOMAIN: &str = "gpu.operator.amd.com";

/// Pod label carrying the worker action
pub const WORKER_ACTION_LABEL: &str = "gpu.operator.amd.com/worker-action";

const DRIVER_TYPE_SUFFIX: &str = "driver";
const VFIO_READY_SUFFIX: &str = "vfio.ready";

/// Action performed by a VFIO worker pod
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkerAction {
    /// Bind the devices to vfio-pci
    Load,
    /// Release the devices from vfio-pci
    Unload,
}

impl WorkerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerAction::Load => "load",
            WorkerAction::Unload => "unload",
        }
    }
}

impl fmt::Display for WorkerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "load" => Ok(WorkerAction::Load),
            "unload" => Ok(WorkerAction::Unload),
            other => Err(format!("unknown worker action {:?}", other)),
        }
    }
}

/// Node label declaring the desired driver type under a DeviceConfig
pub fn driver_type_label(parent: &ParentKey) -> String {
    format!(
        "{}/{}.{}.{}",
        LABEL_DOMAIN, parent.namespace, parent.name, DRIVER_TYPE_SUFFIX
    )
}

/// Node label present once the VFIO bind has completed under a DeviceConfig
pub fn vfio_ready_label(parent: &ParentKey) -> String {
    format!(
        "{}/{}.{}.{}",
        LABEL_DOMAIN, parent.namespace, parent.name, VFIO_READY_SUFFIX
    )
}
