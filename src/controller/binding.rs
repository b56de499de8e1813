//! Node binding state machine
//!
//! The labels on a node are the state. [`evaluate`] reads the label pair of
//! one DeviceConfig plus the node's boot identity and names the step that
//! moves the node toward its declared driver mode. [`NodeBinder`] carries the
//! step out through the [`WorkerManager`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::crd::{DeviceConfig, DriverType};
use crate::error::Result;

use super::labels::{driver_type_label, vfio_ready_label, WorkerAction};
use super::metrics;
use super::ownership::ParentKey;
use super::worker::WorkerManager;

/// Step required for one (DeviceConfig, node) pair
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BindingState {
    /// Passthrough declared, devices not bound yet
    NeedsBind(DriverType),
    /// Driver label withdrawn while devices are still bound
    NeedsUnbind,
    /// Node restarted since the bind, the ready label is stale
    RebootDetected,
    Stable,
    /// Declared driver type is handled elsewhere
    Unmanaged(String),
}

impl BindingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingState::NeedsBind(_) => "needs_bind",
            BindingState::NeedsUnbind => "needs_unbind",
            BindingState::RebootDetected => "reboot_detected",
            BindingState::Stable => "stable",
            BindingState::Unmanaged(_) => "unmanaged",
        }
    }
}

impl fmt::Display for BindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingState::NeedsBind(driver) => write!(f, "needs_bind({})", driver),
            BindingState::Unmanaged(driver) => write!(f, "unmanaged({})", driver),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Decide the binding step from labels and boot identity.
///
/// Only the two keys passed in are consulted, labels of other DeviceConfigs
/// on the same node never influence the result. A reboot can only be
/// detected once a previous boot id is known.
pub fn evaluate(
    labels: &BTreeMap<String, String>,
    driver_key: &str,
    ready_key: &str,
    boot_id: Option<&str>,
    previous_boot_id: Option<&str>,
) -> BindingState {
    let declared = labels.get(driver_key);
    let ready = labels.contains_key(ready_key);

    let driver_type = match declared {
        Some(value) => match value.parse::<DriverType>() {
            Ok(driver) if driver.is_passthrough() => Some(driver),
            _ => return BindingState::Unmanaged(value.clone()),
        },
        None => None,
    };

    let rebooted = matches!(
        (boot_id, previous_boot_id),
        (Some(current), Some(previous)) if current != previous
    );

    match (driver_type, ready) {
        (_, true) if rebooted => BindingState::RebootDetected,
        (Some(driver), false) => BindingState::NeedsBind(driver),
        (None, true) => BindingState::NeedsUnbind,
        _ => BindingState::Stable,
    }
}

fn boot_id(node: &Node) -> Option<&str> {
    node.status
        .as_ref()
        .and_then(|s| s.node_info.as_ref())
        .map(|info| info.boot_id.as_str())
        .filter(|id| !id.is_empty())
}

/// Boot identity last seen per (DeviceConfig, node), kept in process memory
#[derive(Default)]
pub struct BootLedger {
    seen: Mutex<HashMap<(ParentKey, String), String>>,
}

impl BootLedger {
    pub fn previous(&self, parent: &ParentKey, node: &str) -> Option<String> {
        self.seen
            .lock()
            .ok()?
            .get(&(parent.clone(), node.to_string()))
            .cloned()
    }

    pub fn record(&self, parent: &ParentKey, node: &str, boot_id: &str) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.insert((parent.clone(), node.to_string()), boot_id.to_string());
        }
    }

    /// Drop every entry of a DeviceConfig
    pub fn forget(&self, parent: &ParentKey) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.retain(|(p, _), _| p != parent);
        }
    }

    fn forget_node(&self, parent: &ParentKey, node: &str) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.remove(&(parent.clone(), node.to_string()));
        }
    }
}

/// Evaluates and acts on the binding state of single nodes
pub struct NodeBinder {
    workers: Arc<WorkerManager>,
    ledger: BootLedger,
}

impl NodeBinder {
    pub fn new(workers: Arc<WorkerManager>) -> Self {
        Self {
            workers,
            ledger: BootLedger::default(),
        }
    }

    pub fn ledger(&self) -> &BootLedger {
        &self.ledger
    }

    /// Re-read `node_name` and drive it one step toward the state declared
    /// for `config`. Returns `None` when the node no longer exists.
    #[instrument(skip(self, config), fields(name = %config.name_any(), namespace = config.namespace()))]
    pub async fn reconcile_node(
        &self,
        config: &DeviceConfig,
        node_name: &str,
    ) -> Result<Option<BindingState>> {
        let parent = ParentKey::from_config(config);

        let Some(node) = self.workers.cluster().get_node(node_name).await? else {
            debug!("Node {} gone", node_name);
            self.ledger.forget_node(&parent, node_name);
            return Ok(None);
        };

        let current_boot = boot_id(&node);
        let previous_boot = self.ledger.previous(&parent, node_name);
        let state = evaluate(
            node.labels(),
            &driver_type_label(&parent),
            &vfio_ready_label(&parent),
            current_boot,
            previous_boot.as_deref(),
        );
        metrics::inc_binding_decision(state.as_str());

        match &state {
            BindingState::NeedsBind(driver) => {
                info!("Node {} needs {} bind", node_name, driver);
                self.workers
                    .ensure(config, node_name, WorkerAction::Load)
                    .await?;
            }
            BindingState::NeedsUnbind => {
                info!("Node {} needs VFIO unbind", node_name);
                self.workers
                    .ensure(config, node_name, WorkerAction::Unload)
                    .await?;
            }
            BindingState::RebootDetected => {
                warn!(
                    "Node {} rebooted ({:?} -> {:?}), clearing stale ready label",
                    node_name, previous_boot, current_boot
                );
                self.workers.clear_ready_label(&parent, node_name).await?;
            }
            BindingState::Unmanaged(driver) => {
                debug!("Node {} driver type {} not handled here", node_name, driver);
            }
            BindingState::Stable => {}
        }

        if let Some(boot) = current_boot {
            self.ledger.record(&parent, node_name, boot);
        }
        Ok(Some(state))
    }
}
