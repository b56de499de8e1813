//! DeviceConfig reconciliation
//!
//! Keeps the driver-type labels of the selected nodes in line with the spec,
//! drives every affected node through the binding state machine and re-folds
//! the workload counters into status.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use crate::crd::DeviceConfig;
use crate::error::{Error, Result};

use super::binding::NodeBinder;
use super::cluster::{ClusterClient, KubeCluster};
use super::labels::{driver_type_label, vfio_ready_label, WorkerAction, WORKER_ACTION_LABEL};
use super::ownership::ParentKey;
use super::retry::RetryPolicy;
use super::status::StatusAggregator;
use super::watchers::{self, DaemonSetChangeFilter};
use super::worker::WorkerManager;

/// Finalizer holding a DeviceConfig until its nodes are released
pub const DEVICE_CONFIG_FINALIZER: &str = "amd.com/deviceconfig-finalizer";

/// Safety-net requeue for healthy DeviceConfigs
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Reconciliation logic, independent of the controller runtime
pub struct DeviceConfigReconciler {
    cluster: Arc<dyn ClusterClient>,
    workers: Arc<WorkerManager>,
    binder: NodeBinder,
    aggregator: Arc<StatusAggregator>,
}

impl DeviceConfigReconciler {
    pub fn new(cluster: Arc<dyn ClusterClient>, utils_image: String, retry: RetryPolicy) -> Self {
        let workers = Arc::new(WorkerManager::new(cluster.clone(), utils_image, retry));
        Self {
            binder: NodeBinder::new(workers.clone()),
            aggregator: Arc::new(StatusAggregator::new(cluster.clone(), retry)),
            cluster,
            workers,
        }
    }

    pub fn workers(&self) -> &Arc<WorkerManager> {
        &self.workers
    }

    pub fn aggregator(&self) -> &Arc<StatusAggregator> {
        &self.aggregator
    }

    pub fn binder(&self) -> &NodeBinder {
        &self.binder
    }

    /// Converge the nodes and status of a live DeviceConfig
    #[instrument(skip(self, config), fields(name = %config.name_any(), namespace = config.namespace()))]
    pub async fn apply(&self, config: &DeviceConfig) -> Result<Action> {
        let parent = ParentKey::from_config(config);

        if let Err(e) = config.spec.validate() {
            warn!("Validation failed for {}: {}", parent, e);
            return Err(Error::ValidationError(e));
        }

        let all_nodes = self.cluster.list_nodes("").await?;
        let selector = config.spec.node_selector();
        let selected: BTreeSet<String> = if selector.is_empty() {
            all_nodes.iter().map(|n| n.name_any()).collect()
        } else {
            self.cluster
                .list_nodes(&selector)
                .await?
                .iter()
                .map(|n| n.name_any())
                .collect()
        };

        // Nodes this DeviceConfig selects or has left its labels on
        let driver_key = driver_type_label(&parent);
        let ready_key = vfio_ready_label(&parent);
        let mut affected = selected.clone();
        for node in &all_nodes {
            let labels = node.labels();
            if labels.contains_key(&driver_key) || labels.contains_key(&ready_key) {
                affected.insert(node.name_any());
            }
        }

        // 1. Driver-type labels
        for name in &affected {
            if config.spec.manages_driver() && selected.contains(name) {
                self.workers
                    .set_driver_type_label(&parent, name, config.spec.driver_type())
                    .await?;
            } else {
                self.workers.remove_driver_type_label(&parent, name).await?;
            }
        }

        // 2. Binding state of every affected node, each one re-read
        let mut failure = None;
        for name in &affected {
            match self.binder.reconcile_node(config, name).await {
                Ok(Some(state)) => debug!("Node {} evaluated as {}", name, state),
                Ok(None) => {}
                Err(e) => {
                    error!("Binding of node {} for {} failed: {}", name, parent, e);
                    failure = Some(e);
                }
            }
        }

        // 3. Workload counters
        if let Err(e) = self.aggregator.reconcile_all_workloads(&parent).await {
            warn!("Status aggregation for {} failed: {}", parent, e);
        }

        if let Some(e) = failure {
            return Err(e);
        }

        info!(
            "DeviceConfig {} reconciled across {} node(s)",
            parent,
            affected.len()
        );
        Ok(Action::requeue(RESYNC_INTERVAL))
    }

    /// Release every node of a DeviceConfig being deleted.
    ///
    /// Returns [`Error::CleanupPending`] while unbind workers are still
    /// outstanding, which keeps the finalizer in place.
    #[instrument(skip(self, config), fields(name = %config.name_any(), namespace = config.namespace()))]
    pub async fn cleanup(&self, config: &DeviceConfig) -> Result<Action> {
        let parent = ParentKey::from_config(config);
        let driver_key = driver_type_label(&parent);
        let ready_key = vfio_ready_label(&parent);

        info!("Cleaning up DeviceConfig {}", parent);

        let mut pending = 0;
        for node in self.cluster.list_nodes("").await? {
            let name = node.name_any();
            let labels = node.labels();
            if labels.contains_key(&driver_key) {
                self.workers.remove_driver_type_label(&parent, &name).await?;
            }
            if labels.contains_key(&ready_key) {
                self.workers
                    .ensure(config, &name, WorkerAction::Unload)
                    .await?;
                pending += 1;
            }
        }

        if pending > 0 {
            return Err(Error::CleanupPending { count: pending });
        }

        self.binder.ledger().forget(&parent);
        info!("DeviceConfig {} released all nodes", parent);
        Ok(Action::await_change())
    }
}

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub reconciler: DeviceConfigReconciler,
}

impl ControllerState {
    pub fn new(client: Client, utils_image: String, retry: RetryPolicy) -> Self {
        let cluster: Arc<dyn ClusterClient> = Arc::new(KubeCluster::new(client.clone()));
        Self {
            client,
            reconciler: DeviceConfigReconciler::new(cluster, utils_image, retry),
        }
    }
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let device_configs: Api<DeviceConfig> = Api::all(client.clone());

    info!("Starting DeviceConfig controller");

    // Verify CRD exists
    match device_configs.list(&Default::default()).await {
        Ok(_) => info!("DeviceConfig CRD is available"),
        Err(e) => {
            error!(
                "DeviceConfig CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "DeviceConfig CRD not installed".to_string(),
            ));
        }
    }

    let (reconcile_all_tx, reconcile_all_rx) = mpsc::channel::<()>(0);
    tokio::spawn(watchers::run_node_trigger(client.clone(), reconcile_all_tx));
    tokio::spawn(watchers::run_workload_status_loop(
        client.clone(),
        state.reconciler.aggregator().clone(),
    ));
    tokio::spawn(watchers::run_worker_pod_loop(
        client.clone(),
        state.reconciler.workers().clone(),
    ));

    Controller::new(device_configs, Config::default())
        // Counter ticks go to the aggregation loop, only spec or deletion
        // transitions of a DaemonSet re-run the full reconcile
        .watches(
            Api::all(client.clone()),
            Config::default(),
            watchers::daemonset_owner_trigger(Arc::new(Mutex::new(
                DaemonSetChangeFilter::default(),
            ))),
        )
        .owns::<Pod>(
            Api::all(client.clone()),
            Config::default().labels(WORKER_ACTION_LABEL),
        )
        .reconcile_all_on(reconcile_all_rx)
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => warn!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// The main reconciliation function
///
/// This function is called whenever:
/// - A DeviceConfig is created, updated, or deleted
/// - An owned DaemonSet changes generation or starts/stops deleting
/// - An owned worker pod changes
/// - A node changed in a way that can alter a binding decision
/// - The requeue timer expires
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<DeviceConfig>, ctx: Arc<ControllerState>) -> Result<Action> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<DeviceConfig> = Api::namespaced(ctx.client.clone(), &namespace);

    info!(
        "Reconciling DeviceConfig {}/{} (driver: {})",
        namespace,
        obj.name_any(),
        obj.spec.driver_type()
    );

    finalizer(&api, DEVICE_CONFIG_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(config) => ctx.reconciler.apply(&config).await,
            FinalizerEvent::Cleanup(config) => ctx.reconciler.cleanup(&config).await,
        }
    })
    .await
    .map_err(Error::from)
}

/// Error policy for the controller
fn error_policy(config: Arc<DeviceConfig>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    match error {
        Error::CleanupPending { .. } => info!("{}: {}", config.name_any(), error),
        _ => error!("Reconciliation error for {}: {:?}", config.name_any(), error),
    }

    // Use shorter retry for retriable errors
    let retry_duration = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };

    Action::requeue(retry_duration)
}
