//! Cluster access seam
//!
//! Every read and write the reconcilers perform goes through [`ClusterClient`]
//! so the decision logic can be exercised without an API server.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::DeviceConfig;
use crate::error::{Error, Result};

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "gpu-device-operator";

/// Trait abstracting the Kubernetes operations used by the operator
///
/// Reads return `Ok(None)` for objects that do not exist. Deletes treat a
/// missing object as success.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_device_config(&self, namespace: &str, name: &str)
        -> Result<Option<DeviceConfig>>;

    /// Merge-patch the status subresource of a DeviceConfig
    async fn patch_device_config_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()>;

    async fn get_daemonset(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>>;

    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// List nodes matching a label selector, all nodes for an empty selector
    async fn list_nodes(&self, selector: &str) -> Result<Vec<Node>>;

    /// Merge-patch individual node labels, `None` removes the key
    async fn patch_node_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<()>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<()>;

    async fn patch_pod(&self, namespace: &str, name: &str, patch: &serde_json::Value)
        -> Result<()>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`ClusterClient`] backed by a live kube client
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn merge_params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_device_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DeviceConfig>> {
        let api: Api<DeviceConfig> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_device_config_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        let api: Api<DeviceConfig> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(name, &Self::merge_params(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn get_daemonset(&self, namespace: &str, name: &str) -> Result<Option<DaemonSet>> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_nodes(&self, selector: &str) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn patch_node_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "metadata": { "labels": labels } });
        api.patch(name, &Self::merge_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.create(&params, pod).await?;
        Ok(())
    }

    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &Self::merge_params(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(2),
            ..Default::default()
        };
        match api.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!("Pod {}/{} already gone", namespace, name);
                Ok(())
            }
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}
