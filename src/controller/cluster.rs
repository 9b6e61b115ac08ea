//! Cluster access used by the reconciler.
//!
//! `ClusterClient` is the narrow set of API calls the reconcile core makes. The
//! production implementation talks to the API server; tests use an in-memory fake.

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{
    Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, PostParams,
};
use kube::discovery::{ApiCapabilities, ApiResource, Scope};
use kube::{Client, ResourceExt};
use tracing::debug;

use crate::controller::context::FIELD_MANAGER;
use crate::controller::error::{Error, Result};
use crate::controller::request::ObjectKey;
use crate::crd::HyperConverged;

/// Cluster API calls made by the reconcile core.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get the HyperConverged resource; `None` if it does not exist.
    async fn get_hyperconverged(&self, key: &ObjectKey) -> Result<Option<HyperConverged>>;

    /// Write spec and metadata. The status in `hc` is ignored by the server.
    async fn update_hyperconverged(&self, hc: &HyperConverged) -> Result<HyperConverged>;

    /// Write the status subresource.
    async fn update_hyperconverged_status(&self, hc: &HyperConverged) -> Result<HyperConverged>;

    async fn get_crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>>;

    /// Write the status subresource of a CRD.
    async fn update_crd_status(&self, crd: &CustomResourceDefinition) -> Result<()>;

    /// Delete a CRD. Returns false if it did not exist.
    async fn delete_crd(&self, name: &str) -> Result<bool>;

    /// Get an arbitrary object. `None` if it, or its kind, does not exist.
    async fn get_object(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// Delete an arbitrary object. Returns false if it, or its kind, does not exist.
    async fn delete_object(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool>;

    /// List objects of a kind matching a label selector. Empty if the kind is not served.
    async fn list_objects(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>>;
}

/// Map HTTP 409 responses to `Error::Conflict`.
fn map_write_error(err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ref e) if e.code == 409 => Error::Conflict(e.message.clone()),
        other => Error::Kube(other),
    }
}

/// Body of a status subresource replace: the whole object, so fields that were
/// cleared are cleared on the server too, and its resourceVersion guards the write.
fn status_body<K: serde::Serialize>(obj: &K) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(obj)?)
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

/// `ClusterClient` backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn post_params() -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(FIELD_MANAGER.to_string()),
        }
    }

    fn hyperconverged_api(&self, namespace: &str) -> Api<HyperConverged> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Resolve a kind through discovery. `None` if the kind is not served.
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<(ApiResource, ApiCapabilities)>> {
        match kube::discovery::pinned_kind(&self.client, gvk).await {
            Ok(found) => Ok(Some(found)),
            Err(kube::Error::Discovery(e)) => {
                debug!(kind = %gvk.kind, group = %gvk.group, error = %e, "Kind is not served");
                Ok(None)
            }
            Err(e) if is_not_found(&e) => {
                debug!(kind = %gvk.kind, group = %gvk.group, "Kind is not served");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn dynamic_api(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Option<Api<DynamicObject>>> {
        let Some((ar, caps)) = self.resolve(gvk).await? else {
            return Ok(None);
        };
        let api = match (caps.scope, namespace) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        Ok(Some(api))
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_hyperconverged(&self, key: &ObjectKey) -> Result<Option<HyperConverged>> {
        Ok(self
            .hyperconverged_api(&key.namespace)
            .get_opt(&key.name)
            .await?)
    }

    async fn update_hyperconverged(&self, hc: &HyperConverged) -> Result<HyperConverged> {
        let namespace = hc
            .namespace()
            .ok_or_else(|| Error::MissingField("metadata.namespace".to_string()))?;
        self.hyperconverged_api(&namespace)
            .replace(&hc.name_any(), &Self::post_params(), hc)
            .await
            .map_err(map_write_error)
    }

    async fn update_hyperconverged_status(&self, hc: &HyperConverged) -> Result<HyperConverged> {
        let namespace = hc
            .namespace()
            .ok_or_else(|| Error::MissingField("metadata.namespace".to_string()))?;
        self.hyperconverged_api(&namespace)
            .replace_status(&hc.name_any(), &Self::post_params(), status_body(hc)?)
            .await
            .map_err(map_write_error)
    }

    async fn get_crd(&self, name: &str) -> Result<Option<CustomResourceDefinition>> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn update_crd_status(&self, crd: &CustomResourceDefinition) -> Result<()> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        api.replace_status(&crd.name_any(), &Self::post_params(), status_body(crd)?)
            .await
            .map_err(map_write_error)?;
        Ok(())
    }

    async fn delete_crd(&self, name: &str) -> Result<bool> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_object(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let Some(api) = self.dynamic_api(gvk, namespace).await? else {
            return Ok(None);
        };
        Ok(api.get_opt(name).await?)
    }

    async fn delete_object(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool> {
        let Some(api) = self.dynamic_api(gvk, namespace).await? else {
            return Ok(false);
        };
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_objects(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let Some(api) = self.dynamic_api(gvk, namespace).await? else {
            return Ok(Vec::new());
        };
        let params = ListParams::default().labels(label_selector);
        Ok(api.list(&params).await?.items)
    }
}
