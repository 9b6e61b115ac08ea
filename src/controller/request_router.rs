//! Classification of work-queue keys.
//!
//! Changes to secondary resources are enqueued under placeholder keys instead of the
//! HyperConverged key, so the reconciler can tell what triggered a cycle while every
//! trigger still lands on one queue entry. Placeholder names carry a random suffix
//! generated at process start; they are never persisted and never name a real object.

use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::controller::request::ObjectKey;
use crate::crd::HYPERCONVERGED_NAME;

/// Prefix of the placeholder used for changes on subordinate and owned resources.
pub const SECONDARY_CR_PREFIX: &str = "hco-controlled-cr-";
/// Prefix of the placeholder used for changes on the cluster APIServer configuration.
pub const API_SERVER_CR_PREFIX: &str = "hco-apiserver-cr-";

/// What caused a cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// The HyperConverged resource itself (or any key that is not a placeholder).
    Primary,
    /// A subordinate or owned resource.
    SecondaryCr,
    /// The external APIServer resource; its cached copy must be refreshed.
    ApiServerCr,
}

/// Result of routing a queue key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutedRequest {
    /// Identity to operate on for the rest of the cycle.
    pub key: ObjectKey,
    pub trigger: Trigger,
    pub hco_triggered: bool,
}

/// Maps queue keys to the HyperConverged identity.
#[derive(Clone, Debug)]
pub struct RequestRouter {
    operator_namespace: Option<String>,
    secondary_cr_name: String,
    api_server_cr_name: String,
}

impl RequestRouter {
    /// Create a router with a fresh random placeholder suffix.
    pub fn new(operator_namespace: Option<String>) -> Self {
        Self::with_suffix(operator_namespace, &uuid::Uuid::new_v4().to_string())
    }

    pub fn with_suffix(operator_namespace: Option<String>, suffix: &str) -> Self {
        Self {
            operator_namespace,
            secondary_cr_name: format!("{SECONDARY_CR_PREFIX}{suffix}"),
            api_server_cr_name: format!("{API_SERVER_CR_PREFIX}{suffix}"),
        }
    }

    fn namespace(&self) -> Result<&str> {
        self.operator_namespace
            .as_deref()
            .ok_or_else(|| Error::Config("the operator namespace is not configured".to_string()))
    }

    /// The one HyperConverged identity this operator serves.
    pub fn primary_key(&self) -> Result<ObjectKey> {
        Ok(ObjectKey::new(self.namespace()?, HYPERCONVERGED_NAME))
    }

    /// Key to enqueue when a subordinate or owned resource changes.
    pub fn secondary_cr_key(&self) -> Result<ObjectKey> {
        Ok(ObjectKey::new(self.namespace()?, self.secondary_cr_name.as_str()))
    }

    /// Key to enqueue when the APIServer resource changes.
    pub fn api_server_cr_key(&self) -> Result<ObjectKey> {
        Ok(ObjectKey::new(self.namespace()?, self.api_server_cr_name.as_str()))
    }

    /// Classify `key` and resolve the identity to reconcile.
    pub fn resolve(&self, key: &ObjectKey) -> Result<RoutedRequest> {
        let secondary = self.secondary_cr_key()?;
        let api_server = self.api_server_cr_key()?;

        let routed = if *key == secondary {
            RoutedRequest {
                key: self.primary_key()?,
                trigger: Trigger::SecondaryCr,
                hco_triggered: false,
            }
        } else if *key == api_server {
            RoutedRequest {
                key: self.primary_key()?,
                trigger: Trigger::ApiServerCr,
                hco_triggered: true,
            }
        } else {
            RoutedRequest {
                key: key.clone(),
                trigger: Trigger::Primary,
                hco_triggered: true,
            }
        };

        debug!(request = %key, resolved = %routed.key, trigger = ?routed.trigger, "Routed reconcile request");
        Ok(routed)
    }
}
