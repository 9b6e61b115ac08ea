//! Operator configuration read from the process environment.

use std::path::PathBuf;

use crate::controller::error::{Error, Result};
use crate::health::HEALTH_PORT;

/// Namespace the operator runs in. The HyperConverged resource must live there.
pub const ENV_OPERATOR_NAMESPACE: &str = "OPERATOR_NAMESPACE";
/// Version of the running operator build.
pub const ENV_OPERATOR_VERSION: &str = "HCO_KV_IO_VERSION";
/// Location of the declarative upgrade patch document.
pub const ENV_UPGRADE_PATCHES_PATH: &str = "UPGRADE_PATCHES_PATH";
/// Name of the OLM OperatorCondition object; only set when deployed by OLM.
pub const ENV_OPERATOR_CONDITION_NAME: &str = "OPERATOR_CONDITION_NAME";
/// Pod identity used as the leader election holder.
pub const ENV_POD_NAME: &str = "POD_NAME";
pub const ENV_POD_NAMESPACE: &str = "POD_NAMESPACE";
/// Port of the probe and metrics server.
pub const ENV_HEALTH_PORT: &str = "HEALTH_PROBE_PORT";

pub const ENV_KUBEVIRT_VERSION: &str = "KUBEVIRT_VERSION";
pub const ENV_CDI_VERSION: &str = "CDI_VERSION";
pub const ENV_NETWORK_ADDONS_VERSION: &str = "NETWORK_ADDONS_VERSION";
pub const ENV_SSP_VERSION: &str = "SSP_VERSION";
pub const ENV_TTO_VERSION: &str = "TTO_VERSION";

/// Default location of the upgrade patch document, relative to the working directory.
pub const DEFAULT_UPGRADE_PATCHES_PATH: &str = "./upgradePatches.json";

/// Expected versions of the subordinate operators shipped with this build.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ComponentVersions {
    pub kubevirt: Option<String>,
    pub cdi: Option<String>,
    pub network_addons: Option<String>,
    pub ssp: Option<String>,
    pub tto: Option<String>,
}

/// Environment-backed operator configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// The operator's own namespace. `None` when the variable is unset.
    pub operator_namespace: Option<String>,
    /// Version of this build, recorded as the "operator" entry of `status.versions`.
    pub own_version: String,
    pub upgrade_patches_path: PathBuf,
    pub component_versions: ComponentVersions,
    pub operator_condition_name: Option<String>,
    pub pod_name: Option<String>,
    pub pod_namespace: Option<String>,
    pub health_port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            operator_namespace: None,
            own_version: env!("CARGO_PKG_VERSION").to_string(),
            upgrade_patches_path: PathBuf::from(DEFAULT_UPGRADE_PATCHES_PATH),
            component_versions: ComponentVersions::default(),
            operator_condition_name: None,
            pod_name: None,
            pod_namespace: None,
            health_port: HEALTH_PORT,
        }
    }
}

impl OperatorConfig {
    /// Load the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Load the configuration from a custom lookup function.
    ///
    /// Empty values are treated as unset.
    pub fn from_env_with<F>(get_env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| get_env(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Self {
            operator_namespace: get(ENV_OPERATOR_NAMESPACE),
            own_version: get(ENV_OPERATOR_VERSION).unwrap_or(defaults.own_version),
            upgrade_patches_path: get(ENV_UPGRADE_PATCHES_PATH)
                .map(PathBuf::from)
                .unwrap_or(defaults.upgrade_patches_path),
            component_versions: ComponentVersions {
                kubevirt: get(ENV_KUBEVIRT_VERSION),
                cdi: get(ENV_CDI_VERSION),
                network_addons: get(ENV_NETWORK_ADDONS_VERSION),
                ssp: get(ENV_SSP_VERSION),
                tto: get(ENV_TTO_VERSION),
            },
            operator_condition_name: get(ENV_OPERATOR_CONDITION_NAME),
            pod_name: get(ENV_POD_NAME),
            pod_namespace: get(ENV_POD_NAMESPACE),
            health_port: get(ENV_HEALTH_PORT)
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(defaults.health_port),
        }
    }

    /// The operator namespace, or a configuration error if it is not set.
    pub fn operator_namespace(&self) -> Result<&str> {
        self.operator_namespace
            .as_deref()
            .ok_or_else(|| Error::Config(format!("{ENV_OPERATOR_NAMESPACE} is not set")))
    }

    /// Whether the operator was deployed by OLM.
    pub fn is_managed_by_olm(&self) -> bool {
        self.operator_condition_name.is_some()
    }

    /// Namespace of the leader election lease: the pod's, then the operator's.
    pub fn lease_namespace(&self) -> &str {
        self.pod_namespace
            .as_deref()
            .or(self.operator_namespace.as_deref())
            .unwrap_or("default")
    }
}
