//! Declarative upgrade patch document.
//!
//! The document is shipped next to the binary and lists, per range of previously
//! installed versions, RFC 6902 patches to apply to the HyperConverged spec and objects
//! that must be removed. It is loaded and validated once per process.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use json_patch::{Patch, PatchErrorKind, PatchOperation};
use kube::api::GroupVersionKind;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::controller::version::VersionRange;
use crate::crd::HyperConvergedSpec;

/// Prefix every patch path must start with.
const SPEC_PATH_PREFIX: &str = "/spec/";

/// Root of the upgrade patch document.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradePatches {
    #[serde(rename = "hcoCRPatchList", default)]
    pub hco_cr_patch_list: Vec<HcoCrPatch>,
    #[serde(default)]
    pub objects_to_be_removed: Vec<ObjectToBeRemoved>,
}

/// Patch applied to the HyperConverged spec when upgrading from a matching version.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HcoCrPatch {
    pub semver_range: String,
    pub json_patch: Patch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_patch_apply_options: Option<JsonPatchApplyOptions>,
}

/// Relaxations applied while patching.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonPatchApplyOptions {
    /// A `remove` of a missing path is a no-op instead of an error.
    #[serde(default)]
    pub allow_missing_path_on_remove: bool,
    /// An `add` creates missing parent objects.
    #[serde(default)]
    pub ensure_path_exists_on_add: bool,
}

/// Object deleted when upgrading from a matching version.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectToBeRemoved {
    pub semver_range: String,
    pub group_version_kind: GroupVersionKindRef,
    pub object_key: ObjectKeyRef,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct GroupVersionKindRef {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
}

impl GroupVersionKindRef {
    pub fn to_gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ObjectKeyRef {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl UpgradePatches {
    /// Parse and validate a document.
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        let patches: Self = serde_json::from_slice(raw)
            .map_err(|e| Error::UpgradePatch(format!("failed to parse the upgrade patch document: {e}")))?;
        patches.validate()?;
        Ok(patches)
    }

    /// Read, parse and validate a document from disk.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path).await.map_err(|e| {
            Error::UpgradePatch(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_slice(&raw)
    }

    /// Check every entry before the document is used.
    pub fn validate(&self) -> Result<()> {
        for (i, p) in self.hco_cr_patch_list.iter().enumerate() {
            VersionRange::parse(&p.semver_range).map_err(|e| {
                Error::UpgradePatch(format!("hcoCRPatchList[{i}]: invalid semverRange: {e}"))
            })?;
            for op in p.json_patch.0.iter() {
                for path in operation_paths(op)? {
                    if !path.starts_with(SPEC_PATH_PREFIX) {
                        return Err(Error::UpgradePatch(format!(
                            "hcoCRPatchList[{i}]: path {path:?} is not under {SPEC_PATH_PREFIX}"
                        )));
                    }
                }
            }
        }

        for (i, o) in self.objects_to_be_removed.iter().enumerate() {
            VersionRange::parse(&o.semver_range).map_err(|e| {
                Error::UpgradePatch(format!("objectsToBeRemoved[{i}]: invalid semverRange: {e}"))
            })?;
            if o.group_version_kind.kind.is_empty() {
                return Err(Error::UpgradePatch(format!("objectsToBeRemoved[{i}]: missing kind")));
            }
            if o.group_version_kind.version.is_empty() {
                return Err(Error::UpgradePatch(format!(
                    "objectsToBeRemoved[{i}]: missing version"
                )));
            }
            if o.object_key.name.is_empty() {
                return Err(Error::UpgradePatch(format!("objectsToBeRemoved[{i}]: missing name")));
            }
        }
        Ok(())
    }

    /// Apply every patch whose range contains `known` to a copy of `spec`.
    ///
    /// Returns the patched spec if anything changed. A patch whose `test` operation fails
    /// is skipped as a whole; any other failure aborts.
    pub fn apply_spec_patches(
        &self,
        known: &Version,
        spec: &HyperConvergedSpec,
    ) -> Result<Option<HyperConvergedSpec>> {
        let mut doc = serde_json::json!({ "spec": spec });

        for p in &self.hco_cr_patch_list {
            let range = VersionRange::parse(&p.semver_range)?;
            if !range.matches(known) {
                continue;
            }
            info!(known_version = %known, range = %p.semver_range, "Applying upgrade patch");
            let options = p.json_patch_apply_options.unwrap_or_default();
            match apply_patch(&doc, &p.json_patch, options) {
                Ok(patched) => doc = patched,
                Err(e) if matches!(e.kind, PatchErrorKind::TestFailed) => {
                    debug!(range = %p.semver_range, "Upgrade patch test did not match, skipping");
                }
                Err(e) => return Err(Error::JsonPatch(e)),
            }
        }

        let patched_spec = match doc.get_mut("spec") {
            Some(value) => serde_json::from_value::<HyperConvergedSpec>(value.take())?,
            None => HyperConvergedSpec::default(),
        };
        if &patched_spec == spec {
            Ok(None)
        } else {
            Ok(Some(patched_spec))
        }
    }

    /// Removal entries whose range contains `known`.
    pub fn objects_to_remove<'a>(
        &'a self,
        known: &'a Version,
    ) -> impl Iterator<Item = Result<&'a ObjectToBeRemoved>> + 'a {
        self.objects_to_be_removed.iter().filter_map(move |o| {
            match VersionRange::parse(&o.semver_range) {
                Ok(range) if range.matches(known) => Some(Ok(o)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        })
    }
}

/// Paths referenced by an operation (`path`, plus `from` for move and copy).
fn operation_paths(op: &PatchOperation) -> Result<Vec<String>> {
    let value = serde_json::to_value(op)?;
    Ok(["path", "from"]
        .iter()
        .filter_map(|field| value.get(*field).and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}

/// Apply `patch` to a copy of `doc`, one operation at a time.
fn apply_patch(
    doc: &Value,
    patch: &Patch,
    options: JsonPatchApplyOptions,
) -> std::result::Result<Value, json_patch::PatchError> {
    let mut patched = doc.clone();
    for op in patch.0.iter() {
        let path = op_path(op);
        match op {
            PatchOperation::Remove(_) if options.allow_missing_path_on_remove => {
                if patched.pointer(&path).is_none() {
                    continue;
                }
            }
            PatchOperation::Add(_) if options.ensure_path_exists_on_add => {
                ensure_parents(&mut patched, &path);
            }
            _ => {}
        }
        json_patch::patch(&mut patched, std::slice::from_ref(op))?;
    }
    Ok(patched)
}

fn op_path(op: &PatchOperation) -> String {
    serde_json::to_value(op)
        .ok()
        .and_then(|v| v.get("path").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default()
}

/// Create the missing parent objects of a JSON pointer.
fn ensure_parents(doc: &mut Value, pointer: &str) {
    let tokens: Vec<String> = pointer
        .split('/')
        .skip(1)
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect();
    let Some((_, parents)) = tokens.split_last() else {
        return;
    };

    let mut current = doc;
    for token in parents {
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(token.clone())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}

/// Process-wide holder of the validated document.
///
/// The first caller loads the file; every later caller gets the same document.
#[derive(Debug)]
pub struct UpgradePatchStore {
    path: PathBuf,
    cell: OnceCell<Arc<UpgradePatches>>,
}

impl UpgradePatchStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cell: OnceCell::new(),
        }
    }

    /// A store that is already initialized with `patches`.
    pub fn from_patches(patches: UpgradePatches) -> Self {
        Self {
            path: PathBuf::new(),
            cell: OnceCell::new_with(Some(Arc::new(patches))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document on first use and return it.
    pub async fn get(&self) -> Result<Arc<UpgradePatches>> {
        self.cell
            .get_or_try_init(|| async {
                let patches = UpgradePatches::load(&self.path).await?;
                info!(
                    path = %self.path.display(),
                    patches = patches.hco_cr_patch_list.len(),
                    removals = patches.objects_to_be_removed.len(),
                    "Loaded upgrade patch document"
                );
                Ok::<_, Error>(Arc::new(patches))
            })
            .await
            .cloned()
    }
}
