//! Dataset management: `pool.dataset.*` methods.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::filter;
use crate::error::Result;
use crate::rpc::Client;

/// Dataset flavor: a mountable filesystem or a ZVOL block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatasetKind {
    Filesystem,
    Volume,
}

/// A dataset record as returned by the appliance.
#[derive(Debug, Clone, Deserialize)]
pub struct Dataset {
    /// Full dataset path, e.g. `tank/csi/pvc-1234`.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: DatasetKind,
    /// Volume size in bytes; only present for ZVOLs.
    #[serde(default)]
    pub volsize: Option<u64>,
    /// Origin snapshot when the dataset is a clone.
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub mountpoint: Option<String>,
    /// User properties, values as stored (strings).
    #[serde(default)]
    pub user_properties: HashMap<String, String>,
}

impl Dataset {
    /// Block-device node for a ZVOL.
    pub fn device_path(&self) -> String {
        format!("/dev/zvol/{}", self.id)
    }

    /// Whether the dataset was cloned from a snapshot and not yet promoted
    /// away from it.
    pub fn is_clone(&self) -> bool {
        self.origin.as_deref().is_some_and(|o| !o.is_empty())
    }
}

/// Encryption settings for dataset creation.
#[derive(Debug, Clone, Serialize)]
pub struct EncryptionOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    /// Let the appliance generate the key instead of supplying one.
    pub generate_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Body for `pool.dataset.create`.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetCreateParams {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DatasetKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volsize: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volblocksize: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sparse: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recordsize: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refquota: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_options: Option<EncryptionOptions>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub user_properties: HashMap<String, String>,
}

impl DatasetCreateParams {
    /// Minimal filesystem dataset.
    pub fn filesystem(name: &str) -> Self {
        Self::new(name, DatasetKind::Filesystem)
    }

    /// Minimal ZVOL of the given size.
    pub fn volume(name: &str, volsize: u64) -> Self {
        let mut params = Self::new(name, DatasetKind::Volume);
        params.volsize = Some(volsize);
        params
    }

    fn new(name: &str, kind: DatasetKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            volsize: None,
            volblocksize: None,
            sparse: None,
            compression: None,
            atime: None,
            recordsize: None,
            refquota: None,
            encryption: None,
            encryption_options: None,
            user_properties: HashMap::new(),
        }
    }
}

/// One user-property mutation inside a dataset update: set when `value`
/// is present, remove when `remove` is set.
#[derive(Debug, Clone, Serialize)]
pub struct UserPropertyUpdate {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove: Option<bool>,
}

impl UserPropertyUpdate {
    pub fn set(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: Some(value.to_string()),
            remove: None,
        }
    }

    pub fn remove(key: &str) -> Self {
        Self {
            key: key.to_string(),
            value: None,
            remove: Some(true),
        }
    }
}

/// Body for `pool.dataset.update`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DatasetUpdateParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volsize: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refquota: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recordsize: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atime: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub user_properties_update: Vec<UserPropertyUpdate>,
}

impl Client {
    /// Create a dataset (filesystem or ZVOL) and return the full record.
    pub async fn dataset_create(&self, params: DatasetCreateParams) -> Result<Dataset> {
        self.call("pool.dataset.create", vec![json!(params)])
            .await
            .map_err(|e| e.for_method("pool.dataset.create"))
    }

    /// Mutate dataset properties (resize, quotas, user properties, ...).
    pub async fn dataset_update(&self, id: &str, params: DatasetUpdateParams) -> Result<Dataset> {
        self.call("pool.dataset.update", vec![json!(id), json!(params)])
            .await
            .map_err(|e| e.for_method("pool.dataset.update"))
    }

    /// Destroy a dataset. `recursive` also destroys children and snapshots.
    pub async fn dataset_delete(&self, id: &str, recursive: bool) -> Result<()> {
        self.call::<bool>(
            "pool.dataset.delete",
            vec![json!(id), json!({ "recursive": recursive })],
        )
        .await
        .map_err(|e| e.for_method("pool.dataset.delete"))?;
        Ok(())
    }

    /// Query datasets with raw filter triples.
    pub async fn dataset_query(&self, filters: Vec<serde_json::Value>) -> Result<Vec<Dataset>> {
        self.call("pool.dataset.query", vec![json!(filters)])
            .await
            .map_err(|e| e.for_method("pool.dataset.query"))
    }

    /// Fetch one dataset by full path; `None` when absent.
    pub async fn dataset_get(&self, id: &str) -> Result<Option<Dataset>> {
        let mut found = self.dataset_query(vec![filter("id", "=", id)]).await?;
        Ok(found.drain(..).next())
    }

    /// List datasets directly under a parent path.
    pub async fn dataset_children(&self, parent: &str) -> Result<Vec<Dataset>> {
        let prefix = format!("{}/", parent);
        let all = self.dataset_query(vec![filter("id", "^", prefix.as_str())]).await?;
        Ok(all)
    }

    /// Recursively destroy every snapshot on a dataset.
    pub async fn dataset_destroy_snapshots(&self, id: &str) -> Result<()> {
        self.call::<serde_json::Value>("pool.dataset.destroy_snapshots", vec![json!(id)])
            .await
            .map_err(|e| e.for_method("pool.dataset.destroy_snapshots"))?;
        Ok(())
    }

    /// Promote a clone so the snapshot it was created from is no longer
    /// its origin.
    pub async fn dataset_promote(&self, id: &str) -> Result<()> {
        self.call::<serde_json::Value>("pool.dataset.promote", vec![json!(id)])
            .await
            .map_err(|e| e.for_method("pool.dataset.promote"))?;
        Ok(())
    }
}
