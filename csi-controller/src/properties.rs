//! ZFS user-property metadata persistence.
//!
//! Every piece of out-of-band state the driver needs lives as user
//! properties on the dataset itself, under a reserved prefix. The appliance
//! is the single source of truth; an operator with shell access can
//! reconstruct ownership from `zfs get` alone.
//!
//! # Schema versioning
//! Schema v1 is the only version written. Datasets without a
//! `schema_version` property read as version `"0"` and are treated as
//! legacy: reads fall back to the legacy key names, writes stamp v1.

use std::collections::HashMap;

use chrono::Utc;
use tracing::instrument;

use truenas_client::api::{Dataset, DatasetUpdateParams, UserPropertyUpdate};
use truenas_client::Client;

use crate::error::Result;
use crate::params::{DeleteStrategy, Protocol};

/// Reserved prefix for every core-owned user property.
pub const PROPERTY_PREFIX: &str = "user:csi:";

/// Value of the `managed_by` tag on every dataset the driver owns.
pub const MANAGED_BY_TAG: &str = "truenas-csi";

/// Schema version stamped on newly written metadata.
pub const CURRENT_SCHEMA_VERSION: &str = "1";

/// Bare property names (unprefixed).
pub mod keys {
    pub const SCHEMA_VERSION: &str = "schema_version";
    pub const MANAGED_BY: &str = "managed_by";
    pub const CSI_VOLUME_NAME: &str = "csi_volume_name";
    pub const CAPACITY_BYTES: &str = "capacity_bytes";
    pub const PROTOCOL: &str = "protocol";
    pub const DELETE_STRATEGY: &str = "delete_strategy";
    pub const CREATED_AT: &str = "created_at";

    pub const ADOPTABLE: &str = "adoptable";
    pub const PVC_NAME: &str = "pvc_name";
    pub const PVC_NAMESPACE: &str = "pvc_namespace";
    pub const STORAGE_CLASS: &str = "storage_class";

    pub const NFS_SHARE_ID: &str = "nfs_share_id";
    pub const NFS_SHARE_PATH: &str = "nfs_share_path";

    pub const NVMEOF_SUBSYSTEM_ID: &str = "nvmeof_subsystem_id";
    pub const NVMEOF_NAMESPACE_ID: &str = "nvmeof_namespace_id";
    pub const NVMEOF_SUBSYSTEM_NQN: &str = "nvmeof_subsystem_nqn";

    pub const ISCSI_TARGET_ID: &str = "iscsi_target_id";
    pub const ISCSI_EXTENT_ID: &str = "iscsi_extent_id";
    pub const ISCSI_IQN: &str = "iscsi_iqn";

    pub const SNAPSHOT_ID: &str = "snapshot_id";
    pub const SOURCE_VOLUME_ID: &str = "source_volume_id";
    pub const DETACHED_SNAPSHOT: &str = "detached_snapshot";
    pub const SOURCE_DATASET: &str = "source_dataset";
    pub const CONTENT_SOURCE_TYPE: &str = "content_source_type";
    pub const CONTENT_SOURCE_ID: &str = "content_source_id";
}

/// Legacy key names from the pre-v1 schema, read-tolerated but never
/// written.
mod legacy {
    pub const PROVISIONED_AT: &str = "provisioned_at";
    pub const SNAPSHOT_CSI_NAME: &str = "snapshot_csi_name";
    pub const SNAPSHOT_SOURCE_VOLUME: &str = "snapshot_source_volume";
}

/// Prefix a bare key with the reserved namespace.
pub fn prefixed(key: &str) -> String {
    format!("{}{}", PROPERTY_PREFIX, key)
}

/// Read a property from an already-fetched map, resolving legacy
/// fallbacks. Unset reads yield the empty string.
pub fn read(properties: &HashMap<String, String>, key: &str) -> String {
    let direct = properties.get(&prefixed(key)).cloned().unwrap_or_default();
    if !direct.is_empty() {
        return direct;
    }
    let fallback = match key {
        keys::CREATED_AT => legacy::PROVISIONED_AT,
        keys::SNAPSHOT_ID => legacy::SNAPSHOT_CSI_NAME,
        keys::SOURCE_VOLUME_ID => legacy::SNAPSHOT_SOURCE_VOLUME,
        _ => return String::new(),
    };
    properties.get(&prefixed(fallback)).cloned().unwrap_or_default()
}

/// Schema version of a fetched property map; `"0"` marks a legacy dataset.
pub fn schema_version(properties: &HashMap<String, String>) -> String {
    let version = read(properties, keys::SCHEMA_VERSION);
    if version.is_empty() { "0".to_string() } else { version }
}

/// The core schema-v1 metadata stamped on every managed dataset.
#[derive(Debug, Clone)]
pub struct VolumeMetadata {
    pub csi_volume_name: String,
    pub capacity_bytes: u64,
    pub protocol: Protocol,
    pub delete_strategy: DeleteStrategy,
    pub created_at: String,
}

impl VolumeMetadata {
    pub fn new(
        csi_volume_name: &str,
        capacity_bytes: u64,
        protocol: Protocol,
        delete_strategy: DeleteStrategy,
    ) -> Self {
        Self {
            csi_volume_name: csi_volume_name.to_string(),
            capacity_bytes,
            protocol,
            delete_strategy,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    /// Expand into prefixed `(key, value)` pairs ready to store.
    pub fn to_entries(&self) -> Vec<(String, String)> {
        vec![
            (prefixed(keys::SCHEMA_VERSION), CURRENT_SCHEMA_VERSION.to_string()),
            (prefixed(keys::MANAGED_BY), MANAGED_BY_TAG.to_string()),
            (prefixed(keys::CSI_VOLUME_NAME), self.csi_volume_name.clone()),
            (prefixed(keys::CAPACITY_BYTES), self.capacity_bytes.to_string()),
            (prefixed(keys::PROTOCOL), self.protocol.as_str().to_string()),
            (
                prefixed(keys::DELETE_STRATEGY),
                self.delete_strategy.as_str().to_string(),
            ),
            (prefixed(keys::CREATED_AT), self.created_at.clone()),
        ]
    }
}

/// Read/write access to the reserved property namespace.
#[derive(Clone)]
pub struct PropertyStore {
    client: Client,
}

impl PropertyStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Merge N properties onto a dataset. Keys are bare names.
    #[instrument(skip(self, entries))]
    pub async fn set(&self, dataset: &str, entries: &[(&str, String)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let updates = entries
            .iter()
            .map(|(key, value)| UserPropertyUpdate::set(&prefixed(key), value))
            .collect();
        self.update(dataset, updates).await
    }

    /// Merge already-prefixed `(key, value)` pairs onto a dataset.
    pub async fn set_prefixed(&self, dataset: &str, entries: &[(String, String)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let updates = entries
            .iter()
            .map(|(key, value)| UserPropertyUpdate::set(key, value))
            .collect();
        self.update(dataset, updates).await
    }

    /// Fetch every core-owned property of a dataset (prefixed keys).
    pub async fn get_all(&self, dataset: &str) -> Result<HashMap<String, String>> {
        let record = self.client.dataset_get(dataset).await?;
        Ok(record
            .map(|d| {
                d.user_properties
                    .into_iter()
                    .filter(|(k, _)| k.starts_with(PROPERTY_PREFIX))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Fetch a subset of properties by bare name.
    pub async fn get_many(
        &self,
        dataset: &str,
        names: &[&str],
    ) -> Result<HashMap<String, String>> {
        let all = self.get_all(dataset).await?;
        Ok(names
            .iter()
            .map(|name| ((*name).to_string(), read(&all, name)))
            .collect())
    }

    /// Fetch one property; unset reads yield the empty string.
    pub async fn get(&self, dataset: &str, name: &str) -> Result<String> {
        let all = self.get_all(dataset).await?;
        Ok(read(&all, name))
    }

    /// Schema version of a dataset; `"0"` when unset (legacy).
    pub async fn get_schema_version(&self, dataset: &str) -> Result<String> {
        let all = self.get_all(dataset).await?;
        Ok(schema_version(&all))
    }

    /// Delete one property.
    #[instrument(skip(self))]
    pub async fn inherit(&self, dataset: &str, name: &str) -> Result<()> {
        self.update(dataset, vec![UserPropertyUpdate::remove(&prefixed(name))])
            .await
    }

    /// Delete N properties.
    pub async fn clear(&self, dataset: &str, names: &[&str]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let updates = names
            .iter()
            .map(|name| UserPropertyUpdate::remove(&prefixed(name)))
            .collect();
        self.update(dataset, updates).await
    }

    /// Scan datasets under a parent for a property value match.
    pub async fn find_by_property(
        &self,
        parent: &str,
        name: &str,
        value: &str,
    ) -> Result<Vec<Dataset>> {
        let key = prefixed(name);
        let children = self.client.dataset_children(parent).await?;
        Ok(children
            .into_iter()
            .filter(|d| d.user_properties.get(&key).map(String::as_str) == Some(value))
            .collect())
    }

    /// All datasets under a parent carrying the driver's ownership tag.
    pub async fn find_managed(&self, parent: &str) -> Result<Vec<Dataset>> {
        self.find_by_property(parent, keys::MANAGED_BY, MANAGED_BY_TAG)
            .await
    }

    /// The managed dataset whose CSI volume name matches, if any.
    pub async fn find_by_csi_name(&self, parent: &str, name: &str) -> Result<Option<Dataset>> {
        let mut matches = self
            .find_by_property(parent, keys::CSI_VOLUME_NAME, name)
            .await?;
        Ok(matches.drain(..).next())
    }

    async fn update(&self, dataset: &str, updates: Vec<UserPropertyUpdate>) -> Result<()> {
        let params = DatasetUpdateParams {
            user_properties_update: updates,
            ..Default::default()
        };
        self.client.dataset_update(dataset, params).await?;
        Ok(())
    }
}
