//! Snapshot engine: attached and detached snapshots.
//!
//! An attached snapshot is a plain ZFS snapshot whose lifetime is tied to
//! its origin dataset. A detached snapshot is an independent dataset
//! materialized by the appliance's one-time replication (`zfs send | zfs
//! recv`) into a parallel path, so it survives deletion of the source.
//!
//! Snapshot metadata lives on the *source* dataset keyed by snapshot name
//! (the appliance does not reliably support user properties on snapshots
//! themselves); detached snapshots carry their metadata on their own
//! dataset.

use std::time::Duration;

use tracing::{info, instrument, warn};

use truenas_client::api::{JobState, ReplicationRunOnetimeParams};
use truenas_client::Client;

use crate::error::{ControllerError, Result};
use crate::handle::{SnapshotHandle, VolumeHandle};
use crate::params::parse_class_bool;
use crate::properties::{keys, prefixed, read, PropertyStore, CURRENT_SCHEMA_VERSION, MANAGED_BY_TAG};

/// Prefix of internal intermediate snapshots, hidden from listings.
const INTERMEDIATE_PREFIX: &str = "csi-";

/// Snapshot-class parameter surface.
#[derive(Debug, Clone)]
pub struct SnapshotClassParams {
    /// Materialize snapshots as independent datasets via replication.
    pub detached: bool,
    /// Interval between replication-job polls.
    pub poll_interval: Duration,
    /// Delete the intermediate source snapshot after a successful receive.
    pub cleanup_intermediate: bool,
}

impl Default for SnapshotClassParams {
    fn default() -> Self {
        Self {
            detached: false,
            poll_interval: Duration::from_secs(5),
            cleanup_intermediate: true,
        }
    }
}

impl SnapshotClassParams {
    pub fn from_map(parameters: &std::collections::HashMap<String, String>) -> Result<Self> {
        Ok(Self {
            detached: parse_class_bool(parameters, "detachedSnapshots")?,
            ..Self::default()
        })
    }
}

/// A snapshot as reported back to the orchestrator.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    /// CSI snapshot id: `dataset@name` (attached) or the detached dataset
    /// path.
    pub id: String,
    pub source_volume_id: String,
    pub created_at: String,
    pub detached: bool,
    pub ready: bool,
}

/// Creates, deletes, and lists snapshots on the appliance.
#[derive(Clone)]
pub struct SnapshotManager {
    client: Client,
    store: PropertyStore,
}

impl SnapshotManager {
    pub fn new(client: Client) -> Self {
        let store = PropertyStore::new(client.clone());
        Self { client, store }
    }

    /// Create a snapshot of the volume behind `source`.
    #[instrument(skip(self, class), fields(dataset = %source.dataset, snapshot = %name))]
    pub async fn create(
        &self,
        source: &VolumeHandle,
        name: &str,
        class: &SnapshotClassParams,
    ) -> Result<SnapshotInfo> {
        validate_snapshot_name(name)?;

        let record = self
            .client
            .dataset_get(&source.dataset)
            .await?
            .ok_or_else(|| {
                ControllerError::NotFound(format!("source dataset '{}' not found", source.dataset))
            })?;
        if read(&record.user_properties, keys::MANAGED_BY) != MANAGED_BY_TAG {
            return Err(ControllerError::NotFound(format!(
                "dataset '{}' is not managed by this driver",
                source.dataset
            )));
        }

        if class.detached {
            self.create_detached(source, name, class).await
        } else {
            self.create_attached(source, name).await
        }
    }

    async fn create_attached(&self, source: &VolumeHandle, name: &str) -> Result<SnapshotInfo> {
        let full = format!("{}@{}", source.dataset, name);
        let created_at = chrono::Utc::now().to_rfc3339();

        if self.client.snapshot_get(&full).await?.is_none() {
            self.client.snapshot_create(&source.dataset, name).await?;
            info!(snapshot = %full, "created attached snapshot");
        } else {
            info!(snapshot = %full, "attached snapshot already present");
        }

        // Metadata co-located on the parent, keyed by snapshot name so
        // sibling snapshots never collide.
        let protocol = source.protocol.as_str().to_string();
        let entries = vec![
            (snap_key(name, keys::SNAPSHOT_ID), full.clone()),
            (snap_key(name, keys::SOURCE_VOLUME_ID), source.to_string()),
            (snap_key(name, keys::PROTOCOL), protocol),
            (snap_key(name, keys::DETACHED_SNAPSHOT), "false".to_string()),
            (snap_key(name, keys::CREATED_AT), created_at.clone()),
        ];
        self.store.set_prefixed(&source.dataset, &entries).await?;

        Ok(SnapshotInfo {
            id: full,
            source_volume_id: source.to_string(),
            created_at,
            detached: false,
            ready: true,
        })
    }

    async fn create_detached(
        &self,
        source: &VolumeHandle,
        name: &str,
        class: &SnapshotClassParams,
    ) -> Result<SnapshotInfo> {
        let destination = detached_dataset_path(&source.dataset, name);

        // Idempotent retry: the destination may already be fully received.
        if let Some(existing) = self.client.dataset_get(&destination).await? {
            if read(&existing.user_properties, keys::DETACHED_SNAPSHOT) == "true" {
                info!(dataset = %destination, "detached snapshot already present");
                return Ok(SnapshotInfo {
                    id: destination,
                    source_volume_id: read(&existing.user_properties, keys::SOURCE_VOLUME_ID),
                    created_at: read(&existing.user_properties, keys::CREATED_AT),
                    detached: true,
                    ready: true,
                });
            }
            // Partial receive from a failed prior attempt; clear it first.
            warn!(dataset = %destination, "removing partially received dataset");
            self.client.dataset_delete(&destination, true).await?;
        }

        // Deterministic intermediate name so a retried create reuses it.
        let intermediate = format!("{}detach-{}", INTERMEDIATE_PREFIX, name);
        let intermediate_id = format!("{}@{}", source.dataset, intermediate);
        if self.client.snapshot_get(&intermediate_id).await?.is_none() {
            self.client
                .snapshot_create(&source.dataset, &intermediate)
                .await?;
        }

        let job_id = self
            .client
            .replication_run_onetime(ReplicationRunOnetimeParams::local(
                &source.dataset,
                &intermediate,
                &destination,
            ))
            .await?;
        info!(job_id, dataset = %destination, "replication started");

        let job = self.client.job_wait(job_id, class.poll_interval).await?;
        match job.state {
            JobState::Success => {}
            state => {
                let reason = job.error.unwrap_or_else(|| format!("job ended in {:?}", state));
                warn!(job_id, %reason, "replication failed, cleaning up");
                if let Err(error) = self.client.dataset_delete(&destination, true).await {
                    if !error.is_not_found() {
                        warn!(dataset = %destination, %error, "failed to remove partial dataset");
                    }
                }
                if let Err(error) = self.client.snapshot_delete(&intermediate_id).await {
                    if !error.is_not_found() {
                        warn!(snapshot = %intermediate_id, %error, "failed to remove intermediate snapshot");
                    }
                }
                return Err(match state {
                    JobState::Aborted => ControllerError::Aborted(reason),
                    _ => ControllerError::FailedPrecondition(reason),
                });
            }
        }

        let created_at = chrono::Utc::now().to_rfc3339();
        let entries = vec![
            (prefixed(keys::SCHEMA_VERSION), CURRENT_SCHEMA_VERSION.to_string()),
            (prefixed(keys::MANAGED_BY), MANAGED_BY_TAG.to_string()),
            (prefixed(keys::DETACHED_SNAPSHOT), "true".to_string()),
            (prefixed(keys::SNAPSHOT_ID), name.to_string()),
            (prefixed(keys::SOURCE_VOLUME_ID), source.to_string()),
            (prefixed(keys::SOURCE_DATASET), source.dataset.clone()),
            (prefixed(keys::PROTOCOL), source.protocol.as_str().to_string()),
            (prefixed(keys::CREATED_AT), created_at.clone()),
        ];
        self.store.set_prefixed(&destination, &entries).await?;

        if class.cleanup_intermediate {
            if let Err(error) = self.client.snapshot_delete(&intermediate_id).await {
                if !error.is_not_found() {
                    warn!(snapshot = %intermediate_id, %error, "failed to delete intermediate snapshot");
                }
            }
        }

        info!(dataset = %destination, "detached snapshot ready");
        Ok(SnapshotInfo {
            id: destination,
            source_volume_id: source.to_string(),
            created_at,
            detached: true,
            ready: true,
        })
    }

    /// Delete a snapshot by handle. Absent snapshots delete successfully.
    #[instrument(skip(self))]
    pub async fn delete(&self, handle: &SnapshotHandle) -> Result<()> {
        match handle {
            SnapshotHandle::Attached { dataset, name } => {
                let full = format!("{}@{}", dataset, name);
                match self.client.snapshot_delete(&full).await {
                    Ok(()) => info!(snapshot = %full, "deleted attached snapshot"),
                    Err(error) if error.is_not_found() => {}
                    Err(error) => return Err(error.into()),
                }
                // Drop the co-located metadata if the parent still exists.
                if self.client.dataset_get(dataset).await?.is_some() {
                    let names: Vec<String> = [
                        keys::SNAPSHOT_ID,
                        keys::SOURCE_VOLUME_ID,
                        keys::PROTOCOL,
                        keys::DETACHED_SNAPSHOT,
                        keys::CREATED_AT,
                    ]
                    .iter()
                    .map(|field| snap_key_bare(name, field))
                    .collect();
                    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
                    self.store.clear(dataset, &refs).await?;
                }
                Ok(())
            }
            SnapshotHandle::Detached { dataset } => {
                let Some(record) = self.client.dataset_get(dataset).await? else {
                    return Ok(());
                };
                if read(&record.user_properties, keys::MANAGED_BY) != MANAGED_BY_TAG {
                    warn!(%dataset, "detached snapshot dataset is not managed, leaving in place");
                    return Ok(());
                }
                match self.client.dataset_delete(dataset, true).await {
                    Ok(()) => info!(%dataset, "deleted detached snapshot"),
                    Err(error) if error.is_not_found() => {}
                    Err(error) => return Err(error.into()),
                }
                Ok(())
            }
        }
    }

    /// All snapshots of one volume: attached ones on its dataset plus
    /// detached ones under the parallel snapshot parent.
    pub async fn list_for_volume(&self, source: &VolumeHandle) -> Result<Vec<SnapshotInfo>> {
        let mut snapshots = Vec::new();

        let properties = self.store.get_all(&source.dataset).await?;
        for snapshot in self.client.snapshot_query(&source.dataset).await? {
            if snapshot.snapshot_name.starts_with(INTERMEDIATE_PREFIX) {
                continue;
            }
            let created_at =
                read(&properties, &snap_key_bare(&snapshot.snapshot_name, keys::CREATED_AT));
            snapshots.push(SnapshotInfo {
                id: snapshot.id,
                source_volume_id: source.to_string(),
                created_at,
                detached: false,
                ready: true,
            });
        }

        let detached_parent = detached_parent_path(&source.dataset);
        let detached = self
            .store
            .find_by_property(&detached_parent, keys::DETACHED_SNAPSHOT, "true")
            .await?;
        for dataset in detached {
            if read(&dataset.user_properties, keys::SOURCE_VOLUME_ID) != source.to_string() {
                continue;
            }
            snapshots.push(SnapshotInfo {
                id: dataset.id.clone(),
                source_volume_id: source.to_string(),
                created_at: read(&dataset.user_properties, keys::CREATED_AT),
                detached: true,
                ready: true,
            });
        }

        Ok(snapshots)
    }
}

/// Prefixed property key for one field of one named snapshot.
fn snap_key(snapshot: &str, field: &str) -> String {
    prefixed(&snap_key_bare(snapshot, field))
}

fn snap_key_bare(snapshot: &str, field: &str) -> String {
    format!("snap.{}.{}", snapshot, field)
}

/// Parallel path holding detached snapshots of volumes under a parent.
pub fn detached_parent_path(source_dataset: &str) -> String {
    match source_dataset.rsplit_once('/') {
        Some((parent, _)) => format!("{}-snapshots", parent),
        None => format!("{}-snapshots", source_dataset),
    }
}

/// Destination dataset for one detached snapshot.
pub fn detached_dataset_path(source_dataset: &str, snapshot: &str) -> String {
    let leaf = source_dataset.rsplit('/').next().unwrap_or(source_dataset);
    format!("{}/{}-{}", detached_parent_path(source_dataset), leaf, snapshot)
}

fn validate_snapshot_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ControllerError::InvalidArgument(
            "snapshot name is required".to_string(),
        ));
    }
    if name.starts_with(INTERMEDIATE_PREFIX) {
        return Err(ControllerError::InvalidArgument(format!(
            "snapshot name '{}' uses the reserved '{}' prefix",
            name, INTERMEDIATE_PREFIX
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(ControllerError::InvalidArgument(format!(
            "snapshot name '{}' contains invalid characters",
            name
        )));
    }
    Ok(())
}
