//! Volume lifecycle: create, delete, expand, adopt.
//!
//! Every multi-step operation composes idempotent steps: each step queries
//! for its outcome before mutating, so a half-built volume from a crashed
//! prior attempt completes on retry. Failures unwind the steps already
//! taken in strict reverse order before surfacing the original error.

use std::collections::HashMap;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use truenas_client::api::{Dataset, DatasetCreateParams, DatasetKind, DatasetUpdateParams,
    EncryptionOptions};
use truenas_client::Client;

use crate::error::{ControllerError, Result};
use crate::handle::{SnapshotHandle, VolumeHandle};
use crate::names::{resolve_leaf, NameInputs};
use crate::params::{ContentSource, CreateRequest, DeleteStrategy, Protocol, StorageClassParams};
use crate::properties::{keys, prefixed, read, PropertyStore, VolumeMetadata, MANAGED_BY_TAG};
use crate::share::{self, Rollback, ShareOutcome, UndoStep};

/// Result of a successful Create, fresh or adopted.
#[derive(Debug, Clone)]
pub struct ProvisionedVolume {
    pub handle: VolumeHandle,
    pub capacity_bytes: u64,
    /// Volume attributes the node plugin consumes.
    pub context: HashMap<String, String>,
    /// Whether an existing dataset was adopted instead of freshly created.
    pub adopted: bool,
}

/// Result of a successful Expand.
#[derive(Debug, Clone, Copy)]
pub struct ExpandOutcome {
    pub capacity_bytes: u64,
    /// Block protocols need a node-side filesystem/device resize.
    pub node_expansion_required: bool,
}

/// The provisioner: creates, deletes, expands, and adopts volumes on the
/// appliance through one shared RPC session.
#[derive(Clone)]
pub struct VolumeManager {
    client: Client,
    store: PropertyStore,
}

impl VolumeManager {
    pub fn new(client: Client) -> Self {
        let store = PropertyStore::new(client.clone());
        Self { client, store }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn store(&self) -> &PropertyStore {
        &self.store
    }

    /// Provision a volume: validate, resolve the dataset path, then either
    /// complete/adopt an existing dataset or create a fresh one, assemble
    /// the protocol share, and return the volume handle.
    #[instrument(skip(self, request), fields(volume = %request.name))]
    pub async fn create(&self, request: &CreateRequest) -> Result<ProvisionedVolume> {
        let params = StorageClassParams::from_map(&request.parameters)?;
        request.validate(&params)?;

        let inputs = NameInputs {
            volume_name: &request.name,
            pvc_name: request.pvc_name.as_deref().unwrap_or(""),
            pvc_namespace: request.pvc_namespace.as_deref().unwrap_or(""),
        };
        let leaf = resolve_leaf(&params, &inputs)?;
        let parent = params.parent_path();
        let dataset_path = format!("{}/{}", parent, leaf);

        let pool = self
            .client
            .pool_get(&params.pool)
            .await?
            .ok_or_else(|| {
                ControllerError::InvalidArgument(format!("pool '{}' does not exist", params.pool))
            })?;
        if request.required_bytes > pool.free {
            return Err(ControllerError::InvalidArgument(format!(
                "requested {} bytes exceeds free capacity {} of pool '{}'",
                request.required_bytes, pool.free, pool.name
            )));
        }

        // A dataset already carrying this CSI volume name is either an
        // adoption candidate or a prior (possibly half-built) attempt.
        if let Some(existing) = self.store.find_by_csi_name(&parent, &request.name).await? {
            return self.complete_existing(existing, request, &params).await;
        }

        // A foreign dataset at our target path is a collision, with one
        // exception: a content-source clone that crashed before its
        // metadata was stamped completes on this retry.
        if let Some(occupant) = self.client.dataset_get(&dataset_path).await? {
            let tag = read(&occupant.user_properties, keys::MANAGED_BY);
            if tag == MANAGED_BY_TAG {
                return Err(ControllerError::Internal(format!(
                    "dataset '{}' is managed but carries CSI volume name '{}'",
                    dataset_path,
                    read(&occupant.user_properties, keys::CSI_VOLUME_NAME)
                )));
            }
            if request.content_source.is_none() {
                return Err(ControllerError::AlreadyExists(format!(
                    "dataset '{}' exists and is not managed by this driver",
                    dataset_path
                )));
            }
        }

        let mut rollback = Rollback::new();
        match self
            .provision_steps(request, &params, &leaf, &dataset_path, &mut rollback)
            .await
        {
            Ok(volume) => {
                rollback.commit();
                info!(dataset = %dataset_path, handle = %volume.handle, "volume created");
                Ok(volume)
            }
            Err(error) => {
                warn!(dataset = %dataset_path, %error, "create failed, rolling back");
                rollback.unwind(&self.client).await;
                Err(error)
            }
        }
    }

    /// All create steps that mutate the appliance, in order.
    async fn provision_steps(
        &self,
        request: &CreateRequest,
        params: &StorageClassParams,
        leaf: &str,
        dataset_path: &str,
        rollback: &mut Rollback,
    ) -> Result<ProvisionedVolume> {
        let capacity = request.required_bytes;
        let metadata = VolumeMetadata::new(
            &request.name,
            capacity,
            params.protocol,
            params.delete_strategy,
        );

        match &request.content_source {
            None => {
                let create = self.build_create_params(params, dataset_path, capacity, &metadata, request);
                self.client.dataset_create(create).await?;
                rollback.push(UndoStep::DeleteDataset {
                    id: dataset_path.to_string(),
                });
            }
            Some(source) => {
                self.materialize_content_source(source, dataset_path, rollback)
                    .await?;
                self.stamp_cloned_dataset(request, params, dataset_path, capacity, &metadata)
                    .await?;
            }
        }

        self.write_adoption_labels(request, params, dataset_path).await?;

        let outcome = self
            .assemble_share(params, leaf, dataset_path, &request.name, rollback)
            .await?;

        Ok(self.build_result(params, dataset_path, capacity, outcome, false, request))
    }

    fn build_create_params(
        &self,
        params: &StorageClassParams,
        dataset_path: &str,
        capacity: u64,
        metadata: &VolumeMetadata,
        request: &CreateRequest,
    ) -> DatasetCreateParams {
        let mut create = if params.protocol.is_block() {
            let mut create = DatasetCreateParams::volume(dataset_path, capacity);
            create.volblocksize = params.volblocksize.clone();
            create.sparse = Some(true);
            create
        } else {
            let mut create = DatasetCreateParams::filesystem(dataset_path);
            create.refquota = Some(capacity);
            create.recordsize = params.recordsize.clone();
            create
        };
        create.compression = params.compression.clone();
        create.atime = params.atime.clone();
        if params.encryption {
            create.encryption = Some(true);
            create.encryption_options = Some(EncryptionOptions {
                algorithm: params.encryption_algorithm.clone(),
                generate_key: params.encryption_generate_key,
                key: None,
            });
        }
        let mut user_properties: HashMap<String, String> =
            metadata.to_entries().into_iter().collect();
        if let Some(source) = &request.content_source {
            let (kind, id) = content_source_fields(source);
            user_properties.insert(prefixed(keys::CONTENT_SOURCE_TYPE), kind.to_string());
            user_properties.insert(prefixed(keys::CONTENT_SOURCE_ID), id.to_string());
        }
        create.user_properties = user_properties;
        create
    }

    /// Clone or receive the requested content source into the target path.
    async fn materialize_content_source(
        &self,
        source: &ContentSource,
        target: &str,
        rollback: &mut Rollback,
    ) -> Result<()> {
        // A crashed prior attempt may have left the cloned dataset in
        // place; completing it is the retry contract.
        if self.client.dataset_get(target).await?.is_some() {
            info!(target, "content source already materialized");
            return Ok(());
        }

        match source {
            ContentSource::Snapshot(id) => match SnapshotHandle::parse(id)? {
                SnapshotHandle::Attached { dataset, name } => {
                    let full = format!("{}@{}", dataset, name);
                    if self.client.snapshot_get(&full).await?.is_none() {
                        return Err(ControllerError::FailedPrecondition(format!(
                            "source snapshot '{}' does not exist",
                            full
                        )));
                    }
                    self.clone_and_promote(&full, target, rollback, None).await
                }
                SnapshotHandle::Detached { dataset } => {
                    self.clone_via_intermediate(&dataset, target, rollback).await
                }
            },
            ContentSource::Volume(handle) => {
                let source_handle = VolumeHandle::parse(handle)?;
                self.clone_via_intermediate(&source_handle.dataset, target, rollback)
                    .await
            }
        }
    }

    /// Snapshot the source, clone the snapshot into the target, promote.
    async fn clone_via_intermediate(
        &self,
        source_dataset: &str,
        target: &str,
        rollback: &mut Rollback,
    ) -> Result<()> {
        if self.client.dataset_get(source_dataset).await?.is_none() {
            return Err(ControllerError::FailedPrecondition(format!(
                "source dataset '{}' does not exist",
                source_dataset
            )));
        }
        let temp = format!("csi-clone-{}", Uuid::new_v4());
        let snapshot = self.client.snapshot_create(source_dataset, &temp).await?;
        rollback.push(UndoStep::DeleteSnapshot {
            id: snapshot.id.clone(),
        });
        self.clone_and_promote(&snapshot.id, target, rollback, Some(&temp))
            .await
    }

    /// Clone, promote the clone away from the origin snapshot, and clean up
    /// the intermediate snapshot (which the promote migrated to the clone).
    async fn clone_and_promote(
        &self,
        snapshot: &str,
        target: &str,
        rollback: &mut Rollback,
        intermediate: Option<&str>,
    ) -> Result<()> {
        self.client.snapshot_clone(snapshot, target).await?;
        rollback.push(UndoStep::DeleteDataset {
            id: target.to_string(),
        });
        self.client.dataset_promote(target).await?;
        if let Some(name) = intermediate {
            let migrated = format!("{}@{}", target, name);
            if let Err(error) = self.client.snapshot_delete(&migrated).await {
                if !error.is_not_found() {
                    warn!(snapshot = %migrated, %error, "failed to delete intermediate snapshot");
                }
            }
        }
        Ok(())
    }

    /// Stamp schema-v1 metadata on a dataset materialized from a content
    /// source, and grow it to the requested capacity if needed.
    async fn stamp_cloned_dataset(
        &self,
        request: &CreateRequest,
        params: &StorageClassParams,
        dataset_path: &str,
        capacity: u64,
        metadata: &VolumeMetadata,
    ) -> Result<()> {
        let mut entries = metadata.to_entries();
        if let Some(source) = &request.content_source {
            let (kind, id) = content_source_fields(source);
            entries.push((prefixed(keys::CONTENT_SOURCE_TYPE), kind.to_string()));
            entries.push((prefixed(keys::CONTENT_SOURCE_ID), id.to_string()));
        }
        self.store.set_prefixed(dataset_path, &entries).await?;

        let record = self.client.dataset_get(dataset_path).await?.ok_or_else(|| {
            ControllerError::Internal(format!(
                "dataset '{}' vanished after materialization",
                dataset_path
            ))
        })?;
        match record.kind {
            DatasetKind::Volume => {
                // Clones inherit the source volsize; grow but never shrink.
                if record.volsize.unwrap_or(0) < capacity {
                    let update = DatasetUpdateParams {
                        volsize: Some(capacity),
                        ..Default::default()
                    };
                    self.client.dataset_update(dataset_path, update).await?;
                }
            }
            DatasetKind::Filesystem => {
                let update = DatasetUpdateParams {
                    refquota: Some(capacity),
                    ..Default::default()
                };
                self.client.dataset_update(dataset_path, update).await?;
            }
        }
        Ok(())
    }

    /// Write the adoption marker and PVC identity labels.
    async fn write_adoption_labels(
        &self,
        request: &CreateRequest,
        params: &StorageClassParams,
        dataset_path: &str,
    ) -> Result<()> {
        let mut entries: Vec<(&str, String)> = Vec::new();
        if params.mark_adoptable {
            entries.push((keys::ADOPTABLE, "true".to_string()));
        }
        if let Some(pvc) = &request.pvc_name {
            entries.push((keys::PVC_NAME, pvc.clone()));
        }
        if let Some(namespace) = &request.pvc_namespace {
            entries.push((keys::PVC_NAMESPACE, namespace.clone()));
        }
        if let Some(class) = request.parameters.get("storageClassName") {
            entries.push((keys::STORAGE_CLASS, class.clone()));
        }
        self.store.set(dataset_path, &entries).await
    }

    async fn assemble_share(
        &self,
        params: &StorageClassParams,
        leaf: &str,
        dataset_path: &str,
        csi_name: &str,
        rollback: &mut Rollback,
    ) -> Result<ShareOutcome> {
        match params.protocol {
            Protocol::Nfs => {
                share::ensure_nfs(&self.client, &self.store, dataset_path, csi_name, rollback).await
            }
            Protocol::Nvmeof => {
                share::ensure_nvmeof(&self.client, &self.store, dataset_path, leaf, params, rollback)
                    .await
            }
            Protocol::Iscsi => {
                share::ensure_iscsi(&self.client, &self.store, dataset_path, leaf, rollback).await
            }
        }
    }

    fn build_result(
        &self,
        params: &StorageClassParams,
        dataset_path: &str,
        capacity: u64,
        outcome: ShareOutcome,
        adopted: bool,
        request: &CreateRequest,
    ) -> ProvisionedVolume {
        let handle = VolumeHandle::new(
            params.protocol,
            &params.server,
            dataset_path,
            Some(outcome.extra),
        );
        let mut context: HashMap<String, String> = outcome.context.into_iter().collect();
        context.insert("server".to_string(), params.server.clone());
        context.insert("dataset".to_string(), dataset_path.to_string());
        context.insert("protocol".to_string(), params.protocol.as_str().to_string());
        if let Some(fs_type) = request.parameters.get("fsType") {
            context.insert("fsType".to_string(), fs_type.clone());
        }
        ProvisionedVolume {
            handle,
            capacity_bytes: capacity,
            context,
            adopted,
        }
    }

    /// Complete a Create against a dataset that already carries the
    /// requested CSI volume name: either the idempotent retry of a prior
    /// attempt or an operator-sanctioned adoption.
    async fn complete_existing(
        &self,
        existing: Dataset,
        request: &CreateRequest,
        params: &StorageClassParams,
    ) -> Result<ProvisionedVolume> {
        // Rebuild the share against the dataset as it exists, not against
        // what current naming parameters would resolve to.
        let leaf = existing
            .id
            .rsplit('/')
            .next()
            .unwrap_or(existing.id.as_str())
            .to_string();
        let properties = &existing.user_properties;
        if read(properties, keys::MANAGED_BY) != MANAGED_BY_TAG {
            return Err(ControllerError::AlreadyExists(format!(
                "dataset '{}' carries CSI volume name '{}' but no ownership tag",
                existing.id, request.name
            )));
        }
        let stored_protocol = read(properties, keys::PROTOCOL);
        if !stored_protocol.is_empty() && stored_protocol != params.protocol.as_str() {
            return Err(ControllerError::AlreadyExists(format!(
                "volume '{}' already exists over protocol '{}'",
                request.name, stored_protocol
            )));
        }

        let adoptable = read(properties, keys::ADOPTABLE) == "true";
        let adopting = params.adopt_existing && adoptable;
        if adopting {
            info!(dataset = %existing.id, volume = %request.name, "adopting existing dataset");
        } else {
            info!(dataset = %existing.id, volume = %request.name, "completing existing volume");
        }

        // Reconcile capacity: never resize down.
        let stored_capacity = read(properties, keys::CAPACITY_BYTES)
            .parse::<u64>()
            .unwrap_or_else(|_| existing.volsize.unwrap_or(0));
        let capacity = stored_capacity.max(request.required_bytes);
        if capacity > stored_capacity
            || read(properties, keys::CAPACITY_BYTES).is_empty()
        {
            if existing.kind == DatasetKind::Volume && existing.volsize.unwrap_or(0) < capacity {
                let update = DatasetUpdateParams {
                    volsize: Some(capacity),
                    ..Default::default()
                };
                self.client.dataset_update(&existing.id, update).await?;
            }
            self.store
                .set(&existing.id, &[(keys::CAPACITY_BYTES, capacity.to_string())])
                .await?;
        }

        // Re-create or repair the share; idempotent by construction. Steps
        // here mutate an adopted dataset, so no roll-back on failure.
        let mut rollback = Rollback::new();
        let outcome = self
            .assemble_share(params, &leaf, &existing.id, &request.name, &mut rollback)
            .await?;
        rollback.commit();

        // The adoption marker clears on success; classes that mark volumes
        // adoptable at create re-assert it.
        if params.mark_adoptable {
            self.store
                .set(&existing.id, &[(keys::ADOPTABLE, "true".to_string())])
                .await?;
        } else if adoptable {
            self.store.inherit(&existing.id, keys::ADOPTABLE).await?;
        }
        self.write_adoption_labels(request, params, &existing.id).await?;

        Ok(self.build_result(params, &existing.id, capacity, outcome, adopting, request))
    }

    /// Delete the volume behind a handle, honoring the stored strategy.
    ///
    /// Tear-down runs in strict reverse order of create: share resources
    /// first, then snapshots, then the dataset. Datasets the driver does
    /// not own are left untouched.
    #[instrument(skip(self), fields(dataset = %handle.dataset))]
    pub async fn delete(&self, handle: &VolumeHandle) -> Result<()> {
        let dataset = handle.dataset.as_str();
        let Some(record) = self.client.dataset_get(dataset).await? else {
            info!("dataset already absent");
            return Ok(());
        };
        let properties = &record.user_properties;
        if read(properties, keys::MANAGED_BY) != MANAGED_BY_TAG {
            warn!("dataset is not managed by this driver, leaving in place");
            return Ok(());
        }

        let strategy = read(properties, keys::DELETE_STRATEGY);
        if strategy == DeleteStrategy::Retain.as_str() {
            info!("delete strategy is retain, keeping dataset and share");
            return Ok(());
        }

        let leaf = dataset.rsplit('/').next().unwrap_or(dataset);
        let protocol = read(properties, keys::PROTOCOL)
            .parse::<Protocol>()
            .unwrap_or(handle.protocol);
        match protocol {
            Protocol::Nfs => share::teardown_nfs(&self.client, &self.store, dataset).await?,
            Protocol::Nvmeof => {
                share::teardown_nvmeof(&self.client, &self.store, dataset, leaf).await?
            }
            Protocol::Iscsi => share::teardown_iscsi(&self.client, leaf).await?,
        }

        // A clone must be promoted away from its origin snapshot first so
        // the origin can be cleaned up separately.
        if record.is_clone() {
            self.client.dataset_promote(dataset).await?;
        }
        self.client.dataset_destroy_snapshots(dataset).await?;
        match self.client.dataset_delete(dataset, false).await {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error.into()),
        }
        info!("volume deleted");
        Ok(())
    }

    /// Grow the volume to the requested size. Shrinking is rejected.
    #[instrument(skip(self), fields(dataset = %handle.dataset))]
    pub async fn expand(&self, handle: &VolumeHandle, required_bytes: u64) -> Result<ExpandOutcome> {
        let dataset = handle.dataset.as_str();
        let record = self
            .client
            .dataset_get(dataset)
            .await?
            .ok_or_else(|| ControllerError::NotFound(format!("dataset '{}' not found", dataset)))?;
        let properties = &record.user_properties;
        if read(properties, keys::MANAGED_BY) != MANAGED_BY_TAG {
            return Err(ControllerError::NotFound(format!(
                "dataset '{}' is not managed by this driver",
                dataset
            )));
        }

        let current = read(properties, keys::CAPACITY_BYTES)
            .parse::<u64>()
            .unwrap_or_else(|_| record.volsize.unwrap_or(0));
        let node_expansion_required = handle.protocol.is_block();
        if required_bytes < current {
            return Err(ControllerError::InvalidArgument(format!(
                "cannot shrink volume from {} to {} bytes",
                current, required_bytes
            )));
        }
        if required_bytes == current {
            return Ok(ExpandOutcome {
                capacity_bytes: current,
                node_expansion_required,
            });
        }

        let update = match record.kind {
            DatasetKind::Volume => DatasetUpdateParams {
                volsize: Some(required_bytes),
                ..Default::default()
            },
            DatasetKind::Filesystem => DatasetUpdateParams {
                refquota: Some(required_bytes),
                ..Default::default()
            },
        };
        self.client.dataset_update(dataset, update).await?;
        self.store
            .set(dataset, &[(keys::CAPACITY_BYTES, required_bytes.to_string())])
            .await?;

        info!(capacity_bytes = required_bytes, "volume expanded");
        Ok(ExpandOutcome {
            capacity_bytes: required_bytes,
            node_expansion_required,
        })
    }
}

fn content_source_fields(source: &ContentSource) -> (&'static str, &str) {
    match source {
        ContentSource::Snapshot(id) => ("snapshot", id.as_str()),
        ContentSource::Volume(handle) => ("volume", handle.as_str()),
    }
}
