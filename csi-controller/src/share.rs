//! Share resource assembly and tear-down.
//!
//! Each protocol maps a dataset to exactly one share resource: an NFS
//! export, an NVMe-oF subsystem with one namespace and its port bindings,
//! or an iSCSI target with one ZVOL extent. Assembly is idempotent (every
//! step queries by key before creating) and records an undo step for each
//! mutation so a failing later step can unwind in strict reverse order.

use tracing::{debug, info, warn};

use truenas_client::api::NfsShareCreateParams;
use truenas_client::Client;

use crate::error::{ControllerError, Result};
use crate::params::StorageClassParams;
use crate::properties::{keys, PropertyStore};

/// Base NQN prepended to the leaf name for NVMe-oF subsystems.
pub const NQN_BASE: &str = "nqn.2005-10.org.freenas.ctl";

/// Base IQN the appliance prepends to iSCSI target names.
pub const IQN_BASE: &str = "iqn.2005-10.org.freenas.ctl";

/// One reversible mutation performed during a multi-step operation.
#[derive(Debug)]
pub enum UndoStep {
    DeleteDataset { id: String },
    DeleteSnapshot { id: String },
    DeleteNfsShare { id: i64 },
    DeleteNvmetPortBinding { id: i64 },
    DeleteNvmetNamespace { id: i64 },
    DeleteNvmetSubsystem { id: i64 },
    DeleteIscsiTargetExtent { id: i64 },
    DeleteIscsiExtent { id: i64 },
    DeleteIscsiTarget { id: i64 },
}

/// Undo stack for best-effort roll-back of a failed composition.
///
/// Unwinding runs the recorded steps in reverse order; failures are logged
/// and never mask the error that triggered the roll-back.
#[derive(Debug, Default)]
pub struct Rollback {
    steps: Vec<UndoStep>,
}

impl Rollback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: UndoStep) {
        self.steps.push(step);
    }

    /// Forget the recorded steps; called once the operation has succeeded.
    pub fn commit(mut self) {
        self.steps.clear();
    }

    pub async fn unwind(self, client: &Client) {
        for step in self.steps.into_iter().rev() {
            debug!(?step, "rolling back");
            let outcome = match &step {
                UndoStep::DeleteDataset { id } => client.dataset_delete(id, true).await,
                UndoStep::DeleteSnapshot { id } => client.snapshot_delete(id).await,
                UndoStep::DeleteNfsShare { id } => client.nfs_share_delete(*id).await,
                UndoStep::DeleteNvmetPortBinding { id } => {
                    client.nvmet_port_subsys_delete(*id).await
                }
                UndoStep::DeleteNvmetNamespace { id } => client.nvmet_namespace_delete(*id).await,
                UndoStep::DeleteNvmetSubsystem { id } => client.nvmet_subsys_delete(*id).await,
                UndoStep::DeleteIscsiTargetExtent { id } => {
                    client.iscsi_targetextent_delete(*id).await
                }
                UndoStep::DeleteIscsiExtent { id } => client.iscsi_extent_delete(*id).await,
                UndoStep::DeleteIscsiTarget { id } => client.iscsi_target_delete(*id).await,
            };
            if let Err(error) = outcome {
                warn!(?step, %error, "roll-back step failed");
            }
        }
    }
}

/// Result of assembling the protocol share for a dataset.
#[derive(Debug, Clone)]
pub struct ShareOutcome {
    /// Protocol extra carried in the volume handle (export path, NQN, IQN).
    pub extra: String,
    /// Context entries the node plugin consumes.
    pub context: Vec<(String, String)>,
}

/// Treat an appliance not-found as already-done during tear-down.
fn ignore_not_found<T>(result: truenas_client::Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(error) if error.is_not_found() => Ok(()),
        Err(error) => Err(error.into()),
    }
}

// ============================================================================
// NFS
// ============================================================================

/// Ensure the NFS export for a filesystem dataset exists.
pub async fn ensure_nfs(
    client: &Client,
    store: &PropertyStore,
    dataset: &str,
    csi_name: &str,
    rollback: &mut Rollback,
) -> Result<ShareOutcome> {
    let path = format!("/mnt/{}", dataset);
    let share = match client.nfs_share_find_by_path(&path).await? {
        Some(existing) => {
            debug!(%path, share_id = existing.id, "nfs export already present");
            existing
        }
        None => {
            let comment = format!("csi volume {}", csi_name);
            let created = client
                .nfs_share_create(NfsShareCreateParams::for_path(&path, &comment))
                .await?;
            info!(%path, share_id = created.id, "created nfs export");
            rollback.push(UndoStep::DeleteNfsShare { id: created.id });
            created
        }
    };

    store
        .set(
            dataset,
            &[
                (keys::NFS_SHARE_ID, share.id.to_string()),
                (keys::NFS_SHARE_PATH, path.clone()),
            ],
        )
        .await?;

    Ok(ShareOutcome {
        extra: path.clone(),
        context: vec![("export".to_string(), path)],
    })
}

/// Remove the NFS export for a dataset, tolerating prior removal.
pub async fn teardown_nfs(client: &Client, store: &PropertyStore, dataset: &str) -> Result<()> {
    let share_id = store.get(dataset, keys::NFS_SHARE_ID).await?;
    let share = match share_id.parse::<i64>() {
        Ok(id) => Some(id),
        // Property lost or never written; fall back to the keyed query.
        Err(_) => {
            let path = format!("/mnt/{}", dataset);
            client.nfs_share_find_by_path(&path).await?.map(|s| s.id)
        }
    };
    if let Some(id) = share {
        ignore_not_found(client.nfs_share_delete(id).await)?;
        info!(dataset, share_id = id, "deleted nfs export");
    }
    Ok(())
}

// ============================================================================
// NVMe-oF
// ============================================================================

/// Ensure the NVMe-oF subsystem, its single namespace, and its port
/// bindings exist for a ZVOL.
pub async fn ensure_nvmeof(
    client: &Client,
    store: &PropertyStore,
    dataset: &str,
    leaf: &str,
    params: &StorageClassParams,
    rollback: &mut Rollback,
) -> Result<ShareOutcome> {
    let nqn = format!("{}:{}", NQN_BASE, leaf);
    let device_path = format!("/dev/zvol/{}", dataset);

    let subsystem = match client.nvmet_subsys_find_by_nqn(&nqn).await? {
        Some(existing) => {
            debug!(%nqn, subsys_id = existing.id, "subsystem already present");
            existing
        }
        None => {
            let created = client.nvmet_subsys_create(leaf, &nqn, true).await?;
            info!(%nqn, subsys_id = created.id, "created nvmeof subsystem");
            rollback.push(UndoStep::DeleteNvmetSubsystem { id: created.id });
            created
        }
    };

    // At most one namespace per subsystem; replace a stale one pointing at
    // the wrong device.
    let mut namespace = None;
    for existing in client.nvmet_namespace_query(subsystem.id).await? {
        if existing.device_path == device_path && namespace.is_none() {
            namespace = Some(existing);
        } else {
            warn!(
                subsys_id = subsystem.id,
                nsid = existing.nsid,
                device_path = %existing.device_path,
                "removing unexpected namespace"
            );
            client.nvmet_namespace_delete(existing.id).await?;
        }
    }
    let namespace = match namespace {
        Some(existing) => existing,
        None => {
            let created = client.nvmet_namespace_create(subsystem.id, &device_path).await?;
            info!(subsys_id = subsystem.id, nsid = created.nsid, "created namespace");
            rollback.push(UndoStep::DeleteNvmetNamespace { id: created.id });
            created
        }
    };

    let port_ids = select_ports(client, params).await?;
    let bound: Vec<i64> = client
        .nvmet_port_subsys_query(subsystem.id)
        .await?
        .into_iter()
        .map(|b| b.port_id)
        .collect();
    for port_id in &port_ids {
        if bound.contains(port_id) {
            continue;
        }
        let binding = client.nvmet_port_subsys_create(*port_id, subsystem.id).await?;
        info!(subsys_id = subsystem.id, port_id, "bound subsystem to port");
        rollback.push(UndoStep::DeleteNvmetPortBinding { id: binding.id });
    }

    store
        .set(
            dataset,
            &[
                (keys::NVMEOF_SUBSYSTEM_ID, subsystem.id.to_string()),
                (keys::NVMEOF_NAMESPACE_ID, namespace.id.to_string()),
                (keys::NVMEOF_SUBSYSTEM_NQN, nqn.clone()),
            ],
        )
        .await?;

    Ok(ShareOutcome {
        extra: nqn.clone(),
        context: vec![
            ("nqn".to_string(), nqn),
            ("nsid".to_string(), namespace.nsid.to_string()),
        ],
    })
}

/// The port ids the storage class binds subsystems to.
async fn select_ports(client: &Client, params: &StorageClassParams) -> Result<Vec<i64>> {
    if !params.nvmeof_ports.is_empty() {
        return Ok(params.nvmeof_ports.clone());
    }
    let transport = params.nvmeof_transport.as_deref().map(str::to_uppercase);
    let ports: Vec<i64> = client
        .nvmet_port_query()
        .await?
        .into_iter()
        .filter(|p| transport.as_deref().is_none_or(|t| p.addr_trtype == t))
        .map(|p| p.id)
        .collect();
    if ports.is_empty() {
        return Err(ControllerError::FailedPrecondition(
            "no matching NVMe-oF ports configured on the appliance".to_string(),
        ));
    }
    Ok(ports)
}

/// Remove port bindings, namespaces, and the subsystem, in that order.
pub async fn teardown_nvmeof(
    client: &Client,
    store: &PropertyStore,
    dataset: &str,
    leaf: &str,
) -> Result<()> {
    let stored_nqn = store.get(dataset, keys::NVMEOF_SUBSYSTEM_NQN).await?;
    let nqn = if stored_nqn.is_empty() {
        format!("{}:{}", NQN_BASE, leaf)
    } else {
        stored_nqn
    };
    let Some(subsystem) = client.nvmet_subsys_find_by_nqn(&nqn).await? else {
        debug!(%nqn, "subsystem already absent");
        return Ok(());
    };

    for binding in client.nvmet_port_subsys_query(subsystem.id).await? {
        ignore_not_found(client.nvmet_port_subsys_delete(binding.id).await)?;
    }
    for namespace in client.nvmet_namespace_query(subsystem.id).await? {
        ignore_not_found(client.nvmet_namespace_delete(namespace.id).await)?;
    }
    ignore_not_found(client.nvmet_subsys_delete(subsystem.id).await)?;
    info!(%nqn, subsys_id = subsystem.id, "deleted nvmeof subsystem");
    Ok(())
}

// ============================================================================
// iSCSI
// ============================================================================

/// Ensure the iSCSI target, its ZVOL extent, and their association exist.
pub async fn ensure_iscsi(
    client: &Client,
    store: &PropertyStore,
    dataset: &str,
    leaf: &str,
    rollback: &mut Rollback,
) -> Result<ShareOutcome> {
    let iqn = format!("{}:{}", IQN_BASE, leaf);

    let target = match client.iscsi_target_find_by_name(leaf).await? {
        Some(existing) => existing,
        None => {
            let created = client.iscsi_target_create(leaf, None).await?;
            info!(%iqn, target_id = created.id, "created iscsi target");
            rollback.push(UndoStep::DeleteIscsiTarget { id: created.id });
            created
        }
    };

    let expected_disk = format!("zvol/{}", dataset);
    let extent = match client.iscsi_extent_find_by_name(leaf).await? {
        Some(existing) if existing.disk == expected_disk => existing,
        Some(stale) => {
            warn!(
                extent_id = stale.id,
                disk = %stale.disk,
                "replacing extent pointing at unexpected disk"
            );
            client.iscsi_extent_delete(stale.id).await?;
            let created = client.iscsi_extent_create(leaf, dataset).await?;
            rollback.push(UndoStep::DeleteIscsiExtent { id: created.id });
            created
        }
        None => {
            let created = client.iscsi_extent_create(leaf, dataset).await?;
            info!(extent_id = created.id, "created iscsi extent");
            rollback.push(UndoStep::DeleteIscsiExtent { id: created.id });
            created
        }
    };

    let associated = client
        .iscsi_targetextent_query_by_target(target.id)
        .await?
        .into_iter()
        .any(|te| te.extent == extent.id);
    if !associated {
        let association = client.iscsi_targetextent_create(target.id, extent.id).await?;
        rollback.push(UndoStep::DeleteIscsiTargetExtent { id: association.id });
    }

    store
        .set(
            dataset,
            &[
                (keys::ISCSI_TARGET_ID, target.id.to_string()),
                (keys::ISCSI_EXTENT_ID, extent.id.to_string()),
                (keys::ISCSI_IQN, iqn.clone()),
            ],
        )
        .await?;

    Ok(ShareOutcome {
        extra: iqn.clone(),
        context: vec![("iqn".to_string(), iqn)],
    })
}

/// Dissociate, delete the extent, then the target.
pub async fn teardown_iscsi(client: &Client, leaf: &str) -> Result<()> {
    if let Some(target) = client.iscsi_target_find_by_name(leaf).await? {
        for association in client.iscsi_targetextent_query_by_target(target.id).await? {
            ignore_not_found(client.iscsi_targetextent_delete(association.id).await)?;
        }
        if let Some(extent) = client.iscsi_extent_find_by_name(leaf).await? {
            ignore_not_found(client.iscsi_extent_delete(extent.id).await)?;
        }
        ignore_not_found(client.iscsi_target_delete(target.id).await)?;
        info!(leaf, target_id = target.id, "deleted iscsi target");
    } else if let Some(extent) = client.iscsi_extent_find_by_name(leaf).await? {
        // Target already gone but the extent survived a partial tear-down.
        ignore_not_found(client.iscsi_extent_delete(extent.id).await)?;
    }
    Ok(())
}
