//! TrueNAS CSI Controller Library
//!
//! Volume provisioning against a ZFS-based NAS appliance over its
//! JSON-RPC WebSocket API. Volumes are exposed over NFS, NVMe-oF, or
//! iSCSI; all driver metadata is persisted as ZFS user properties on the
//! datasets themselves, so the appliance remains the single source of
//! truth.
//!
//! This library provides:
//! - Volume lifecycle management (create, delete, expand, adopt)
//! - Attached and detached snapshot management
//! - Dataset naming and ZFS user-property metadata persistence

pub mod error;
pub mod handle;
pub mod names;
pub mod params;
pub mod properties;
pub mod share;
pub mod snapshot;
pub mod volume;

pub use error::{ControllerError, ErrorKind, Result};
pub use handle::{SnapshotHandle, VolumeHandle};
pub use params::{ContentSource, CreateRequest, DeleteStrategy, Protocol, StorageClassParams, VolumeMode};
pub use properties::PropertyStore;
pub use snapshot::{SnapshotClassParams, SnapshotInfo, SnapshotManager};
pub use volume::{ExpandOutcome, ProvisionedVolume, VolumeManager};
