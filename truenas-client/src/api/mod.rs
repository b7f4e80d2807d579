//! Typed wrappers over the appliance RPC methods.
//!
//! Each submodule adds inherent methods to [`crate::Client`] for one
//! appliance resource area. Parameters are always positional arrays;
//! list filtering uses the appliance's generic query convention of
//! `[field, op, value]` triples.

pub mod dataset;
pub mod iscsi;
pub mod job;
pub mod nfs;
pub mod nvmet;
pub mod pool;
pub mod replication;
pub mod snapshot;

pub use dataset::{
    Dataset, DatasetCreateParams, DatasetKind, DatasetUpdateParams, EncryptionOptions,
    UserPropertyUpdate,
};
pub use iscsi::{IscsiExtent, IscsiTarget, IscsiTargetExtent};
pub use job::{Job, JobState, DEFAULT_JOB_POLL_INTERVAL};
pub use nfs::{NfsShare, NfsShareCreateParams};
pub use nvmet::{NvmetNamespace, NvmetPort, NvmetPortSubsys, NvmetSubsystem};
pub use pool::Pool;
pub use replication::ReplicationRunOnetimeParams;
pub use snapshot::ZfsSnapshot;

use serde_json::{Value, json};

/// Build one `[field, op, value]` query filter triple.
pub fn filter(field: &str, op: &str, value: impl Into<Value>) -> Value {
    json!([field, op, value.into()])
}
