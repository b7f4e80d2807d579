//! TrueNAS Appliance Client Library
//!
//! Persistent JSON-RPC 2.0 client for the appliance middleware WebSocket,
//! plus typed wrappers for the resources the CSI provisioner manages.
//!
//! The library is split into two modules:
//! - `rpc`: wire codec and the reconnecting WebSocket session
//! - `api`: typed wrappers over the appliance RPC methods (datasets, shares,
//!   NVMe-oF subsystems, iSCSI targets, snapshots, replication, jobs)

pub mod api;
pub mod error;
pub mod rpc;

pub use error::{ClientError, Result};
pub use rpc::{Client, RpcError};
