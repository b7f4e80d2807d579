//! Pool queries: `pool.query`.

use serde::Deserialize;
use serde_json::json;

use super::filter;
use crate::error::Result;
use crate::rpc::Client;

/// A ZFS pool as reported by the appliance. Read-only from the driver's
/// perspective; consulted for storage-class validation and capacity.
#[derive(Debug, Clone, Deserialize)]
pub struct Pool {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub free: u64,
    #[serde(default)]
    pub allocated: u64,
}

impl Client {
    /// Fetch one pool by name; `None` when the appliance has no such pool.
    pub async fn pool_get(&self, name: &str) -> Result<Option<Pool>> {
        let mut found: Vec<Pool> = self
            .call("pool.query", vec![json!(vec![filter("name", "=", name)])])
            .await
            .map_err(|e| e.for_method("pool.query"))?;
        Ok(found.drain(..).next())
    }
}
