pub mod codec;
pub mod session;

pub use codec::{Request, Response, RpcError};
pub use session::{Client, DEFAULT_PING_INTERVAL};
