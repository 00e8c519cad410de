//! OVN northbound database access over OVSDB JSON-RPC (RFC 7047)
//!
//! - `RpcClient`: request/reply multiplexing over a single stream, with the
//!   server's echo keepalives answered in the background
//! - `value`: encoding of OVSDB atoms, sets and maps
//! - `OvsdbNbClient`: the `NbClient` implementation on top of `transact`

pub mod error;
pub mod rpc;
pub mod value;
pub mod client;

pub use error::{OvsdbError, Result};
pub use rpc::RpcClient;
pub use client::{OvsdbNbClient, NB_DATABASE};
