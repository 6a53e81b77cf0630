//! Store service wire protocol: framing, messages, the service and its client.

pub mod client;
pub mod frame;
pub mod message;
pub mod ready;
pub mod server;

pub use client::{RpcClient, RpcClientConfig};
pub use message::{Action, Request, Response};
pub use ready::ReadySignal;
pub use server::StoreService;
