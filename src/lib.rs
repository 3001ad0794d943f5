//! Reverse HTTP tunnel: agents inside private networks dial out to a control
//! plane, which proxies API requests back to their upstream services over
//! those connections.

pub mod agent;
pub mod config;
pub mod error;
pub mod framing;
pub mod grpc2http;
pub mod http;
pub mod http2grpc;
pub mod proto;
pub mod proxy;
pub mod rpc;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use error::{Code, Status};
