//! Messages exchanged between the control plane and agents.
//!
//! Two layers:
//! - `ConnectRequest` / `ConnectResponse` run directly on an agent connection
//!   and carry one proxied call, whose own frames travel as opaque `Message`
//!   payloads.
//! - `HttpRequest` / `HttpResponse` are those payloads for HTTP calls.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Status;
use crate::framing::{base64_bytes, DataCarrier};
use crate::rpc::Metadata;

/// String multimap used for query parameters and header fields.
pub type Values = HashMap<String, Vec<String>>;

/// Method name of the HTTP forwarding call.
pub const HTTP_METHOD: &str = "/backhaul.http.Http/MakeRequest";

/// Field numbers shared by [`HttpRequest`] and [`HttpResponse`].
pub mod http_field {
    pub const HEADER: u32 = 1;
    pub const BODY_CHUNK: u32 = 2;
    pub const TRAILER: u32 = 3;
    pub const UPGRADE_CHUNK: u32 = 4;
}

/// Opaque side-channel value attached to a request header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedValue {
    pub type_name: String,
    pub value: serde_json::Value,
}

/// Type name of the [`Impersonation`] extension value.
pub const IMPERSONATION_TYPE: &str = "backhaul.impersonation";

/// Identity the upstream call should be made as.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Impersonation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: Values,
}

impl Impersonation {
    pub fn to_typed_value(&self) -> Result<TypedValue, Status> {
        let value = serde_json::to_value(self)
            .map_err(|e| Status::internal(format!("failed to encode impersonation: {e}")))?;
        Ok(TypedValue {
            type_name: IMPERSONATION_TYPE.to_string(),
            value,
        })
    }

    pub fn from_typed_value(extra: &TypedValue) -> Result<Self, Status> {
        if extra.type_name != IMPERSONATION_TYPE {
            return Err(Status::new(
                crate::error::Code::InvalidArgument,
                format!("unsupported extension type {}", extra.type_name),
            ));
        }
        serde_json::from_value(extra.value.clone()).map_err(|e| {
            Status::new(
                crate::error::Code::InvalidArgument,
                format!("malformed impersonation extension: {e}"),
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub method: String,
    pub url_path: String,
    #[serde(default)]
    pub query: Values,
    #[serde(default)]
    pub header: Values,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<TypedValue>,
    /// `Some(0)` means no body chunks follow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<i64>,
}

impl RequestHeader {
    pub fn is_upgrade(&self) -> bool {
        is_upgrade(&self.header)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub status_code: u16,
    pub status: String,
    #[serde(default)]
    pub header: Values,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<i64>,
}

impl ResponseHeader {
    pub fn is_switching_protocols(&self) -> bool {
        self.status_code == http::StatusCode::SWITCHING_PROTOCOLS.as_u16()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyChunk {
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
}

impl DataCarrier for BodyChunk {
    fn into_data(self) -> Bytes {
        self.data
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trailer {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeChunk {
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
}

impl DataCarrier for UpgradeChunk {
    fn into_data(self) -> Bytes {
        self.data
    }
}

crate::oneof! {
    #[derive(Debug, Clone, PartialEq)]
    pub enum HttpRequest {
        first: [1],
        Header(RequestHeader) = 1 => [2, 3],
        BodyChunk(BodyChunk) = 2 => [2, 3] as data,
        Trailer(Trailer) = 3 => [4],
        UpgradeChunk(UpgradeChunk) = 4 => [4] as data,
    }
}

crate::oneof! {
    #[derive(Debug, Clone, PartialEq)]
    pub enum HttpResponse {
        first: [1],
        Header(ResponseHeader) = 1 => [2, 3],
        BodyChunk(BodyChunk) = 2 => [2, 3] as data,
        Trailer(Trailer) = 3 => [4],
        UpgradeChunk(UpgradeChunk) = 4 => [4] as data,
    }
}

/// Field numbers of [`ConnectRequest`].
pub mod request_field {
    pub const REQUEST_INFO: u32 = 1;
    pub const MESSAGE: u32 = 2;
    pub const CLOSE_SEND: u32 = 3;
}

/// Field numbers of [`ConnectResponse`].
pub mod response_field {
    pub const DESCRIPTOR: u32 = 1;
    pub const HEADER: u32 = 2;
    pub const MESSAGE: u32 = 3;
    pub const TRAILER: u32 = 4;
    pub const ERROR: u32 = 5;
}

/// Starts a proxied call on an idle tunnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub method_name: String,
    #[serde(default)]
    pub meta: Metadata,
}

/// One opaque frame of the proxied call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
}

impl DataCarrier for RawMessage {
    fn into_data(self) -> Bytes {
        self.data
    }
}

/// The control plane will send nothing more on this tunnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseSend {}

crate::oneof! {
    /// Control plane → agent.
    #[derive(Debug, Clone, PartialEq)]
    pub enum ConnectRequest {
        first: [1],
        RequestInfo(RequestInfo) = 1 => [2, 3],
        Message(RawMessage) = 2 => [2, 3] as data,
        CloseSend(CloseSend) = 3 => [],
    }
}

/// First message on every agent connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_id: String,
    pub token: String,
    /// Method names the agent can serve.
    #[serde(default)]
    pub services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallHeader {
    #[serde(default)]
    pub meta: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallTrailer {
    #[serde(default)]
    pub meta: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallError {
    pub status: Status,
}

crate::oneof! {
    /// Agent → control plane.
    #[derive(Debug, Clone, PartialEq)]
    pub enum ConnectResponse {
        first: [1],
        Descriptor(AgentDescriptor) = 1 => [2, 5],
        Header(CallHeader) = 2 => [3, 4, 5],
        Message(RawMessage) = 3 => [3, 4, 5] as data,
        Trailer(CallTrailer) = 4 => [5],
        Error(CallError) = 5 => [],
    }
}

/// Whether the header fields ask for a protocol upgrade: an `Upgrade` field and
/// a `Connection` field listing the `upgrade` token.
pub fn is_upgrade(header: &Values) -> bool {
    let mut has_upgrade = false;
    let mut connection_upgrade = false;
    for (name, values) in header {
        if name.eq_ignore_ascii_case("upgrade") {
            has_upgrade |= values.iter().any(|v| !v.trim().is_empty());
        } else if name.eq_ignore_ascii_case("connection") {
            connection_upgrade |= values
                .iter()
                .flat_map(|v| v.split(','))
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
        }
    }
    has_upgrade && connection_upgrade
}
