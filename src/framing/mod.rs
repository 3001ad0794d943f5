//! Tagged-union stream messages.
//!
//! Every message exchanged over a tunnel is an enum with exactly one active
//! variant. Each variant has a stable field number and a list of field numbers
//! allowed to follow it; [`visitor::StreamVisitor`] uses that graph to decide
//! which callbacks a consumer has to provide.
//!
//! On the wire a message is one byte of field number followed by the JSON
//! encoding of the variant's payload.

pub mod visitor;

pub use bytes::Bytes;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Status;

/// One alternative of a tagged union.
#[derive(Debug)]
pub struct FieldDescriptor {
    pub number: u32,
    pub name: &'static str,
    /// Field numbers that may follow this one on the same stream.
    pub next: &'static [u32],
    /// The payload exposes its bytes through [`DataCarrier`].
    pub carries_data: bool,
}

/// A group of mutually exclusive alternatives.
#[derive(Debug)]
pub struct OneofDescriptor {
    pub name: &'static str,
    /// Field numbers legal as the first message of a stream.
    pub first: &'static [u32],
    pub fields: &'static [FieldDescriptor],
}

#[derive(Debug)]
pub struct MessageDescriptor {
    pub name: &'static str,
    pub oneofs: &'static [OneofDescriptor],
}

impl MessageDescriptor {
    pub fn field(&self, number: u32) -> Option<&'static FieldDescriptor> {
        self.oneofs
            .iter()
            .flat_map(|oneof| oneof.fields.iter())
            .find(|field| field.number == number)
    }
}

/// A stream message: a tagged union with a static shape.
pub trait Oneof: Sized + Send + 'static {
    fn descriptor() -> &'static MessageDescriptor;

    /// Field number of the active alternative.
    fn field_number(&self) -> u32;

    /// Hands out the payload bytes if the active alternative carries data,
    /// otherwise gives the message back.
    fn into_data(self) -> Result<Bytes, Self>;

    fn encode(&self) -> Result<Bytes, Status>;

    fn decode(frame: &[u8]) -> Result<Self, Status>;
}

/// Payload type of one alternative of `M`.
pub trait Variant<M: Oneof>: Sized {
    const FIELD: u32;

    fn from_message(msg: M) -> Result<Self, M>;
}

/// Payloads that are just a chunk of bytes.
pub trait DataCarrier {
    fn into_data(self) -> Bytes;
}

#[doc(hidden)]
pub fn encode_payload<P: Serialize>(field: u32, payload: &P) -> Result<Bytes, Status> {
    let tag = u8::try_from(field)
        .map_err(|_| Status::internal(format!("field number {field} does not fit the frame tag")))?;
    let mut buf = vec![tag];
    serde_json::to_writer(&mut buf, payload)
        .map_err(|e| Status::internal(format!("failed to encode field {field}: {e}")))?;
    Ok(Bytes::from(buf))
}

#[doc(hidden)]
pub fn split_frame(frame: &[u8]) -> Result<(u32, &[u8]), Status> {
    match frame.split_first() {
        Some((tag, payload)) => Ok((u32::from(*tag), payload)),
        None => Err(Status::internal("empty frame")),
    }
}

#[doc(hidden)]
pub fn decode_payload<P: DeserializeOwned>(
    message: &str,
    field: u32,
    payload: &[u8],
) -> Result<P, Status> {
    serde_json::from_slice(payload)
        .map_err(|e| Status::internal(format!("malformed {message} field {field}: {e}")))
}

/// Serializes `Bytes` as a base64 string.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Declares a tagged-union stream message.
///
/// ```ignore
/// oneof! {
///     pub enum Upload {
///         first: [1],
///         Begin(Begin) = 1 => [2, 3],
///         Chunk(Chunk) = 2 => [2, 3] as data,
///         End(End) = 3 => [],
///     }
/// }
/// ```
///
/// `as data` marks payloads implementing [`DataCarrier`]. Each payload type may
/// appear only once per enum.
#[macro_export]
macro_rules! oneof {
    (@flag data) => { true };
    (@flag) => { false };
    (@data $payload:ident, $name:ident, $variant:ident, data) => {
        Ok($crate::framing::DataCarrier::into_data($payload))
    };
    (@data $payload:ident, $name:ident, $variant:ident) => {
        Err($name::$variant($payload))
    };
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            first: [$($first:literal),* $(,)?],
            $(
                $(#[$vmeta:meta])*
                $variant:ident($payload:ty) = $num:literal => [$($next:literal),* $(,)?] $(as $data:ident)?,
            )+
        }
    ) => {
        $(#[$meta])*
        $vis enum $name {
            $(
                $(#[$vmeta])*
                $variant($payload),
            )+
        }

        impl $crate::framing::Oneof for $name {
            fn descriptor() -> &'static $crate::framing::MessageDescriptor {
                static DESCRIPTOR: $crate::framing::MessageDescriptor =
                    $crate::framing::MessageDescriptor {
                        name: stringify!($name),
                        oneofs: &[$crate::framing::OneofDescriptor {
                            name: "msg",
                            first: &[$($first),*],
                            fields: &[$(
                                $crate::framing::FieldDescriptor {
                                    number: $num,
                                    name: stringify!($variant),
                                    next: &[$($next),*],
                                    carries_data: $crate::oneof!(@flag $($data)?),
                                },
                            )+],
                        }],
                    };
                &DESCRIPTOR
            }

            fn field_number(&self) -> u32 {
                match self {
                    $( $name::$variant(_) => $num, )+
                }
            }

            fn into_data(self) -> ::std::result::Result<$crate::framing::Bytes, Self> {
                match self {
                    $( $name::$variant(payload) => $crate::oneof!(@data payload, $name, $variant $(, $data)?), )+
                }
            }

            fn encode(&self) -> ::std::result::Result<$crate::framing::Bytes, $crate::error::Status> {
                match self {
                    $( $name::$variant(payload) => $crate::framing::encode_payload($num, payload), )+
                }
            }

            fn decode(frame: &[u8]) -> ::std::result::Result<Self, $crate::error::Status> {
                let (field, payload) = $crate::framing::split_frame(frame)?;
                match field {
                    $(
                        $num => $crate::framing::decode_payload::<$payload>(stringify!($name), field, payload)
                            .map($name::$variant),
                    )+
                    other => Err($crate::error::Status::internal(format!(
                        "{} does not have a field {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        $(
            impl $crate::framing::Variant<$name> for $payload {
                const FIELD: u32 = $num;

                fn from_message(msg: $name) -> ::std::result::Result<Self, $name> {
                    match msg {
                        $name::$variant(payload) => Ok(payload),
                        #[allow(unreachable_patterns)]
                        other => Err(other),
                    }
                }
            }
        )+
    };
}
