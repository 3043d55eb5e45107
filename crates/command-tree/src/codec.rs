use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::command::CommandNode;

/// Every frame on the wire starts with this two-byte marker.
pub const FRAME_MAGIC: [u8; 2] = [0x00, 0xFF];

/// Upper bound for a single frame. Large module states fit comfortably; a
/// length beyond this means the stream is corrupt.
pub const MAX_FRAME_LENGTH: u64 = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bad frame magic {found:02x?}")]
    BadMagic { found: [u8; 2] },
    #[error("frame length {length} exceeds the frame limit")]
    Oversize { length: u64 },
    #[error("stream ended inside a frame")]
    Truncated,
    #[error("{detail} is not registered for wire transfer")]
    Unregistered { detail: String },
    #[error("unknown wire type {name:?}")]
    UnknownName { name: String },
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ---- frame layer ----

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), CodecError> {
    let length = payload.len() as u64;
    if length > MAX_FRAME_LENGTH {
        return Err(CodecError::Oversize { length });
    }
    writer.write_all(&FRAME_MAGIC).await?;
    writer.write_all(&length.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the stream ended cleanly on a frame
/// boundary; ending anywhere inside a frame is `Truncated`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, CodecError> {
    let mut magic = [0u8; 2];
    if reader.read(&mut magic[..1]).await? == 0 {
        return Ok(None);
    }
    reader
        .read_exact(&mut magic[1..])
        .await
        .map_err(eof_is_truncation)?;
    if magic != FRAME_MAGIC {
        return Err(CodecError::BadMagic { found: magic });
    }
    let mut length_bytes = [0u8; 8];
    reader
        .read_exact(&mut length_bytes)
        .await
        .map_err(eof_is_truncation)?;
    let length = u64::from_le_bytes(length_bytes);
    if length > MAX_FRAME_LENGTH {
        return Err(CodecError::Oversize { length });
    }
    let mut payload = vec![0u8; length as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(eof_is_truncation)?;
    Ok(Some(payload))
}

fn eof_is_truncation(err: std::io::Error) -> CodecError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        CodecError::Truncated
    } else {
        CodecError::Io(err)
    }
}

// ---- type registry ----

type NodeEncodeFn = fn(&dyn CommandNode) -> Result<serde_json::Value, CodecError>;
type NodeDecodeFn = fn(serde_json::Value) -> Result<Arc<dyn CommandNode>, CodecError>;
type ValueEncodeFn = fn(&(dyn Any + Send + Sync)) -> Result<serde_json::Value, CodecError>;
type ValueDecodeFn = fn(serde_json::Value) -> Result<DynValue, CodecError>;

#[derive(Default)]
struct Registry {
    node_names: HashMap<TypeId, &'static str>,
    node_encoders: HashMap<TypeId, NodeEncodeFn>,
    node_decoders: HashMap<&'static str, NodeDecodeFn>,
    value_names: HashMap<TypeId, &'static str>,
    value_encoders: HashMap<TypeId, ValueEncodeFn>,
    value_decoders: HashMap<&'static str, ValueDecodeFn>,
}

static REGISTRY: LazyLock<RwLock<Registry>> = LazyLock::new(|| RwLock::new(Registry::default()));

fn registry() -> RwLockReadGuard<'static, Registry> {
    REGISTRY.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn registry_mut() -> RwLockWriteGuard<'static, Registry> {
    REGISTRY.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registers a command node type under a stable wire name. Registration is
/// idempotent and must happen at process start, before any stream is opened;
/// encoding an unregistered type is fatal to the session.
pub fn register_node<T>(name: &'static str)
where
    T: CommandNode + Serialize + DeserializeOwned,
{
    let mut reg = registry_mut();
    reg.node_names.insert(TypeId::of::<T>(), name);
    reg.node_encoders.insert(TypeId::of::<T>(), encode_node_typed::<T>);
    reg.node_decoders.insert(name, decode_node_typed::<T>);
}

/// Registers a plain value type (module states, queries, results).
pub fn register_value<T>(name: &'static str)
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let mut reg = registry_mut();
    reg.value_names.insert(TypeId::of::<T>(), name);
    reg.value_encoders.insert(TypeId::of::<T>(), encode_value_typed::<T>);
    reg.value_decoders.insert(name, decode_value_typed::<T>);
}

fn encode_node_typed<T: CommandNode + Serialize>(
    node: &dyn CommandNode,
) -> Result<serde_json::Value, CodecError> {
    let concrete = node.as_any().downcast_ref::<T>().ok_or_else(|| {
        CodecError::Unregistered {
            detail: format!("command node {:?}", node.as_command().caption()),
        }
    })?;
    Ok(serde_json::to_value(concrete)?)
}

fn decode_node_typed<T: CommandNode + DeserializeOwned>(
    value: serde_json::Value,
) -> Result<Arc<dyn CommandNode>, CodecError> {
    let node: T = serde_json::from_value(value)?;
    Ok(Arc::new(node))
}

fn encode_value_typed<T: Serialize + Any>(
    value: &(dyn Any + Send + Sync),
) -> Result<serde_json::Value, CodecError> {
    let concrete = value.downcast_ref::<T>().ok_or_else(|| CodecError::Unregistered {
        detail: "value".to_string(),
    })?;
    Ok(serde_json::to_value(concrete)?)
}

fn decode_value_typed<T: DeserializeOwned + Send + Sync + 'static>(
    value: serde_json::Value,
) -> Result<DynValue, CodecError> {
    let concrete: T = serde_json::from_value(value)?;
    Ok(DynValue::new(concrete))
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    type_name: String,
    body: serde_json::Value,
}

/// Serializes a node (with its subtree) into a self-describing value.
pub fn encode_node(node: &dyn CommandNode) -> Result<serde_json::Value, CodecError> {
    let (name, encode) = {
        let reg = registry();
        let type_id = node.as_any().type_id();
        match (reg.node_names.get(&type_id), reg.node_encoders.get(&type_id)) {
            (Some(name), Some(encode)) => (*name, *encode),
            _ => {
                return Err(CodecError::Unregistered {
                    detail: format!("command node {:?}", node.as_command().caption()),
                })
            }
        }
    };
    let body = encode(node)?;
    Ok(serde_json::to_value(Envelope {
        type_name: name.to_string(),
        body,
    })?)
}

pub fn decode_node(value: serde_json::Value) -> Result<Arc<dyn CommandNode>, CodecError> {
    let envelope: Envelope = serde_json::from_value(value)?;
    let decode = {
        let reg = registry();
        reg.node_decoders
            .get(envelope.type_name.as_str())
            .copied()
            .ok_or(CodecError::UnknownName {
                name: envelope.type_name.clone(),
            })?
    };
    decode(envelope.body)
}

pub fn encode_value(value: &DynValue) -> Result<serde_json::Value, CodecError> {
    let (name, encode) = {
        let reg = registry();
        let type_id = (*value.0).type_id();
        match (reg.value_names.get(&type_id), reg.value_encoders.get(&type_id)) {
            (Some(name), Some(encode)) => (*name, *encode),
            _ => {
                return Err(CodecError::Unregistered {
                    detail: "result value".to_string(),
                })
            }
        }
    };
    let body = encode(value.0.as_ref())?;
    Ok(serde_json::to_value(Envelope {
        type_name: name.to_string(),
        body,
    })?)
}

pub fn decode_value(value: serde_json::Value) -> Result<DynValue, CodecError> {
    let envelope: Envelope = serde_json::from_value(value)?;
    let decode = {
        let reg = registry();
        reg.value_decoders
            .get(envelope.type_name.as_str())
            .copied()
            .ok_or(CodecError::UnknownName {
                name: envelope.type_name.clone(),
            })?
    };
    decode(envelope.body)
}

/// A typed value travelling through results and module states. Encoding goes
/// through the wire registry, so only registered types survive a stream.
#[derive(Clone)]
pub struct DynValue(pub(crate) Arc<dyn Any + Send + Sync>);

impl DynValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for DynValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reg = registry();
        match reg.value_names.get(&(*self.0).type_id()) {
            Some(name) => write!(f, "DynValue({name})"),
            None => write!(f, "DynValue(?)"),
        }
    }
}

impl Serialize for DynValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = encode_value(self).map_err(serde::ser::Error::custom)?;
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DynValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        decode_value(value).map_err(serde::de::Error::custom)
    }
}
