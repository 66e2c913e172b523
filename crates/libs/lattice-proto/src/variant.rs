//! JSON envelope encode/decode.
//!
//! One wire frame is one JSON object. The envelope keys `type`, `from`,
//! `dest`, `routing` and the `message_type` mirror are owned by this module;
//! everything else in the object belongs to the typed body.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{NodeId, NODE_NONE};

/// Envelope keys a body is not allowed to shadow.
const RESERVED_KEYS: [&str; 5] = ["type", "message_type", "from", "dest", "routing"];

/// Errors from envelope encode/decode.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame is not a JSON object")]
    NotObject,

    #[error("missing envelope field `{0}`")]
    MissingField(&'static str),

    #[error("envelope field `{0}` has the wrong type or is out of range")]
    BadField(&'static str),

    #[error("unknown routing discriminant: {0}")]
    BadRouting(u64),

    #[error("body field `{0}` shadows an envelope key")]
    ReservedField(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How a packet travels through the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Routing {
    /// Routed hop-by-hop toward a single destination node.
    Single = 0,
    /// Delivered to the adjacent peer only, never forwarded.
    Neighbour = 1,
    /// Flooded to every node.
    Broadcast = 2,
}

impl Routing {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Single),
            1 => Some(Self::Neighbour),
            2 => Some(Self::Broadcast),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A decoded wire packet: envelope plus the raw body object.
///
/// The body stays as a JSON map so a packet can be re-encoded for
/// forwarding without knowing its type, and decoded into a typed struct
/// only where it is consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub package_type: u16,
    pub from: NodeId,
    pub dest: NodeId,
    pub routing: Routing,
    body: Map<String, Value>,
}

impl Variant {
    /// Build a packet with an empty body.
    pub fn empty(package_type: u16, from: NodeId, dest: NodeId, routing: Routing) -> Self {
        Self { package_type, from, dest, routing, body: Map::new() }
    }

    /// Build a packet from a serializable body struct.
    ///
    /// The body must serialize to a JSON object and must not use any
    /// envelope key.
    pub fn from_body<T: Serialize>(
        package_type: u16,
        from: NodeId,
        dest: NodeId,
        routing: Routing,
        body: &T,
    ) -> Result<Self, WireError> {
        let value = serde_json::to_value(body)?;
        let body = match value {
            Value::Object(map) => map,
            _ => return Err(WireError::NotObject),
        };
        for key in RESERVED_KEYS {
            if body.contains_key(key) {
                return Err(WireError::ReservedField(key.to_string()));
            }
        }
        Ok(Self { package_type, from, dest, routing, body })
    }

    /// Decode the body into a typed struct.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        Ok(serde_json::from_value(Value::Object(self.body.clone()))?)
    }

    /// Raw body fields, for catch-all handlers.
    pub fn body_raw(&self) -> &Map<String, Value> {
        &self.body
    }

    /// Encode to one JSON document.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = self.body.clone();
        out.insert("type".into(), Value::from(self.package_type));
        out.insert("message_type".into(), Value::from(self.package_type));
        out.insert("from".into(), Value::from(self.from));
        if self.dest != NODE_NONE {
            out.insert("dest".into(), Value::from(self.dest));
        }
        out.insert("routing".into(), Value::from(self.routing.as_u8()));
        Ok(serde_json::to_vec(&Value::Object(out))?)
    }

    /// Decode one JSON document.
    ///
    /// `type` wins over the `message_type` mirror when both are present;
    /// the mirror alone is accepted for older peers. Non-UTF-8 input fails
    /// inside the JSON parse.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let mut map = match value {
            Value::Object(map) => map,
            _ => return Err(WireError::NotObject),
        };

        let package_type = match take_uint(&mut map, "type") {
            Some(v) => v,
            None => take_uint(&mut map, "message_type").ok_or(WireError::MissingField("type"))?,
        };
        let package_type =
            u16::try_from(package_type).map_err(|_| WireError::BadField("type"))?;
        map.remove("message_type");

        let from = take_uint(&mut map, "from").ok_or(WireError::MissingField("from"))?;
        let from = u32::try_from(from).map_err(|_| WireError::BadField("from"))?;

        let dest = match take_uint(&mut map, "dest") {
            Some(v) => u32::try_from(v).map_err(|_| WireError::BadField("dest"))?,
            None => NODE_NONE,
        };

        let routing = take_uint(&mut map, "routing").ok_or(WireError::MissingField("routing"))?;
        let routing = u8::try_from(routing)
            .ok()
            .and_then(Routing::from_u8)
            .ok_or(WireError::BadRouting(routing))?;

        Ok(Self { package_type, from, dest, routing, body: map })
    }
}

fn take_uint(map: &mut Map<String, Value>, key: &str) -> Option<u64> {
    map.remove(key).and_then(|v| v.as_u64())
}
