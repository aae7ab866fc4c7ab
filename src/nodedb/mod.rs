//! # Node Directory
//!
//! Per-device cache of every mesh peer a device has heard from.
//!
//! - [`NodeDirectoryRegistry`] owns all directories, bounds their number
//!   (oldest insertion is evicted first), persists them, and merges a new
//!   session's directory with an older one once both are known to belong to
//!   the same physical device.
//! - [`NodeDirectory`] is a lightweight handle onto one directory, addressed by
//!   its session-scoped identity key. Every call re-checks that the registry
//!   still holds the directory and fails with [`NodeDbError::DirectoryNotFound`]
//!   otherwise.
//!
//! ```rust
//! use meshdir::nodedb::{NodeDirectoryRegistry, NodeInfo, RegistryConfig};
//!
//! let registry = NodeDirectoryRegistry::new(RegistryConfig::default());
//! let dir = registry.add_directory(42);
//! dir.add_node(NodeInfo::new(0x1234)).unwrap();
//! dir.set_node_num(0x1234).unwrap();
//! assert_eq!(dir.get_nodes_length().unwrap(), 1);
//! assert!(dir.get_nodes().unwrap().is_empty()); // self is not listed
//! ```

mod directory;
mod registry;

pub use directory::NodeDirectory;
pub use registry::{NodeDirectoryRegistry, RegistryConfig, DEFAULT_CAPACITY, DEFAULT_PERSIST_KEY};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{CodecError, Persist, Value};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeDbError {
    /// The registry no longer holds this directory (evicted, removed or merged away).
    #[error("node directory {0} not found")]
    DirectoryNotFound(u32),
}

/// Fresh random session-scoped identity key. Never zero.
pub fn new_identity_key() -> u32 {
    loop {
        let key: u32 = rand::random();
        if key != 0 {
            return key;
        }
    }
}

/// Device role as reported in the user profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    #[default]
    Client,
    ClientMute,
    ClientHidden,
    Router,
    RouterClient,
    Repeater,
    Tracker,
    Sensor,
    Tak,
    TakTracker,
    LostAndFound,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct User {
    pub id: String,
    pub long_name: String,
    pub short_name: String,
    /// Hardware model number as defined by the firmware.
    pub hw_model: u32,
    pub role: Role,
    pub is_licensed: bool,
    /// Persisted separately as a byte-buffer envelope.
    #[serde(skip)]
    pub public_key: Bytes,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Position {
    /// Degrees * 1e7.
    pub latitude_i: Option<i32>,
    pub longitude_i: Option<i32>,
    pub altitude: Option<i32>,
    pub time: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceMetrics {
    pub battery_level: Option<u32>,
    #[serde(with = "lossless_f32::option")]
    pub voltage: Option<f32>,
    #[serde(with = "lossless_f32::option")]
    pub channel_utilization: Option<f32>,
    #[serde(with = "lossless_f32::option")]
    pub air_util_tx: Option<f32>,
    pub uptime_seconds: Option<u32>,
}

/// One mesh peer, keyed by `num`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeInfo {
    pub num: u32,
    pub user: Option<User>,
    pub position: Option<Position>,
    #[serde(with = "lossless_f32")]
    pub snr: f32,
    /// Unix seconds; 0 when never heard directly.
    pub last_heard: u32,
    pub device_metrics: Option<DeviceMetrics>,
    pub channel: u32,
    pub via_mqtt: bool,
    pub hops_away: Option<u32>,
    pub is_favorite: bool,
    pub is_ignored: bool,
}

impl NodeInfo {
    pub fn new(num: u32) -> Self {
        Self {
            num,
            ..Default::default()
        }
    }

    pub fn long_name(&self) -> Option<&str> {
        self.user
            .as_ref()
            .map(|u| u.long_name.trim())
            .filter(|n| !n.is_empty())
    }
}

/// JSON has no NaN or infinity, so non-finite floats are written as their
/// string form ("NaN", "inf", "-inf"). A bare `null` from older payloads reads
/// back as NaN.
mod lossless_f32 {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f32),
        Text(String),
    }

    fn from_repr<E: serde::de::Error>(repr: Option<Repr>) -> Result<f32, E> {
        match repr {
            Some(Repr::Number(v)) => Ok(v),
            Some(Repr::Text(text)) => text
                .parse()
                .map_err(|_| E::custom(format!("invalid float {:?}", text))),
            None => Ok(f32::NAN),
        }
    }

    pub fn serialize<S: Serializer>(value: &f32, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f32(*value)
        } else {
            serializer.serialize_str(&value.to_string())
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
        from_repr(Option::<Repr>::deserialize(deserializer)?)
    }

    pub mod option {
        use super::Repr;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<f32>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => super::serialize(v, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<f32>, D::Error> {
            match Option::<Repr>::deserialize(deserializer)? {
                Some(repr) => super::from_repr(Some(repr)).map(Some),
                None => Ok(None),
            }
        }
    }
}

const PUBLIC_KEY_FIELD: &str = "publicKey";

impl Persist for NodeInfo {
    fn to_value(&self) -> Result<Value, CodecError> {
        let mut value = Value::from_json(serde_json::to_value(self)?);
        if let Some(user) = &self.user {
            if let Some(Value::Object(fields)) = match &mut value {
                Value::Object(fields) => fields.get_mut("user"),
                _ => None,
            } {
                fields.insert(
                    PUBLIC_KEY_FIELD.to_string(),
                    Value::Bytes(user.public_key.clone()),
                );
            }
        }
        Ok(value)
    }

    fn from_value(mut value: Value) -> Result<Self, CodecError> {
        let public_key = match &mut value {
            Value::Object(fields) => match fields.get_mut("user") {
                Some(user) => match user.take(PUBLIC_KEY_FIELD) {
                    Some(Value::Bytes(b)) => b,
                    Some(Value::Null) | None => Bytes::new(),
                    Some(other) => {
                        return Err(CodecError::Shape(format!(
                            "publicKey is not a byte buffer: {:?}",
                            other
                        )))
                    }
                },
                None => Bytes::new(),
            },
            _ => return Err(CodecError::Shape("node is not an object".into())),
        };
        let mut node: NodeInfo = serde_json::from_value(value.into_plain_json()?)?;
        if let Some(user) = node.user.as_mut() {
            user.public_key = public_key;
        }
        Ok(node)
    }
}

/// Outstanding fault reported for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    pub node: u32,
    pub error: String,
}

impl Persist for NodeError {
    fn to_value(&self) -> Result<Value, CodecError> {
        Ok(Value::from_json(serde_json::to_value(self)?))
    }

    fn from_value(value: Value) -> Result<Self, CodecError> {
        Ok(serde_json::from_value(value.into_plain_json()?)?)
    }
}

/// Reception metadata of any decoded mesh packet.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PacketMeta {
    pub from: u32,
    /// Unix seconds; 0 when the radio did not stamp the packet.
    pub rx_time: u32,
    pub rx_snr: f32,
    pub hop_start: Option<u32>,
    pub hop_limit: Option<u32>,
    pub channel: u32,
    pub via_mqtt: bool,
}

impl PacketMeta {
    pub fn hops_away(&self) -> Option<u32> {
        match (self.hop_start, self.hop_limit) {
            (Some(start), Some(limit)) if start >= limit => Some(start - limit),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;

    fn sample_node() -> NodeInfo {
        NodeInfo {
            num: 0xa1b2c3d4,
            user: Some(User {
                id: "!a1b2c3d4".into(),
                long_name: "Ridge Relay".into(),
                short_name: "RR".into(),
                hw_model: 43,
                role: Role::Router,
                is_licensed: false,
                public_key: Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]),
            }),
            position: Some(Position {
                latitude_i: Some(377_749_000),
                longitude_i: Some(-1_224_194_000),
                altitude: Some(52),
                time: 1_700_000_000,
            }),
            snr: 6.25,
            last_heard: 1_700_000_100,
            device_metrics: Some(DeviceMetrics {
                battery_level: Some(87),
                voltage: Some(4.1),
                channel_utilization: Some(12.5),
                air_util_tx: Some(1.5),
                uptime_seconds: Some(3600),
            }),
            channel: 0,
            via_mqtt: false,
            hops_away: Some(2),
            is_favorite: true,
            is_ignored: false,
        }
    }

    #[test]
    fn node_survives_codec_with_public_key() {
        let codec = Codec::new();
        let node = sample_node();
        let text = codec.encode(&node.to_value().unwrap()).unwrap();
        assert!(text.contains(r#""publicKey":{"__datatype":"Uint8Array","value":[222,173,190,239]}"#));
        let back = NodeInfo::from_value(codec.decode(&text).unwrap()).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn node_without_user_round_trips() {
        let codec = Codec::new();
        let node = NodeInfo::new(7);
        let back =
            NodeInfo::from_value(codec.decode(&codec.encode(&node.to_value().unwrap()).unwrap()).unwrap())
                .unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn non_finite_floats_survive_codec() {
        let codec = Codec::new();
        let mut node = sample_node();
        node.snr = f32::NAN;
        node.device_metrics = Some(DeviceMetrics {
            voltage: Some(f32::INFINITY),
            channel_utilization: Some(f32::NEG_INFINITY),
            air_util_tx: None,
            ..Default::default()
        });
        let text = codec.encode(&node.to_value().unwrap()).unwrap();
        assert!(text.contains(r#""snr":"NaN""#));
        let back = NodeInfo::from_value(codec.decode(&text).unwrap()).unwrap();
        assert!(back.snr.is_nan());
        let metrics = back.device_metrics.unwrap();
        assert_eq!(metrics.voltage, Some(f32::INFINITY));
        assert_eq!(metrics.channel_utilization, Some(f32::NEG_INFINITY));
        assert_eq!(metrics.air_util_tx, None);
        assert_eq!(back.user, node.user);
    }

    #[test]
    fn null_snr_from_older_payloads_reads_as_nan() {
        let value = Value::from_json(serde_json::json!({ "num": 3, "snr": null }));
        let node = NodeInfo::from_value(value).unwrap();
        assert_eq!(node.num, 3);
        assert!(node.snr.is_nan());
    }

    #[test]
    fn hops_away_needs_both_counters() {
        let mut meta = PacketMeta {
            hop_start: Some(3),
            hop_limit: Some(1),
            ..Default::default()
        };
        assert_eq!(meta.hops_away(), Some(2));
        meta.hop_limit = None;
        assert_eq!(meta.hops_away(), None);
    }

    #[test]
    fn identity_keys_are_non_zero() {
        for _ in 0..64 {
            assert_ne!(new_identity_key(), 0);
        }
    }
}
