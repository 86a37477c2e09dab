use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::track_uuid::TrackUuid;

pub mod obj_flags {
    pub const TOUCHED: u16 = 1 << 0;
    pub const PRIVATE: u16 = 1 << 1;
    pub const PORTAL: u16 = 1 << 2;
    pub const GREEN: u16 = 1 << 3;
    pub const LATENT: u16 = 1 << 4;
    pub const IMMOBILE: u16 = 1 << 5;
    /// Internal only, never serialised: masked out of every emitted frame.
    pub const OCCLUDED: u16 = 1 << 7;
}

impl Serialize for TrackUuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TrackUuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let uuid = Uuid::parse_str(&s).map_err(D::Error::custom)?;
        Ok(TrackUuid::from_bytes(*uuid.as_bytes()))
    }
}

/// One tracked object as published to observers and codecs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FrameObject {
    pub id: u32,
    pub uuid: TrackUuid,
    pub timestamp: u64,
    pub x: f32,
    pub y: f32,
    pub size: f32,
    pub flags: u16,
}

impl FrameObject {
    pub fn is_latent(&self) -> bool {
        self.flags & obj_flags::LATENT != 0
    }

    pub fn is_private(&self) -> bool {
        self.flags & obj_flags::PRIVATE != 0
    }

    pub fn is_touched(&self) -> bool {
        self.flags & obj_flags::TOUCHED != 0
    }
}

/// The fused, activated object set of one tracker frame, keyed by numeric
/// id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrackedFrame {
    pub timestamp: u64,
    pub frame_id: u64,
    pub uuid: TrackUuid,
    pub objects: BTreeMap<u32, FrameObject>,
}

impl TrackedFrame {
    pub fn get(&self, id: u32) -> Option<&FrameObject> {
        self.objects.get(&id)
    }

    /// MsgPack wire encoding for binary transports.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<TrackedFrame, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }

    pub fn insert(&mut self, object: FrameObject) {
        self.objects.entry(object.id).or_insert(object);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> TrackedFrame {
        let uuid = TrackUuid::new(1_000, 0);
        let mut frame = TrackedFrame {
            timestamp: 2_000,
            frame_id: 3,
            uuid,
            objects: BTreeMap::new(),
        };
        frame.insert(FrameObject {
            id: 1,
            uuid: TrackUuid::with_tid(&uuid, 1),
            timestamp: 2_000,
            x: 0.5,
            y: -1.25,
            size: 0.4,
            flags: obj_flags::TOUCHED,
        });
        frame.insert(FrameObject {
            id: 2,
            uuid: TrackUuid::with_tid(&uuid, 2),
            timestamp: 2_000,
            x: -3.0,
            y: 2.0,
            size: 0.6,
            flags: obj_flags::TOUCHED | obj_flags::PRIVATE,
        });
        frame
    }

    #[test]
    fn json_round_trip_is_identity() {
        let frame = sample_frame();
        let json = serde_json::to_string(&frame).unwrap();
        let back: TrackedFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(frame, back);
    }

    #[test]
    fn uuid_serialises_as_string() {
        let json = serde_json::to_value(TrackUuid::new(0, 7)).unwrap();
        assert!(json.is_string());
    }

    #[test]
    fn msgpack_round_trip_is_identity() {
        let frame = sample_frame();
        let bytes = frame.to_msgpack().unwrap();
        let back = TrackedFrame::from_msgpack(&bytes).unwrap();
        assert_eq!(frame, back);
    }
}
