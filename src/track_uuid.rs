use std::fmt;

use uuid::Uuid;

/// Application tag occupying the first six bytes of every tracker UUID.
pub const APP_ID: [u8; 6] = *b"TRACK\0";

/// Tracker UUID: 6 bytes application tag, 6 bytes creation timestamp
/// (milliseconds, little-endian, truncated), 4 bytes big-endian numeric id.
/// Equality is plain byte equality.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct TrackUuid([u8; 16]);

impl TrackUuid {
    pub fn nil() -> Self {
        TrackUuid([0u8; 16])
    }

    pub fn new(timestamp: u64, tid: u32) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..6].copy_from_slice(&APP_ID);
        bytes[6..12].copy_from_slice(&timestamp.to_le_bytes()[..6]);
        bytes[12..16].copy_from_slice(&tid.to_be_bytes());
        TrackUuid(bytes)
    }

    /// Same timestamp part as `other`, different numeric id. Used for latent
    /// ids riding on a host object.
    pub fn with_tid(other: &TrackUuid, tid: u32) -> Self {
        let mut bytes = other.0;
        bytes[12..16].copy_from_slice(&tid.to_be_bytes());
        TrackUuid(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        TrackUuid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; 16]
    }

    pub fn tid(&self) -> u32 {
        u32::from_be_bytes([self.0[12], self.0[13], self.0[14], self.0[15]])
    }
}

impl fmt::Display for TrackUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).hyphenated())
    }
}

impl fmt::Debug for TrackUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrackUuid({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let u = TrackUuid::new(0x0000_0102_0304_0506, 0xdead_beef);
        let b = u.as_bytes();
        assert_eq!(&b[..6], b"TRACK\0");
        // little-endian truncated timestamp
        assert_eq!(&b[6..12], &[0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        // big-endian tid
        assert_eq!(&b[12..], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(u.tid(), 0xdead_beef);
    }

    #[test]
    fn derive_keeps_timestamp() {
        let host = TrackUuid::new(123_456_789, 7);
        let latent = TrackUuid::with_tid(&host, 42);
        assert_eq!(host.as_bytes()[..12], latent.as_bytes()[..12]);
        assert_eq!(latent.tid(), 42);
        assert_ne!(host, latent);
    }
}
