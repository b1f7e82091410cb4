//! Bolt protocol version record and handshake-slot encoding.

use crate::errors::BoltError;
use crate::wire;
use std::fmt;

/// A negotiated or proposed protocol version.
///
/// Ordering is lexicographic on `(major, minor)`, which the derive gives us
/// from field order. `Version::ZERO` doubles as "no version" both before a
/// handshake completes and in the server's all-zero rejection reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

pub const V5_4: Version = Version::new(5, 4);
pub const V5_3: Version = Version::new(5, 3);
pub const V5_2: Version = Version::new(5, 2);
pub const V5_1: Version = Version::new(5, 1);
pub const V5_0: Version = Version::new(5, 0);
pub const V4_4: Version = Version::new(4, 4);
pub const V4_3: Version = Version::new(4, 3);
pub const V3_0: Version = Version::new(3, 0);

/// Versions offered during the handshake, most preferred first.
/// Proposals below 3.0 are not supported by this transport.
pub const DEFAULT_PROPOSED_VERSIONS: [Version; 7] = [V5_4, V5_3, V5_2, V5_1, V5_0, V4_4, V4_3];

impl Version {
    pub const ZERO: Version = Version::new(0, 0);

    pub const fn new(major: u8, minor: u8) -> Self {
        Version { major, minor }
    }

    /// Encodes this version as a 4-byte handshake slot: `0x0000MMNN`
    /// big-endian, major in the third byte, minor in the fourth.
    pub fn encode_slot(self) -> [u8; 4] {
        wire::encode_u32(((self.major as u32) << 8) | self.minor as u32)
    }

    /// Decodes a 4-byte handshake slot.
    ///
    /// Only the single-version form `0x0000MMNN` is accepted. A nonzero
    /// upper half is either a range proposal (Bolt 5.8+, out of scope) or
    /// garbage; both are rejected as an unsupported version rather than
    /// guessed at. All zeros decode to `Version::ZERO` — distinguishing
    /// "no common version" from a real 0.0 is the handshake layer's job.
    pub fn decode_slot(bytes: [u8; 4]) -> Result<Self, BoltError> {
        let value = wire::decode_u32(bytes);
        if value >> 16 != 0 {
            return Err(BoltError::UnsupportedProtocolVersion(format!(
                "handshake slot 0x{:08X} is not of the form 0x0000MMNN",
                value
            )));
        }
        Ok(Version::new((value >> 8) as u8, value as u8))
    }

    /// LOGON/LOGOFF exist from 5.1; below that, auth is embedded in HELLO.
    pub fn supports_logon(self) -> bool {
        self >= V5_1
    }

    /// The `patch_bolt: ["utc"]` negotiation only applies to 4.3 and 4.4;
    /// from 5.0 the UTC representation is unconditional.
    pub fn wants_utc_patch_offer(self) -> bool {
        self == V4_3 || self == V4_4
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_encoding_matches_wire_form() {
        assert_eq!(V5_4.encode_slot(), [0x00, 0x00, 0x05, 0x04]);
        assert_eq!(V4_3.encode_slot(), [0x00, 0x00, 0x04, 0x03]);
        assert_eq!(Version::ZERO.encode_slot(), [0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn slot_round_trip_all_majors_and_minors() {
        for major in 0..=255u8 {
            for minor in [0u8, 1, 7, 254, 255] {
                let v = Version::new(major, minor);
                assert_eq!(Version::decode_slot(v.encode_slot()).unwrap(), v);
            }
        }
    }

    #[test]
    fn nonzero_upper_bytes_are_unsupported() {
        assert!(matches!(
            Version::decode_slot([0x00, 0x01, 0x05, 0x04]),
            Err(BoltError::UnsupportedProtocolVersion(_))
        ));
        assert!(matches!(
            Version::decode_slot([0xFF, 0x00, 0x00, 0x00]),
            Err(BoltError::UnsupportedProtocolVersion(_))
        ));
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(V5_0 < V5_1);
        assert!(V4_4 < V5_0);
        assert!(V5_4 > V5_3);
        assert!(V5_1.supports_logon());
        assert!(!V5_0.supports_logon());
        assert!(V4_3.wants_utc_patch_offer());
        assert!(!V5_0.wants_utc_patch_offer());
    }

    #[test]
    fn display_is_major_dot_minor() {
        assert_eq!(V5_4.to_string(), "5.4");
        assert_eq!(Version::ZERO.to_string(), "0.0");
    }
}
