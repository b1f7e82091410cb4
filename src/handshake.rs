//! Version-negotiation handshake: 20-byte client request, 4-byte server reply.

use crate::errors::BoltError;
use crate::version::Version;
use crate::wire;

/// Magic preamble opening every Bolt connection.
pub const BOLT_MAGIC: u32 = 0x6060_B017;

/// Number of version slots in the request.
pub const PROPOSAL_SLOTS: usize = 4;

/// 4-byte magic + four 4-byte version slots.
pub const HANDSHAKE_REQUEST_LEN: usize = 4 + PROPOSAL_SLOTS * 4;

/// 4-byte big-endian version, or all zeros.
pub const HANDSHAKE_RESPONSE_LEN: usize = 4;

/// Builds the handshake request: magic preamble followed by up to four
/// proposed versions in preference order, padded with zero slots.
///
/// Versions beyond the fourth are silently ignored; an empty list is a
/// caller bug and rejected.
pub fn build_handshake_request(
    proposed: &[Version],
) -> Result<[u8; HANDSHAKE_REQUEST_LEN], BoltError> {
    if proposed.is_empty() {
        return Err(BoltError::InvalidArgument(
            "handshake requires at least one proposed version".into(),
        ));
    }

    let mut request = [0u8; HANDSHAKE_REQUEST_LEN];
    request[..4].copy_from_slice(&wire::encode_u32(BOLT_MAGIC));
    for (slot, version) in proposed.iter().take(PROPOSAL_SLOTS).enumerate() {
        let offset = 4 + slot * 4;
        request[offset..offset + 4].copy_from_slice(&version.encode_slot());
    }
    // Remaining slots stay zeroed ("no version").
    Ok(request)
}

/// Parses the server's 4-byte reply.
///
/// An all-zero reply means the server accepted none of the proposals. The
/// caller must still check that the returned version was actually offered;
/// `negotiated_version_from_response` does both steps.
pub fn parse_handshake_response(
    response: [u8; HANDSHAKE_RESPONSE_LEN],
) -> Result<Version, BoltError> {
    let version = Version::decode_slot(response)?;
    if version == Version::ZERO && response == [0u8; 4] {
        return Err(BoltError::HandshakeNoCommonVersion);
    }
    Ok(version)
}

/// Full response handling: parse, then verify the server picked something
/// we actually proposed. A server echoing an unoffered version is broken
/// and the connection must not proceed.
pub fn negotiated_version_from_response(
    response: [u8; HANDSHAKE_RESPONSE_LEN],
    proposed: &[Version],
) -> Result<Version, BoltError> {
    let version = parse_handshake_response(response)?;
    if !proposed.iter().take(PROPOSAL_SLOTS).any(|v| *v == version) {
        return Err(BoltError::UnsupportedProtocolVersion(format!(
            "server selected {version}, which was not among the proposals"
        )));
    }
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::{DEFAULT_PROPOSED_VERSIONS, V4_4, V5_0, V5_3, V5_4};

    #[test]
    fn request_layout_magic_then_slots() {
        let request = build_handshake_request(&[V5_4, V5_3]).unwrap();
        assert_eq!(
            request,
            [
                0x60, 0x60, 0xB0, 0x17, // magic
                0x00, 0x00, 0x05, 0x04, // 5.4
                0x00, 0x00, 0x05, 0x03, // 5.3
                0x00, 0x00, 0x00, 0x00, // padding
                0x00, 0x00, 0x00, 0x00,
            ]
        );
    }

    #[test]
    fn request_truncates_to_four_slots() {
        let request = build_handshake_request(&DEFAULT_PROPOSED_VERSIONS).unwrap();
        assert_eq!(request.len(), HANDSHAKE_REQUEST_LEN);
        assert_eq!(&request[..4], &[0x60, 0x60, 0xB0, 0x17]);
        // First four preferences present in order, fifth and later dropped.
        assert_eq!(&request[4..8], &V5_4.encode_slot());
        assert_eq!(&request[16..20], &DEFAULT_PROPOSED_VERSIONS[3].encode_slot());
    }

    #[test]
    fn empty_proposal_list_is_invalid() {
        assert!(matches!(
            build_handshake_request(&[]),
            Err(BoltError::InvalidArgument(_))
        ));
    }

    #[test]
    fn all_zero_response_means_no_common_version() {
        assert!(matches!(
            parse_handshake_response([0, 0, 0, 0]),
            Err(BoltError::HandshakeNoCommonVersion)
        ));
    }

    #[test]
    fn response_version_must_have_been_proposed() {
        let proposed = [V5_4, V5_3];
        assert_eq!(
            negotiated_version_from_response([0, 0, 5, 4], &proposed).unwrap(),
            V5_4
        );
        assert!(matches!(
            negotiated_version_from_response(V4_4.encode_slot(), &proposed),
            Err(BoltError::UnsupportedProtocolVersion(_))
        ));
    }

    #[test]
    fn response_only_counts_the_offered_slots() {
        // 5.0 is in the preference list but beyond the four wire slots, so a
        // server answering with it is out of contract.
        assert!(DEFAULT_PROPOSED_VERSIONS.contains(&V5_0));
        assert!(matches!(
            negotiated_version_from_response(V5_0.encode_slot(), &DEFAULT_PROPOSED_VERSIONS),
            Err(BoltError::UnsupportedProtocolVersion(_))
        ));
    }

    #[test]
    fn range_style_response_is_rejected() {
        assert!(matches!(
            negotiated_version_from_response([0x00, 0x02, 0x05, 0x04], &[V5_4]),
            Err(BoltError::UnsupportedProtocolVersion(_))
        ));
    }
}
