//! Length-prefixed chunking layer.
//!
//! A message on the wire is a sequence of `(u16 be length)(body)` chunks
//! terminated by a zero-length header. A lone zero header between messages
//! is a NOOP keep-alive and carries no payload.

use crate::errors::BoltError;
use crate::wire;

/// Chunk header is a single big-endian u16.
pub const CHUNK_HEADER_SIZE: usize = 2;

/// Largest body a single chunk can carry (the header is a u16).
pub const MAX_CHUNK_PAYLOAD: usize = u16::MAX as usize;

/// Upper bound on a reassembled message. A peer announcing more than this
/// across one message is treated as hostile and the connection torn down.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Encodes a payload into its on-wire chunked form, terminator included.
///
/// An empty payload encodes to a lone zero header (a NOOP). Bodies
/// partition the payload left to right, each at most `MAX_CHUNK_PAYLOAD`
/// bytes.
pub fn encode_chunks(payload: &[u8]) -> Vec<u8> {
    let chunk_count = payload.len().div_ceil(MAX_CHUNK_PAYLOAD);
    let mut encoded =
        Vec::with_capacity(payload.len() + (chunk_count + 1) * CHUNK_HEADER_SIZE);
    for body in payload.chunks(MAX_CHUNK_PAYLOAD) {
        encoded.extend_from_slice(&wire::encode_u16(body.len() as u16));
        encoded.extend_from_slice(body);
    }
    encoded.extend_from_slice(&wire::encode_u16(0));
    encoded
}

/// Validates a header value read off the wire and accounts it against the
/// running message size. Returns the body length to read next, or `None`
/// for the end-of-message terminator.
///
/// A u16 header can never exceed `MAX_CHUNK_PAYLOAD`; the check stays as a
/// guard against a desynchronized or corrupt header source.
pub fn accept_chunk_header(header: u16, total_so_far: usize) -> Result<Option<usize>, BoltError> {
    let len = header as usize;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_CHUNK_PAYLOAD {
        return Err(BoltError::ChunkTooLarge(len));
    }
    if total_so_far + len > MAX_MESSAGE_SIZE {
        return Err(BoltError::MessageTooLarge(total_so_far + len));
    }
    Ok(Some(len))
}

/// Decodes one chunked message from a contiguous buffer, returning the
/// payload and the number of input bytes consumed. An empty payload is a
/// NOOP. Used by tests and by callers that already hold the full frame;
/// the connections decode incrementally off their streams instead.
pub fn decode_chunks(input: &[u8]) -> Result<(Vec<u8>, usize), BoltError> {
    let mut payload = Vec::new();
    let mut pos = 0usize;
    loop {
        let Some(header_bytes) = input.get(pos..pos + CHUNK_HEADER_SIZE) else {
            return Err(BoltError::ChunkDecodingError(
                "input ended inside a chunk header".into(),
            ));
        };
        pos += CHUNK_HEADER_SIZE;
        let header = wire::decode_u16([header_bytes[0], header_bytes[1]]);
        let Some(body_len) = accept_chunk_header(header, payload.len())? else {
            return Ok((payload, pos));
        };
        let Some(body) = input.get(pos..pos + body_len) else {
            return Err(BoltError::ChunkDecodingError(format!(
                "chunk header announced {body_len} bytes but input ended early"
            )));
        };
        payload.try_reserve(body_len).map_err(|_| {
            BoltError::OutOfMemory(format!("allocating {body_len} bytes for chunk body"))
        })?;
        payload.extend_from_slice(body);
        pos += body_len;
    }
}
