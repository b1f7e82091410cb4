//! Bolt message serialization boundary.
//!
//! The connection treats request and response payloads as opaque byte
//! vectors; this module is the only place that knows what is inside them.
//! Requests built here: HELLO, LOGON, LOGOFF, GOODBYE, RESET. Responses
//! interpreted here: SUCCESS, FAILURE, IGNORED, plus tag peeking for the
//! record-streaming loop.

use crate::errors::BoltError;
use crate::packstream::{Reader, Value, Writer};
use crate::version::{V5_1, V5_3, Version};
use std::collections::HashMap;

/// Structure tags for the message subset the transport exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageTag {
    Hello = 0x01,
    Goodbye = 0x02,
    Reset = 0x0F,
    Logon = 0x6A,
    Logoff = 0x6B,
    Success = 0x70,
    Record = 0x71,
    Ignored = 0x7E,
    Failure = 0x7F,
}

impl MessageTag {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(MessageTag::Hello),
            0x02 => Some(MessageTag::Goodbye),
            0x0F => Some(MessageTag::Reset),
            0x6A => Some(MessageTag::Logon),
            0x6B => Some(MessageTag::Logoff),
            0x70 => Some(MessageTag::Success),
            0x71 => Some(MessageTag::Record),
            0x7E => Some(MessageTag::Ignored),
            0x7F => Some(MessageTag::Failure),
            _ => None,
        }
    }
}

/// Summary metadata returned by SUCCESS and FAILURE messages.
pub type Metadata = HashMap<String, Value>;

/// Client identity advertised in HELLO for Bolt >= 5.3.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoltAgent {
    pub product: String,
    pub platform: Option<String>,
    pub language: Option<String>,
}

/// Everything that goes into a HELLO, assembled by the connection from its
/// config and the negotiated version.
#[derive(Debug, Clone, Default)]
pub struct HelloParams {
    pub user_agent: String,
    pub bolt_agent: Option<BoltAgent>,
    pub routing_context: Option<Metadata>,
    /// Protocol patches to offer; `["utc"]` on 4.3/4.4, empty otherwise.
    pub patch_bolt: Vec<String>,
    /// Auth tokens embedded directly in the HELLO extra map (< 5.1 only);
    /// empty when auth travels in a separate LOGON.
    pub auth_tokens: Metadata,
}

/// Reads the structure tag at the fixed offset of a message payload
/// without consuming it. Fails on anything that is not a well-formed
/// structure header.
pub fn peek_tag(payload: &[u8]) -> Result<u8, BoltError> {
    if payload.is_empty() {
        return Err(BoltError::InvalidMessageFormat(
            "cannot peek tag of an empty payload".into(),
        ));
    }
    let mut reader = Reader::new(payload);
    let (tag, _fields) = reader.read_struct_header()?;
    Ok(tag)
}

pub fn serialize_hello(params: &HelloParams, version: Version) -> Result<Vec<u8>, BoltError> {
    let mut extra: Metadata = HashMap::new();
    extra.insert("user_agent".into(), Value::from(params.user_agent.as_str()));

    if version >= V5_3 {
        if let Some(agent) = &params.bolt_agent {
            let mut agent_map: Metadata = HashMap::new();
            agent_map.insert("product".into(), Value::from(agent.product.as_str()));
            if let Some(platform) = &agent.platform {
                agent_map.insert("platform".into(), Value::from(platform.as_str()));
            }
            if let Some(language) = &agent.language {
                agent_map.insert("language".into(), Value::from(language.as_str()));
            }
            extra.insert("bolt_agent".into(), Value::Map(agent_map));
        }
    }

    if let Some(routing) = &params.routing_context {
        extra.insert("routing".into(), Value::Map(routing.clone()));
    }

    if !params.patch_bolt.is_empty() {
        extra.insert(
            "patch_bolt".into(),
            Value::List(
                params
                    .patch_bolt
                    .iter()
                    .map(|p| Value::from(p.as_str()))
                    .collect(),
            ),
        );
    }

    // Pre-5.1 embedded auth: the token keys sit directly in the extra map.
    if version < V5_1 {
        for (key, value) in &params.auth_tokens {
            extra.insert(key.clone(), value.clone());
        }
    }

    let mut writer = Writer::new();
    writer.write_struct_header(MessageTag::Hello as u8, 1)?;
    writer.write_map(&extra)?;
    Ok(writer.into_bytes())
}

pub fn serialize_logon(auth_tokens: &Metadata) -> Result<Vec<u8>, BoltError> {
    let mut writer = Writer::new();
    writer.write_struct_header(MessageTag::Logon as u8, 1)?;
    writer.write_map(auth_tokens)?;
    Ok(writer.into_bytes())
}

pub fn serialize_logoff() -> Result<Vec<u8>, BoltError> {
    let mut writer = Writer::new();
    writer.write_struct_header(MessageTag::Logoff as u8, 0)?;
    Ok(writer.into_bytes())
}

pub fn serialize_goodbye() -> Result<Vec<u8>, BoltError> {
    let mut writer = Writer::new();
    writer.write_struct_header(MessageTag::Goodbye as u8, 0)?;
    Ok(writer.into_bytes())
}

pub fn serialize_reset() -> Result<Vec<u8>, BoltError> {
    let mut writer = Writer::new();
    writer.write_struct_header(MessageTag::Reset as u8, 0)?;
    Ok(writer.into_bytes())
}

pub fn deserialize_success(payload: &[u8]) -> Result<Metadata, BoltError> {
    deserialize_summary(payload, MessageTag::Success)
}

pub fn deserialize_failure(payload: &[u8]) -> Result<Metadata, BoltError> {
    deserialize_summary(payload, MessageTag::Failure)
}

/// IGNORED carries no metadata of interest; some servers send an empty
/// map field, some send none.
pub fn deserialize_ignored(payload: &[u8]) -> Result<(), BoltError> {
    let mut reader = Reader::new(payload);
    let (tag, fields) = reader.read_struct_header()?;
    if tag != MessageTag::Ignored as u8 {
        return Err(BoltError::InvalidMessageFormat(format!(
            "expected IGNORED (0x7E), found tag 0x{tag:02X}"
        )));
    }
    if fields > 0 {
        reader.read_map()?;
    }
    Ok(())
}

fn deserialize_summary(payload: &[u8], expected: MessageTag) -> Result<Metadata, BoltError> {
    let mut reader = Reader::new(payload);
    let (tag, fields) = reader.read_struct_header()?;
    if tag != expected as u8 {
        return Err(BoltError::InvalidMessageFormat(format!(
            "expected tag 0x{:02X}, found 0x{tag:02X}",
            expected as u8
        )));
    }
    if fields != 1 {
        return Err(BoltError::InvalidMessageFormat(format!(
            "summary must carry exactly one metadata map, found {fields} fields"
        )));
    }
    reader.read_map()
}
