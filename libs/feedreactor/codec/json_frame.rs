//! Framed JSON codec
//!
//! Each message is a fixed header followed by a JSON body:
//!
//! ```text
//! 0        1        2           3       4               8            10
//! ┌────────┬────────┬───────────┬───────┬───────────────┬────────────┬──────────┐
//! │ class  │ domain │ container │ flags │ stream id i32 │ service id │ body ... │
//! └────────┴────────┴───────────┴───────┴───────────────┴────────────┴──────────┘
//! flags: bit 0 complete, bit 1 service id present
//! ```
//!
//! Integers are big endian. An empty body decodes as `null`.

use crate::traits::codec::{CodecError, ContainerType, DomainType, Msg, MsgClass, WireCodec};
use crate::traits::transport::TransportBuffer;

pub const HEADER_LEN: usize = 10;

const FLAG_COMPLETE: u8 = 0x01;
const FLAG_HAS_SERVICE: u8 = 0x02;

/// Headroom over the header requested for a first encode attempt
const BODY_SIZE_GUESS: usize = 256;

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFrameCodec;

impl JsonFrameCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encode to a standalone byte vector
    pub fn to_bytes(&self, msg: &Msg) -> Result<Vec<u8>, CodecError> {
        let mut flags = 0;
        if msg.complete {
            flags |= FLAG_COMPLETE;
        }
        if msg.service_id.is_some() {
            flags |= FLAG_HAS_SERVICE;
        }

        let mut out = Vec::with_capacity(HEADER_LEN + BODY_SIZE_GUESS);
        out.push(msg.msg_class as u8);
        out.push(msg.domain.to_u8());
        out.push(msg.container as u8);
        out.push(flags);
        out.extend_from_slice(&msg.stream_id.to_be_bytes());
        out.extend_from_slice(&msg.service_id.unwrap_or_default().to_be_bytes());
        if !msg.body.is_null() {
            serde_json::to_writer(&mut out, &msg.body).map_err(|e| CodecError::Body(e.to_string()))?;
        }
        Ok(out)
    }
}

impl WireCodec for JsonFrameCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Msg, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                len: bytes.len(),
                needed: HEADER_LEN,
            });
        }
        let msg_class = MsgClass::from_u8(bytes[0]).ok_or(CodecError::InvalidHeader {
            field: "msg_class",
            value: bytes[0],
        })?;
        let domain = DomainType::from_u8(bytes[1]);
        let container = ContainerType::from_u8(bytes[2]).ok_or(CodecError::InvalidHeader {
            field: "container",
            value: bytes[2],
        })?;
        let flags = bytes[3];
        let stream_id = i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let service_id = u16::from_be_bytes([bytes[8], bytes[9]]);

        let body_bytes = &bytes[HEADER_LEN..];
        let body = if body_bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(body_bytes).map_err(|e| CodecError::Body(e.to_string()))?
        };

        Ok(Msg {
            msg_class,
            domain,
            stream_id,
            container,
            service_id: (flags & FLAG_HAS_SERVICE != 0).then_some(service_id),
            complete: flags & FLAG_COMPLETE != 0,
            body,
        })
    }

    fn encode(&self, msg: &Msg, buffer: &mut TransportBuffer) -> Result<(), CodecError> {
        let bytes = self.to_bytes(msg)?;
        buffer.write_bytes(&bytes)?;
        Ok(())
    }

    fn encoded_size_hint(&self, _msg: &Msg) -> usize {
        HEADER_LEN + BODY_SIZE_GUESS
    }
}
