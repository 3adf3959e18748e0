//! Transaction framing.
//!
//! Every unit exchanged over a channel is one transaction:
//!
//! ```text
//! [u32 BE: code][u64 BE: correlation id][u8: direction][u32 BE: payload len][payload]
//! ```
//!
//! Response payloads begin with a status byte. Status `0` is followed by the
//! encoded return value; any other status is followed by a nullable string
//! carrying the error message.

use crate::codec::{get_string, put_string, NULL_STRING_LEN};
use crate::error::{Result, XprocError, STATUS_OK};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed transaction header.
pub const HEADER_LEN: usize = 4 + 8 + 1 + 4;

/// Which way a transaction travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    fn as_byte(self) -> u8 {
        match self {
            Direction::Request => 0,
            Direction::Response => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Direction::Request),
            1 => Ok(Direction::Response),
            other => Err(XprocError::malformed(format!("invalid direction {}", other))),
        }
    }
}

/// One request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub code: u32,
    pub correlation_id: u64,
    pub direction: Direction,
    pub payload: Bytes,
}

impl Transaction {
    pub fn request(code: u32, correlation_id: u64, payload: Bytes) -> Self {
        Self {
            code,
            correlation_id,
            direction: Direction::Request,
            payload,
        }
    }

    /// Successful response carrying an encoded return value.
    pub fn ok_response(code: u32, correlation_id: u64, body: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(1 + body.len());
        payload.put_u8(STATUS_OK);
        payload.put_slice(body);
        Self {
            code,
            correlation_id,
            direction: Direction::Response,
            payload: payload.freeze(),
        }
    }

    /// Error response for a request that could not be served.
    pub fn error_response(code: u32, correlation_id: u64, err: &XprocError) -> Self {
        let mut payload = BytesMut::new();
        payload.put_u8(err.to_status_code());
        // Only fails for strings near 4 GiB; fall back to a null message.
        if put_string(&mut payload, Some(&err.to_string())).is_err() {
            payload.truncate(1);
            payload.put_u32(NULL_STRING_LEN);
        }
        Self {
            code,
            correlation_id,
            direction: Direction::Response,
            payload: payload.freeze(),
        }
    }

    /// Serialize header and payload into one frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(self.code);
        buf.put_u64(self.correlation_id);
        buf.put_u8(self.direction.as_byte());
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a frame produced by [`Transaction::encode`].
    ///
    /// The declared payload length must match the frame exactly.
    pub fn decode(frame: Bytes) -> Result<Self> {
        if frame.len() < HEADER_LEN {
            return Err(XprocError::malformed(format!(
                "transaction header needs {} bytes, frame has {}",
                HEADER_LEN,
                frame.len()
            )));
        }

        let mut header = &frame[..HEADER_LEN];
        let code = header.get_u32();
        let correlation_id = header.get_u64();
        let direction = Direction::from_byte(header.get_u8())?;
        let payload_len = header.get_u32() as usize;

        let available = frame.len() - HEADER_LEN;
        if payload_len != available {
            return Err(XprocError::malformed(format!(
                "declared payload length {} but frame carries {}",
                payload_len, available
            )));
        }

        Ok(Self {
            code,
            correlation_id,
            direction,
            payload: frame.slice(HEADER_LEN..),
        })
    }

    /// Interpret a response payload: the encoded return value on success, the
    /// rebuilt error otherwise.
    pub fn into_reply(self) -> Result<Bytes> {
        let mut payload = self.payload;
        if payload.is_empty() {
            return Err(XprocError::malformed("response without status byte"));
        }

        let status = payload.get_u8();
        if status == STATUS_OK {
            return Ok(payload);
        }

        let mut cursor = &payload[..];
        let message = get_string(&mut cursor)?;
        Err(XprocError::from_status(status, self.code, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let tx = Transaction::request(3, 0x0102_0304_0506_0708, Bytes::from_static(b"xy"));
        let frame = tx.encode();

        assert_eq!(frame.len(), HEADER_LEN + 2);
        assert_eq!(&frame[..4], &[0, 0, 0, 3]);
        assert_eq!(&frame[4..12], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(frame[12], 0);
        assert_eq!(&frame[13..17], &[0, 0, 0, 2]);
        assert_eq!(Transaction::decode(frame).unwrap(), tx);
    }

    #[test]
    fn test_short_frame_is_malformed() {
        let err = Transaction::decode(Bytes::from_static(&[0, 0, 1])).unwrap_err();
        assert!(matches!(err, XprocError::MalformedPayload { .. }));
    }

    #[test]
    fn test_payload_length_mismatch_is_malformed() {
        let mut frame = BytesMut::from(&Transaction::request(1, 1, Bytes::new()).encode()[..]);
        frame.put_u8(9);
        assert!(Transaction::decode(frame.freeze()).is_err());
    }

    #[test]
    fn test_invalid_direction_is_malformed() {
        let mut frame = BytesMut::from(&Transaction::request(1, 1, Bytes::new()).encode()[..]);
        frame[12] = 7;
        assert!(Transaction::decode(frame.freeze()).is_err());
    }

    #[test]
    fn test_ok_response_reply() {
        let tx = Transaction::ok_response(1, 5, &[0, 0, 0, 42]);
        assert_eq!(tx.direction, Direction::Response);
        assert_eq!(&tx.into_reply().unwrap()[..], &[0, 0, 0, 42]);
    }

    #[test]
    fn test_error_response_reply() {
        let tx = Transaction::error_response(7, 5, &XprocError::UnsupportedMethod { code: 7 });
        match tx.into_reply() {
            Err(XprocError::UnsupportedMethod { code }) => assert_eq!(code, 7),
            other => panic!("Expected UnsupportedMethod, got: {:?}", other),
        }
    }
}
