//! Typed messages and their payload codecs.
//!
//! Each variant of [`Message`] corresponds to one wire type. `encode` emits a
//! full frame (header + payload); `decode` parses a payload that has already
//! been extracted by [`crate::frame::extract_frame`]. Fixed-width string
//! fields are NUL-padded on the wire and must stay NUL-terminated within
//! their buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtoError, ResultCode};
use crate::frame::{FrameHeader, HEADER_LEN};

/// Wire size of the fixed user name field.
pub const USER_NAME_LEN: usize = 32;
/// Wire size of the fixed password field.
pub const PASSWORD_LEN: usize = 32;
/// Wire size of the fixed report location field.
pub const LOCATION_LEN: usize = 128;

/// Recognized message types (`0x0001..=0x0008`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    LoginRequest = 0x0001,
    LoginOk = 0x0002,
    LoginFail = 0x0003,
    ListRequest = 0x0004,
    ListResponse = 0x0005,
    ReportRequest = 0x0006,
    ReportOk = 0x0007,
    ReportFail = 0x0008,
}

impl MessageType {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(value: u32) -> Option<Self> {
        use MessageType::*;
        Some(match value {
            0x0001 => LoginRequest,
            0x0002 => LoginOk,
            0x0003 => LoginFail,
            0x0004 => ListRequest,
            0x0005 => ListResponse,
            0x0006 => ReportRequest,
            0x0007 => ReportOk,
            0x0008 => ReportFail,
            _ => return None,
        })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::LoginRequest => "LOGIN_REQUEST",
            MessageType::LoginOk => "LOGIN_OK",
            MessageType::LoginFail => "LOGIN_FAIL",
            MessageType::ListRequest => "LIST_REQUEST",
            MessageType::ListResponse => "LIST_RESPONSE",
            MessageType::ReportRequest => "REPORT_REQUEST",
            MessageType::ReportOk => "REPORT_OK",
            MessageType::ReportFail => "REPORT_FAIL",
        };
        f.write_str(name)
    }
}

/// One `(server_id, ip_addr)` entry of a LIST_RESPONSE.
///
/// `ip_addr` is an IPv4 address as a host-order `u32`, the same encoding the
/// `test_server` table uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerEntry {
    pub server_id: u32,
    pub ip_addr: u32,
}

/// One `(server_id, latency)` record of a REPORT_REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyRecord {
    pub server_id: u32,
    /// Round-trip time in milliseconds; [`crate::MAX_LATENCY`] means no reply.
    pub latency: u32,
}

/// A fully decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    LoginRequest { user_name: String, password: String },
    LoginOk(ResultCode),
    LoginFail(ResultCode),
    ListRequest,
    ListResponse(Vec<ServerEntry>),
    ReportRequest {
        location: String,
        records: Vec<LatencyRecord>,
    },
    ReportOk(ResultCode),
    ReportFail(ResultCode),
}

impl Message {
    /// Wire type of this message.
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::LoginRequest { .. } => MessageType::LoginRequest,
            Message::LoginOk(_) => MessageType::LoginOk,
            Message::LoginFail(_) => MessageType::LoginFail,
            Message::ListRequest => MessageType::ListRequest,
            Message::ListResponse(_) => MessageType::ListResponse,
            Message::ReportRequest { .. } => MessageType::ReportRequest,
            Message::ReportOk(_) => MessageType::ReportOk,
            Message::ReportFail(_) => MessageType::ReportFail,
        }
    }

    /// Serialize to a complete frame (header followed by payload).
    pub fn encode(&self) -> Result<Bytes, ProtoError> {
        let payload = self.encode_payload()?;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        FrameHeader::new(self.msg_type(), payload.len() as u32).encode(&mut buf);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    fn encode_payload(&self) -> Result<BytesMut, ProtoError> {
        let mut buf = BytesMut::new();
        match self {
            Message::LoginRequest {
                user_name,
                password,
            } => {
                put_fixed_str(&mut buf, user_name, USER_NAME_LEN, "user_name")?;
                put_fixed_str(&mut buf, password, PASSWORD_LEN, "password")?;
            }
            Message::LoginOk(code)
            | Message::LoginFail(code)
            | Message::ReportOk(code)
            | Message::ReportFail(code) => {
                buf.put_u32(code.code());
            }
            Message::ListRequest => {}
            Message::ListResponse(servers) => {
                buf.put_u32(servers.len() as u32);
                for server in servers {
                    buf.put_u32(server.server_id);
                    buf.put_u32(server.ip_addr);
                }
            }
            Message::ReportRequest { location, records } => {
                put_fixed_str(&mut buf, location, LOCATION_LEN, "location")?;
                buf.put_u32(records.len() as u32);
                for record in records {
                    buf.put_u32(record.server_id);
                    buf.put_u32(record.latency);
                }
            }
        }
        Ok(buf)
    }

    /// Parse a payload extracted for `msg_type`.
    ///
    /// Fixed-width payloads must match their size exactly; count-prefixed
    /// payloads must account for every byte. Anything else is a protocol
    /// violation and the caller closes the connection.
    pub fn decode(msg_type: MessageType, mut payload: Bytes) -> Result<Self, ProtoError> {
        match msg_type {
            MessageType::LoginRequest => {
                expect_len("LOGIN_REQUEST", &payload, USER_NAME_LEN + PASSWORD_LEN)?;
                let user_name = get_fixed_str(&mut payload, USER_NAME_LEN, "user_name")?;
                let password = get_fixed_str(&mut payload, PASSWORD_LEN, "password")?;
                Ok(Message::LoginRequest {
                    user_name,
                    password,
                })
            }
            MessageType::LoginOk => Ok(Message::LoginOk(get_result_code(&payload, "LOGIN_OK")?)),
            MessageType::LoginFail => {
                Ok(Message::LoginFail(get_result_code(&payload, "LOGIN_FAIL")?))
            }
            MessageType::ListRequest => {
                expect_len("LIST_REQUEST", &payload, 0)?;
                Ok(Message::ListRequest)
            }
            MessageType::ListResponse => {
                if payload.len() < 4 {
                    return Err(ProtoError::SizeMismatch {
                        kind: "LIST_RESPONSE",
                        expected: 4,
                        actual: payload.len(),
                    });
                }
                let count = payload.get_u32() as usize;
                expect_len("LIST_RESPONSE", &payload, count * 8)?;
                let mut servers = Vec::with_capacity(count);
                for _ in 0..count {
                    servers.push(ServerEntry {
                        server_id: payload.get_u32(),
                        ip_addr: payload.get_u32(),
                    });
                }
                Ok(Message::ListResponse(servers))
            }
            MessageType::ReportRequest => {
                if payload.len() < LOCATION_LEN + 4 {
                    return Err(ProtoError::SizeMismatch {
                        kind: "REPORT_REQUEST",
                        expected: LOCATION_LEN + 4,
                        actual: payload.len(),
                    });
                }
                let location = get_fixed_str(&mut payload, LOCATION_LEN, "location")?;
                let count = payload.get_u32() as usize;
                expect_len("REPORT_REQUEST", &payload, count * 8)?;
                let mut records = Vec::with_capacity(count);
                for _ in 0..count {
                    records.push(LatencyRecord {
                        server_id: payload.get_u32(),
                        latency: payload.get_u32(),
                    });
                }
                Ok(Message::ReportRequest { location, records })
            }
            MessageType::ReportOk => Ok(Message::ReportOk(get_result_code(&payload, "REPORT_OK")?)),
            MessageType::ReportFail => Ok(Message::ReportFail(get_result_code(
                &payload,
                "REPORT_FAIL",
            )?)),
        }
    }
}

fn expect_len(kind: &'static str, payload: &Bytes, expected: usize) -> Result<(), ProtoError> {
    if payload.len() != expected {
        return Err(ProtoError::SizeMismatch {
            kind,
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn get_result_code(payload: &Bytes, kind: &'static str) -> Result<ResultCode, ProtoError> {
    if payload.len() != 4 {
        return Err(ProtoError::SizeMismatch {
            kind,
            expected: 4,
            actual: payload.len(),
        });
    }
    let raw = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    ResultCode::from_code(raw).ok_or(ProtoError::UnknownResultCode(raw))
}

/// Write `value` into a `width`-byte NUL-padded field.
///
/// The encoded bytes must leave room for at least one NUL so the receiver can
/// always find a terminator.
fn put_fixed_str(
    buf: &mut BytesMut,
    value: &str,
    width: usize,
    field: &'static str,
) -> Result<(), ProtoError> {
    let bytes = value.as_bytes();
    if bytes.len() >= width {
        return Err(ProtoError::FieldTooLong {
            field,
            len: bytes.len(),
            max: width - 1,
        });
    }
    buf.put_slice(bytes);
    buf.put_bytes(0, width - bytes.len());
    Ok(())
}

/// Read a `width`-byte NUL-padded field and return the string before the
/// first NUL.
fn get_fixed_str(
    payload: &mut Bytes,
    width: usize,
    field: &'static str,
) -> Result<String, ProtoError> {
    let raw = payload.split_to(width);
    let end = raw
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtoError::UnterminatedString(field))?;
    std::str::from_utf8(&raw[..end])
        .map(str::to_owned)
        .map_err(|_| ProtoError::InvalidUtf8(field))
}
