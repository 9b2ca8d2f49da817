//! # LatCheck Wire Protocol
//!
//! Shared protocol definitions for the LatCheck probing agent and collection
//! server. A message is an 8-byte big-endian header followed by a typed
//! payload; the whole frame travels over a mutually authenticated TLS stream.
//!
//! ```text
//! ┌──────────────────┬──────────────────┬──────────────────────┐
//! │ msg_type: u32 BE │ data_len: u32 BE │ payload (data_len B) │
//! └──────────────────┴──────────────────┴──────────────────────┘
//! ```
//!
//! Decoding never yields a partial message: [`frame::extract_frame`] returns
//! `Ok(None)` on a short buffer and leaves the bytes in place.

/// Result-code taxonomy shared by responses and internal errors
pub mod error;
/// Frame header encoding and buffer-level frame extraction
pub mod frame;
/// Typed message payloads and per-type encode/decode
pub mod message;

pub use error::{ProtoError, ResultCode};
pub use frame::{extract_frame, FrameHeader, HEADER_LEN, MAX_PAYLOAD_LEN};
pub use message::{LatencyRecord, Message, MessageType, ServerEntry};

/// Sentinel latency standing for "no reply" (milliseconds).
///
/// Probe workers report this value for targets that never answered; it is
/// persisted as a regular record so the analysis side can tell dead targets
/// from slow ones.
pub const MAX_LATENCY: u32 = 10_000;
