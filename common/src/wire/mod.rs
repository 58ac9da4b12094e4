//! Wire codec for the two datagram families an RTP-MIDI endpoint exchanges.
//!
//! - `control`: AppleMIDI session-control packets (`IN`/`OK`/`NO`/`BY`/`CK`/`RS`)
//!   carried on both the control and data ports.
//! - `rtp`: RTP-MIDI data packets (RFC 6295 payload inside an RTP header).
//! - `vlq`: the variable-length delta-time quantity used inside MIDI lists.
//!
//! All multi-byte fields are network byte order. Parsing is length-checked
//! field by field; callers treat any error as a datagram to discard.

mod control;
mod rtp;
mod vlq;

pub use control::{SessionPacket, MAX_SESSION_NAME_LEN, PROTOCOL_VERSION, SESSION_SIGNATURE};
pub use rtp::{
    RtpMidiPacket, MAX_LONG_MIDI_LIST, MAX_RTP_PAYLOAD, MAX_SHORT_MIDI_LIST, RTP_MIDI_SIGNATURE,
};
pub use vlq::{encode_delta_time, read_delta_time, MAX_DELTA_TIME};
