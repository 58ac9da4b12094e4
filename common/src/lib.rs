//! Shared library used by the RTP-MIDI session crates.
//!
//! This crate is the **public gateway** for everything the endpoint engine,
//! the demo binaries, and the integration tests have in common: the AppleMIDI
//! session-control codec, the RTP-MIDI data-packet codec, delta-time
//! varints, and tracing initialization. Downstream crates should import
//! through `rtpmidi_common::*` exports and should not drill into internal
//! module structure.

mod observability;
mod wire;

pub use observability::init_tracing;
pub use wire::{
    encode_delta_time, read_delta_time, RtpMidiPacket, SessionPacket, MAX_DELTA_TIME,
    MAX_LONG_MIDI_LIST, MAX_RTP_PAYLOAD, MAX_SESSION_NAME_LEN, MAX_SHORT_MIDI_LIST,
    PROTOCOL_VERSION, RTP_MIDI_SIGNATURE, SESSION_SIGNATURE,
};
