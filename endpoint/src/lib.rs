//! RTP-MIDI session endpoint engine.
//!
//! Implements the AppleMIDI session layer (invitation handshake on paired
//! control/data UDP sockets, three-packet clock synchronization, keepalive
//! and teardown) together with the RTP-MIDI payload path: an outbound MIDI
//! byte ring feeding RTP frames, and a stateful inbound decoder delivering
//! discrete MIDI messages to a host callback.
//!
//! The host drives everything through [`RtpMidiSession`]: call
//! [`RtpMidiSession::run_step`] every millisecond from a timing thread,
//! feed MIDI through [`RtpMidiSession::submit_midi`] or a detached
//! [`MidiSender`], and observe the session through [`SessionHandle`].

mod decoder;
mod fifo;
mod session;
mod socket;
mod stats;

pub use decoder::DEFAULT_SYSEX_CAPACITY;
pub use fifo::DEFAULT_STREAM_CAPACITY;
pub use session::{
    MidiEventCallback, MidiSender, RtpMidiSession, SessionConfig, SessionError, SessionHandle,
    SessionStatus,
};
pub use stats::SessionStats;
