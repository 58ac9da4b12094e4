//! Session state machine and endpoint façade.
//!
//! One [`RtpMidiSession`] talks to one remote peer over two paired UDP
//! sockets (control and data). As **initiator** it drives the AppleMIDI
//! invitation handshake and the recurring clock-sync rounds; as **listener**
//! it waits to be invited and answers the peer's sync requests. Either way
//! the host owns the pacing: it calls [`RtpMidiSession::run_step`] every
//! millisecond from its timing thread, and that is the only thread that
//! touches sockets, timers, and the decoder.
//!
//! Cross-thread access is limited to two narrow channels: a [`MidiSender`]
//! (the producer half of the outbound byte ring) and a [`SessionHandle`]
//! (atomics for status, latency, and the one-shot event flags).

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use rtpmidi_common::{RtpMidiPacket, SessionPacket, MAX_RTP_PAYLOAD, RTP_MIDI_SIGNATURE};

use crate::decoder::MidiDecoder;
use crate::fifo::{midi_stream, MidiStreamReader, MidiStreamWriter, DEFAULT_STREAM_CAPACITY};
use crate::socket::{bind_session_socket, send_datagram, try_recv_from};
use crate::stats::SessionStats;

/// 100 µs units added to the session clocks per 1 ms run-step.
const TICK_100US: u32 = 10;

/// Delay between invitation retransmissions.
const INVITE_RETRY_MS: u32 = 1000;

/// Grace period after the control-port acceptance before retrying on data.
const DATA_INVITE_GRACE_MS: u32 = 100;

/// Invitation attempts before the initiator starts over.
const MAX_INVITE_ATTEMPTS: u32 = 12;

/// How long a listener waits for the data-port invitation.
const WAIT_DATA_INVITE_MS: u32 = 5000;

/// How long a listener waits for the first clock-sync packet.
const WAIT_CLOCK_SYNC_MS: u32 = 2000;

/// Sync-round period right after the session opens, and the round count
/// kept at that faster cadence before settling down.
const FAST_SYNC_PERIOD_MS: u32 = 1500;
const FAST_SYNC_ROUNDS: u32 = 5;

/// Steady-state sync-round period.
const SLOW_SYNC_PERIOD_MS: u32 = 10_000;

/// Missed-round budgets for declaring the peer gone: a generous one while
/// the handshake and the fast rounds are still running, a tight one once a
/// sync exchange has completed.
const PRE_SYNC_TIMEOUT_BUDGET: i32 = 16;
const POST_SYNC_TIMEOUT_BUDGET: i32 = 4;

/// Pause before releasing sockets so the final BY can leave the host.
const CLOSE_LINGER: Duration = Duration::from_millis(50);

/// Sentinel for "latency not measured yet".
const LATENCY_UNKNOWN: u32 = u32::MAX;

/// Receive scratch size; covers the largest long-form MIDI list plus
/// headers, and any session-control packet with a maximal name.
const RECV_BUFFER_LEN: usize = 4224;

/// Host callback for decoded MIDI.
///
/// Invoked once per decoded MIDI message (including individual Real Time
/// bytes) and once per completed SysEx, with the event timestamp in 100 µs
/// units of the local session clock. Runs on the run-step thread; keep the
/// work short.
pub type MidiEventCallback = Box<dyn FnMut(&[u8], u32) + Send>;

/// Internal protocol states.
///
/// `InviteControl` through `Opened` belong to the initiator's path,
/// `WaitInviteControl` through `WaitClockSync` to the listener's; `Opened`
/// and `Closed` are shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    // ---
    Closed,
    InviteControl,
    InviteData,
    ClockSync0,
    ClockSync1,
    Opened,
    WaitInviteControl,
    WaitInviteData,
    WaitClockSync,
}

/// Coarse session status reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    // ---
    /// No session activity.
    Closed = 0,

    /// Inviting the remote peer.
    Inviting = 1,

    /// Handshake or clock synchronization in progress.
    Syncing = 2,

    /// MIDI data can be exchanged.
    Opened = 3,
}

impl SessionStatus {
    // ---
    fn from_code(code: u8) -> Self {
        // ---
        match code {
            1 => SessionStatus::Inviting,
            2 => SessionStatus::Syncing,
            3 => SessionStatus::Opened,
            _ => SessionStatus::Closed,
        }
    }
}

/// Errors from session setup.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    // ---
    /// The control socket could not be bound.
    #[error("failed to bind control socket: {0}")]
    ControlBind(#[source] io::Error),

    /// The data socket could not be bound.
    #[error("failed to bind data socket: {0}")]
    DataBind(#[source] io::Error),

    /// The session name exceeds the 63-byte wire limit.
    #[error("session name too long: {length} bytes (limit 63)")]
    NameTooLong { length: usize },

    /// An initiator was configured without a remote address.
    #[error("an initiator requires a remote address")]
    RemoteAddressRequired,
}

/// Addressing and role for one session attempt.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    // ---
    /// Peer to invite; `None` for a listener.
    pub remote_ip: Option<IpAddr>,

    /// Peer's control and data ports (only meaningful for an initiator).
    pub remote_ctrl_port: u16,
    pub remote_data_port: u16,

    /// Local ports to bind; 0 lets the OS choose the control port and the
    /// data port follows as control + 1.
    pub local_ctrl_port: u16,
    pub local_data_port: u16,

    /// Whether this endpoint actively invites the peer.
    pub initiator: bool,
}

impl SessionConfig {
    // ---
    /// Config for an initiator targeting the conventional port pair
    /// (data = control + 1) with OS-assigned local ports.
    pub fn initiator(remote_ip: IpAddr, remote_ctrl_port: u16) -> Self {
        // ---
        Self {
            remote_ip: Some(remote_ip),
            remote_ctrl_port,
            remote_data_port: remote_ctrl_port.wrapping_add(1),
            local_ctrl_port: 0,
            local_data_port: 0,
            initiator: true,
        }
    }

    /// Config for a listener on the given local control port
    /// (data = control + 1).
    pub fn listener(local_ctrl_port: u16) -> Self {
        // ---
        Self {
            remote_ip: None,
            remote_ctrl_port: 0,
            remote_data_port: 0,
            local_ctrl_port,
            local_data_port: 0,
            initiator: false,
        }
    }
}

/// State shared with [`SessionHandle`] and [`MidiSender`].
struct SharedState {
    // ---
    status: AtomicU8,
    latency: AtomicU32,
    connection_lost: AtomicBool,
    peer_closed: AtomicBool,
    connection_refused: AtomicBool,
}

impl SharedState {
    // ---
    fn new() -> Self {
        // ---
        Self {
            status: AtomicU8::new(SessionStatus::Closed as u8),
            latency: AtomicU32::new(LATENCY_UNKNOWN),
            connection_lost: AtomicBool::new(false),
            peer_closed: AtomicBool::new(false),
            connection_refused: AtomicBool::new(false),
        }
    }

    fn latency(&self) -> Option<u32> {
        // ---
        match self.latency.load(Ordering::Relaxed) {
            LATENCY_UNKNOWN => None,
            value => Some(value),
        }
    }
}

/// Clonable host-side view of the session.
///
/// All accessors are single-word atomic reads; the event polls are
/// one-shot and clear the flag they report.
#[derive(Clone)]
pub struct SessionHandle {
    // ---
    shared: Arc<SharedState>,
}

impl SessionHandle {
    // ---
    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_code(self.shared.status.load(Ordering::Relaxed))
    }

    /// Last measured round-trip latency in 100 µs units, once opened.
    pub fn latency(&self) -> Option<u32> {
        self.shared.latency()
    }

    /// True once after the peer stopped answering keepalive syncs.
    pub fn take_connection_lost(&self) -> bool {
        self.shared.connection_lost.swap(false, Ordering::Relaxed)
    }

    /// True once after the peer sent BY on an established session.
    pub fn take_peer_closed(&self) -> bool {
        self.shared.peer_closed.swap(false, Ordering::Relaxed)
    }

    /// True once after the peer rejected our invitation.
    pub fn take_connection_refused(&self) -> bool {
        self.shared.connection_refused.swap(false, Ordering::Relaxed)
    }
}

/// Producer half of the outbound MIDI stream, detachable to another thread.
///
/// Blocks submitted here must carry RTP-MIDI delta-times between
/// consecutive commands (the first command of a block is bare).
pub struct MidiSender {
    // ---
    writer: MidiStreamWriter,
    shared: Arc<SharedState>,
}

impl MidiSender {
    // ---
    /// Queues a whole MIDI block for the next outgoing frame.
    ///
    /// Returns `false` when the session is not opened or the ring lacks
    /// space for the entire block; nothing is queued in either case.
    pub fn submit(&mut self, block: &[u8]) -> bool {
        // ---
        if block.is_empty() {
            return true;
        }
        if SessionStatus::from_code(self.shared.status.load(Ordering::Relaxed))
            != SessionStatus::Opened
        {
            return false;
        }
        self.writer.push(block)
    }
}

/// Millisecond countdown driven by the run-step.
struct EventTimer {
    // ---
    running: bool,
    remaining_ms: u32,
}

impl EventTimer {
    // ---
    fn new() -> Self {
        Self {
            running: false,
            remaining_ms: 0,
        }
    }

    fn arm(&mut self, ms: u32) {
        // ---
        self.running = false;
        self.remaining_ms = ms;
        self.running = true;
    }

    fn cancel(&mut self) {
        self.running = false;
    }

    /// Counts one millisecond down; true exactly when the timer elapses.
    fn tick(&mut self) -> bool {
        // ---
        if !self.running {
            return false;
        }
        if self.remaining_ms > 0 {
            self.remaining_ms -= 1;
        }
        if self.remaining_ms == 0 {
            self.running = false;
            return true;
        }
        false
    }
}

/// What one receive-drain pass observed.
#[derive(Default)]
struct ReceiveOutcome {
    // ---
    accepted_on_ctrl: bool,
    rejected_on_ctrl: bool,
    accepted_on_data: bool,
    rejected_on_data: bool,
}

impl ReceiveOutcome {
    // ---
    fn rejected(&self) -> bool {
        self.rejected_on_ctrl || self.rejected_on_data
    }

    fn clear_accepts(&mut self) {
        // ---
        self.accepted_on_ctrl = false;
        self.accepted_on_data = false;
    }
}

/// One RTP-MIDI session endpoint.
///
/// Created closed; [`initiate_session`](Self::initiate_session) binds the
/// socket pair and starts the protocol, [`run_step`](Self::run_step) drives
/// everything thereafter, [`close_session`](Self::close_session) tears the
/// session down. A closed endpoint can be re-initiated.
pub struct RtpMidiSession {
    // ---
    session_name: String,
    is_initiator: bool,
    state: SessionState,

    /// Gates the run-step and the callback during (re)configuration.
    endpoint_locked: bool,

    ctrl_socket: Option<UdpSocket>,
    data_socket: Option<UdpSocket>,

    /// Address we were told to invite (initiator only).
    remote_ip_to_invite: Option<IpAddr>,

    /// Bound partner; cleared when the peer leaves.
    partner_ip: Option<IpAddr>,
    partner_ctrl_port: u16,
    partner_data_port: u16,

    ssrc: u32,
    initiator_token: u32,
    tx_sequence: u16,
    last_rx_sequence: u16,
    last_feedback_sequence: u16,

    invite_count: u32,
    sync_sequence_counter: u32,
    remote_timeout: i32,
    timer: EventTimer,

    /// 100 µs clock-sync counter and the decoded-event clock.
    time_counter: u32,
    local_clock: u32,

    /// TS1..TS3 of the clock exchange in progress.
    sync_timestamps: [u64; 3],
    measured_latency: u32,

    decoder: MidiDecoder,
    callback: Option<MidiEventCallback>,

    outbound_reader: MidiStreamReader,
    outbound_writer: Option<MidiStreamWriter>,

    shared: Arc<SharedState>,
    stats: SessionStats,
}

impl RtpMidiSession {
    // ---
    /// Creates a closed endpoint.
    ///
    /// # Arguments
    ///
    /// * `sysex_capacity` - Largest inbound SysEx the decoder reassembles
    /// * `callback` - Receiver for decoded MIDI events, or `None`
    pub fn new(sysex_capacity: usize, callback: Option<MidiEventCallback>) -> Self {
        // ---
        let (writer, reader) = midi_stream(DEFAULT_STREAM_CAPACITY);

        Self {
            session_name: String::new(),
            is_initiator: true,
            state: SessionState::Closed,
            endpoint_locked: true,
            ctrl_socket: None,
            data_socket: None,
            remote_ip_to_invite: None,
            partner_ip: None,
            partner_ctrl_port: 0,
            partner_data_port: 0,
            ssrc: 0,
            initiator_token: 0,
            tx_sequence: 0,
            last_rx_sequence: 0,
            last_feedback_sequence: 0,
            invite_count: 0,
            sync_sequence_counter: 0,
            remote_timeout: POST_SYNC_TIMEOUT_BUDGET,
            timer: EventTimer::new(),
            time_counter: 0,
            local_clock: 0,
            sync_timestamps: [0; 3],
            measured_latency: LATENCY_UNKNOWN,
            decoder: MidiDecoder::new(sysex_capacity),
            callback,
            outbound_reader: reader,
            outbound_writer: Some(writer),
            shared: Arc::new(SharedState::new()),
            stats: SessionStats::default(),
        }
    }

    /// Records the name sent in invitations. Must precede
    /// [`initiate_session`](Self::initiate_session).
    pub fn set_session_name(&mut self, name: &str) -> Result<(), SessionError> {
        // ---
        if name.len() > rtpmidi_common::MAX_SESSION_NAME_LEN {
            return Err(SessionError::NameTooLong { length: name.len() });
        }
        self.session_name = name.to_owned();
        Ok(())
    }

    /// Replaces the MIDI event callback.
    ///
    /// The endpoint is locked for the swap so a concurrent run-step can
    /// never observe a half-updated callback.
    pub fn set_callback(&mut self, callback: Option<MidiEventCallback>) {
        // ---
        let was_locked = self.endpoint_locked;
        self.endpoint_locked = true;
        self.callback = callback;
        self.endpoint_locked = was_locked;
    }

    /// Returns a clonable status/event view for other threads.
    pub fn handle(&self) -> SessionHandle {
        // ---
        SessionHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Detaches the producer half of the outbound MIDI stream.
    ///
    /// Returns `None` after the first call: the ring is single-producer.
    pub fn take_midi_sender(&mut self) -> Option<MidiSender> {
        // ---
        let writer = self.outbound_writer.take()?;
        Some(MidiSender {
            writer,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Queues a MIDI block for transmission (see [`MidiSender::submit`]).
    ///
    /// Returns `false` if the sender half was detached with
    /// [`take_midi_sender`](Self::take_midi_sender), the session is not
    /// opened, or the block does not fit.
    pub fn submit_midi(&mut self, block: &[u8]) -> bool {
        // ---
        if block.is_empty() {
            return true;
        }
        if self.state != SessionState::Opened {
            return false;
        }
        match self.outbound_writer.as_mut() {
            Some(writer) => writer.push(block),
            None => false,
        }
    }

    /// Coarse status: closed / inviting / syncing / opened.
    pub fn status(&self) -> SessionStatus {
        // ---
        match self.state {
            SessionState::Closed => SessionStatus::Closed,
            SessionState::Opened => SessionStatus::Opened,
            SessionState::InviteControl | SessionState::InviteData => SessionStatus::Inviting,
            _ => SessionStatus::Syncing,
        }
    }

    /// Last measured latency in 100 µs units; `None` until a sync round
    /// completes on an opened session.
    pub fn latency(&self) -> Option<u32> {
        // ---
        if self.state != SessionState::Opened || self.measured_latency == LATENCY_UNKNOWN {
            return None;
        }
        Some(self.measured_latency)
    }

    /// Actually bound (control, data) ports, once sockets exist.
    pub fn local_ports(&self) -> Option<(u16, u16)> {
        // ---
        let ctrl = self.ctrl_socket.as_ref()?.local_addr().ok()?.port();
        let data = self.data_socket.as_ref()?.local_addr().ok()?.port();
        Some((ctrl, data))
    }

    /// Traffic and decoder statistics.
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// One-shot poll: peer stopped answering keepalive syncs.
    pub fn take_connection_lost(&self) -> bool {
        self.shared.connection_lost.swap(false, Ordering::Relaxed)
    }

    /// One-shot poll: peer sent BY.
    pub fn take_peer_closed(&self) -> bool {
        self.shared.peer_closed.swap(false, Ordering::Relaxed)
    }

    /// One-shot poll: peer rejected the invitation.
    pub fn take_connection_refused(&self) -> bool {
        self.shared.connection_refused.swap(false, Ordering::Relaxed)
    }

    /// Binds the socket pair and starts the session protocol.
    ///
    /// Fresh SSRC and initiator token are drawn for every attempt. With a
    /// local data port of 0 the data socket binds to control + 1, keeping
    /// the conventional pairing even when the OS picked the control port.
    ///
    /// On failure the endpoint stays closed with no sockets bound.
    pub fn initiate_session(&mut self, config: &SessionConfig) -> Result<(), SessionError> {
        // ---
        if config.initiator && config.remote_ip.is_none() {
            return Err(SessionError::RemoteAddressRequired);
        }

        self.remote_ip_to_invite = config.remote_ip;
        self.partner_ctrl_port = config.remote_ctrl_port;
        self.partner_data_port = config.remote_data_port;

        self.initiator_token = rand::random();
        self.ssrc = rand::random();
        self.tx_sequence = 0;
        self.last_rx_sequence = 0;
        self.last_feedback_sequence = 0;
        self.sync_sequence_counter = 0;

        // Release any sockets from a previous run of this endpoint.
        self.close_sockets();

        let ctrl = bind_session_socket(config.local_ctrl_port).map_err(SessionError::ControlBind)?;
        let data_port = if config.local_data_port == 0 {
            let ctrl_port = ctrl.local_addr().map_err(SessionError::ControlBind)?.port();
            ctrl_port.wrapping_add(1)
        } else {
            config.local_data_port
        };
        let data = match bind_session_socket(data_port) {
            Ok(socket) => socket,
            Err(e) => return Err(SessionError::DataBind(e)),
        };

        info!(
            "session sockets bound: control {}, data {}",
            ctrl.local_addr().map_err(SessionError::ControlBind)?,
            data.local_addr().map_err(SessionError::DataBind)?
        );
        self.ctrl_socket = Some(ctrl);
        self.data_socket = Some(data);

        self.decoder.reset();
        self.shared.connection_lost.store(false, Ordering::Relaxed);
        self.invite_count = 0;
        self.remote_timeout = PRE_SYNC_TIMEOUT_BUDGET;
        self.measured_latency = LATENCY_UNKNOWN;
        self.is_initiator = config.initiator;

        if config.initiator {
            self.partner_ip = config.remote_ip;
            self.set_state(SessionState::InviteControl);
        } else {
            self.partner_ip = None;
            self.set_state(SessionState::WaitInviteControl);
        }
        self.timer.arm(1);

        // Unlocking must be the last step of initialization.
        self.endpoint_locked = false;
        self.sync_shared();
        Ok(())
    }

    /// Ends the session: sends BY, lingers briefly so the datagram can
    /// leave, then releases both sockets.
    ///
    /// A listener that was never invited returns silently and keeps
    /// listening. Expected to be called from a non-realtime thread (it
    /// sleeps for the linger).
    pub fn close_session(&mut self) {
        // ---
        if !self.is_initiator && self.state == SessionState::WaitInviteControl {
            return;
        }
        if self.endpoint_locked {
            return;
        }

        self.set_state(SessionState::Closed);
        self.endpoint_locked = true;
        self.send_end_session();
        std::thread::sleep(CLOSE_LINGER);
        self.close_sockets();
        self.sync_shared();
        info!("session closed");
    }

    /// Starts a fresh invitation sequence after a teardown or loss.
    /// Initiator-only; listeners return to waiting on their own.
    pub fn restart_session(&mut self) {
        // ---
        if !self.is_initiator {
            return;
        }

        self.decoder.reset();
        self.invite_count = 0;
        self.remote_timeout = PRE_SYNC_TIMEOUT_BUDGET;
        // Re-bind the partner address: a peer BY clears it, and the new
        // invitation targets the originally configured remote.
        self.partner_ip = self.remote_ip_to_invite;
        self.set_state(SessionState::InviteControl);
        self.timer.arm(INVITE_RETRY_MS);
        self.sync_shared();
    }

    /// Advances the session by one millisecond.
    ///
    /// The host calls this at a ~1 ms cadence from its timing thread. Both
    /// sockets are drained completely before any state transition or send
    /// so a burst of datagrams never costs an extra tick of latency.
    pub fn run_step(&mut self) {
        // ---
        self.time_counter = self.time_counter.wrapping_add(TICK_100US);
        self.local_clock = self.local_clock.wrapping_add(TICK_100US);

        if self.endpoint_locked {
            return;
        }
        self.stats.tick();

        let timer_event = self.timer.tick();

        // A listener whose invitation handshake stalls goes back to waiting.
        if timer_event
            && matches!(
                self.state,
                SessionState::WaitInviteData | SessionState::WaitClockSync
            )
        {
            debug!("invitation did not complete in time, listening again");
            self.set_state(SessionState::WaitInviteControl);
        }

        let mut outcome = ReceiveOutcome::default();
        loop {
            let on_ctrl = self.poll_control_socket(&mut outcome);
            let on_data = self.poll_data_socket(&mut outcome);
            if !on_ctrl && !on_data {
                break;
            }
        }

        if outcome.rejected() {
            warn!("remote endpoint rejected the invitation");
            self.partner_close_session();
            self.shared.connection_refused.store(true, Ordering::Relaxed);
            outcome.clear_accepts();
        }

        if self.is_initiator {
            self.run_initiator(&outcome, timer_event);
        }

        if self.state == SessionState::Opened {
            self.run_opened(timer_event);
        }

        self.sync_shared();
    }

    // --- receive paths -----------------------------------------------------

    /// Drains one datagram from the control socket, if any.
    ///
    /// Invitations are accepted from any source; BY only from the bound
    /// partner. Anything unparsable is dropped silently.
    fn poll_control_socket(&mut self, outcome: &mut ReceiveOutcome) -> bool {
        // ---
        let mut buf = [0u8; RECV_BUFFER_LEN];
        let Some(socket) = self.ctrl_socket.as_ref() else {
            return false;
        };
        let Some((size, sender)) = try_recv_from(socket, &mut buf) else {
            return false;
        };
        if size == 0 {
            return false;
        }

        let packet = match SessionPacket::deserialize(&buf[..size]) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("dropping control datagram from {}: {}", sender, e);
                return true;
            }
        };

        match packet {
            SessionPacket::Invitation { token, name, .. } => {
                self.handle_control_invitation(token, name.as_deref(), sender);
            }
            SessionPacket::InvitationAccepted { .. } => outcome.accepted_on_ctrl = true,
            SessionPacket::InvitationRejected { .. } => outcome.rejected_on_ctrl = true,
            SessionPacket::EndSession { .. } => {
                if Some(sender.ip()) == self.partner_ip {
                    self.partner_close_session();
                }
            }
            _ => trace!("ignoring session packet on control port"),
        }

        true
    }

    /// Drains one datagram from the data socket, if any.
    ///
    /// Everything on the data port is partner-gated: datagrams from any
    /// other address are discarded before parsing.
    fn poll_data_socket(&mut self, outcome: &mut ReceiveOutcome) -> bool {
        // ---
        let mut buf = [0u8; RECV_BUFFER_LEN];
        let Some(socket) = self.data_socket.as_ref() else {
            return false;
        };
        let Some((size, sender)) = try_recv_from(socket, &mut buf) else {
            return false;
        };
        if size == 0 {
            return false;
        }

        if Some(sender.ip()) != self.partner_ip {
            trace!("ignoring data datagram from unrelated {}", sender);
            return true;
        }
        let datagram = &buf[..size];

        if size >= 2 && datagram[0..2] == RTP_MIDI_SIGNATURE {
            if self.state == SessionState::Opened {
                self.process_incoming_rtp(datagram);
            }
            return true;
        }

        match SessionPacket::deserialize(datagram) {
            Ok(SessionPacket::ClockSync {
                count, timestamps, ..
            }) => self.handle_clock_sync(count, timestamps),
            Ok(SessionPacket::Invitation { .. }) => self.handle_data_invitation(sender),
            Ok(SessionPacket::InvitationAccepted { .. }) => outcome.accepted_on_data = true,
            Ok(SessionPacket::InvitationRejected { .. }) => outcome.rejected_on_data = true,
            Ok(SessionPacket::EndSession { .. }) => self.partner_close_session(),
            Ok(_) => trace!("ignoring session packet on data port"),
            Err(e) => trace!("dropping data datagram from {}: {}", sender, e),
        }

        true
    }

    /// Listener-side handling of an `IN` on the control port.
    fn handle_control_invitation(&mut self, token: u32, name: Option<&str>, sender: SocketAddr) {
        // ---
        if self.is_initiator {
            // An initiator never expects to be invited.
            debug!("ignoring control-port invitation from {}", sender);
            return;
        }

        if self.state == SessionState::WaitInviteControl {
            info!(
                "invited by {} ({}), accepting",
                sender,
                name.unwrap_or("unnamed")
            );
            self.initiator_token = token;
            self.set_state(SessionState::WaitInviteData);
            self.timer.arm(WAIT_DATA_INVITE_MS);
            self.send_invitation_reply(true, true, sender);
            self.partner_ip = Some(sender.ip());
            self.partner_ctrl_port = sender.port();
        } else if Some(sender.ip()) == self.partner_ip && sender.port() == self.partner_ctrl_port {
            // A repetition of the invitation we already accepted.
            self.timer.arm(WAIT_DATA_INVITE_MS);
            self.send_invitation_reply(true, true, sender);
        } else {
            debug!("rejecting invitation from {}: already have a partner", sender);
            self.send_invitation_reply(true, false, sender);
        }
    }

    /// Listener-side handling of an `IN` on the data port.
    fn handle_data_invitation(&mut self, sender: SocketAddr) {
        // ---
        if self.is_initiator {
            debug!("ignoring data-port invitation from {}", sender);
            return;
        }

        match self.state {
            SessionState::WaitInviteData => {
                self.partner_data_port = sender.port();
                self.send_invitation_reply(false, true, sender);
                self.timer.arm(WAIT_CLOCK_SYNC_MS);
                self.set_state(SessionState::WaitClockSync);
                info!("data-port invitation accepted, waiting for clock sync");
            }
            SessionState::WaitClockSync => {
                // The peer did not see our first reply; answer again.
                self.send_invitation_reply(false, true, sender);
                self.timer.arm(WAIT_CLOCK_SYNC_MS);
            }
            _ => debug!("ignoring data-port invitation in an unrelated state"),
        }
    }

    /// One leg of the three-packet clock exchange.
    ///
    /// The low 32 bits of each timestamp carry the peer's 100 µs clock;
    /// latency math happens in that truncated domain, matching the wire.
    fn handle_clock_sync(&mut self, count: u8, timestamps: [u64; 3]) {
        // ---
        match count {
            0 => {
                self.sync_timestamps[0] = timestamps[0];
                self.send_clock_sync(1, [timestamps[0], u64::from(self.time_counter), 0]);
            }
            1 => {
                self.sync_timestamps[0] = timestamps[0];
                self.sync_timestamps[1] = timestamps[1];
                self.measured_latency = self.time_counter.wrapping_sub(timestamps[0] as u32);
                self.remote_timeout = POST_SYNC_TIMEOUT_BUDGET;
                self.send_clock_sync(
                    2,
                    [timestamps[0], timestamps[1], u64::from(self.time_counter)],
                );
                self.stats.sync_rounds += 1;
                if self.is_initiator && self.state == SessionState::ClockSync1 {
                    self.remote_timeout = POST_SYNC_TIMEOUT_BUDGET;
                    self.set_state(SessionState::Opened);
                    info!(
                        "session opened, measured latency {} x100µs",
                        self.measured_latency
                    );
                }
            }
            2 => {
                self.sync_timestamps = timestamps;
                self.measured_latency = self.time_counter.wrapping_sub(timestamps[1] as u32);
                self.remote_timeout = POST_SYNC_TIMEOUT_BUDGET;
                self.stats.sync_rounds += 1;
                if self.state != SessionState::Opened {
                    info!(
                        "session opened, measured latency {} x100µs",
                        self.measured_latency
                    );
                }
                self.set_state(SessionState::Opened);
            }
            other => trace!("ignoring clock sync with count {}", other),
        }
    }

    /// Decodes one inbound RTP-MIDI packet into host callback events.
    fn process_incoming_rtp(&mut self, datagram: &[u8]) {
        // ---
        let packet = match RtpMidiPacket::deserialize(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("dropping RTP-MIDI datagram: {}", e);
                return;
            }
        };

        self.last_rx_sequence = packet.sequence;
        self.stats.packets_received += 1;
        self.stats.bytes_received += datagram.len() as u64;

        let overflow_before = self.decoder.overflow_events();
        let clock = self.local_clock;

        let Self {
            decoder,
            callback,
            stats,
            ..
        } = self;
        let mut sink = |bytes: &[u8], timestamp: u32| {
            stats.events_decoded += 1;
            if bytes.first() == Some(&0xF0) {
                stats.sysex_delivered += 1;
            }
            if let Some(cb) = callback.as_mut() {
                cb(bytes, timestamp);
            }
        };
        decoder.decode_packet(&packet.midi_list, packet.first_has_delta, clock, &mut sink);

        self.stats.sysex_overflows += self.decoder.overflow_events() - overflow_before;
    }

    // --- protocol drivers --------------------------------------------------

    /// Initiator-side invitation progress, driven by this tick's receive
    /// outcome and timer.
    fn run_initiator(&mut self, outcome: &ReceiveOutcome, timer_event: bool) {
        // ---
        match self.state {
            SessionState::InviteControl => {
                self.sync_sequence_counter = 0;
                if outcome.accepted_on_ctrl {
                    self.set_state(SessionState::InviteData);
                    self.send_invitation(false);
                    self.timer.arm(DATA_INVITE_GRACE_MS);
                } else if timer_event {
                    self.send_invitation(true);
                    self.timer.arm(INVITE_RETRY_MS);
                    self.invite_count += 1;
                }
            }
            SessionState::InviteData => {
                if outcome.accepted_on_data {
                    self.set_state(SessionState::ClockSync0);
                } else if timer_event {
                    if self.invite_count > MAX_INVITE_ATTEMPTS {
                        warn!(
                            "no answer after {} invitations, starting over",
                            self.invite_count
                        );
                        self.restart_session();
                    } else {
                        self.send_invitation(false);
                        self.timer.arm(INVITE_RETRY_MS);
                        self.invite_count += 1;
                    }
                }
            }
            SessionState::ClockSync0 => {
                self.send_clock_sync(0, [u64::from(self.time_counter), 0, 0]);
                self.set_state(SessionState::ClockSync1);
            }
            _ => {}
        }
    }

    /// Opened-state duties: flush queued MIDI, then on timer expiry send
    /// feedback, launch the next sync round, and count down the peer.
    fn run_opened(&mut self, timer_event: bool) {
        // ---
        // The keepalive timer stays armed for the whole opened phase; if the
        // handshake consumed its last expiry, restart the chain here.
        if !timer_event && !self.timer.running {
            self.timer.arm(FAST_SYNC_PERIOD_MS);
        }

        let mut payload = Vec::new();
        if self
            .outbound_reader
            .drain_up_to(MAX_RTP_PAYLOAD, &mut payload)
            > 0
        {
            let packet = RtpMidiPacket::new(self.tx_sequence, self.time_counter, self.ssrc, payload);
            self.tx_sequence = self.tx_sequence.wrapping_add(1);
            match packet.serialize() {
                Ok(bytes) => {
                    self.stats.packets_sent += 1;
                    self.stats.bytes_sent += bytes.len() as u64;
                    self.send_to_partner_data(&bytes);
                }
                Err(e) => warn!("failed to serialize outbound RTP-MIDI packet: {}", e),
            }
        }

        if timer_event {
            // Acknowledge received data, but never send RS when nothing has
            // arrived: Apple's driver crashes on an unsolicited RS.
            if self.last_rx_sequence != self.last_feedback_sequence {
                self.send_feedback(self.last_rx_sequence);
                self.last_feedback_sequence = self.last_rx_sequence;
                self.stats.feedback_sent += 1;
            }

            if self.is_initiator {
                self.send_clock_sync(0, [u64::from(self.time_counter), 0, 0]);
            }

            if self.sync_sequence_counter <= FAST_SYNC_ROUNDS {
                self.timer.arm(FAST_SYNC_PERIOD_MS);
                self.sync_sequence_counter += 1;
            } else {
                self.timer.arm(SLOW_SYNC_PERIOD_MS);
            }

            if self.remote_timeout > 0 {
                self.remote_timeout -= 1;
            }
        }

        if self.remote_timeout == 0 {
            warn!("remote endpoint stopped answering, connection lost");
            self.shared.connection_lost.store(true, Ordering::Relaxed);
            if self.is_initiator {
                self.remote_timeout = POST_SYNC_TIMEOUT_BUDGET;
                self.restart_session();
            } else {
                self.set_state(SessionState::WaitInviteControl);
            }
        }
    }

    /// The peer asked to close (BY) or refused us (NO).
    fn partner_close_session(&mut self) {
        // ---
        self.timer.cancel();
        if self.is_initiator {
            self.set_state(SessionState::Closed);
        } else {
            self.set_state(SessionState::WaitInviteControl);
        }
        self.shared.peer_closed.store(true, Ordering::Relaxed);
        self.partner_ip = None;
        info!("session ended by remote peer");
    }

    // --- send paths --------------------------------------------------------

    fn send_session_packet(&self, packet: &SessionPacket, on_control: bool, dest: SocketAddr) {
        // ---
        let socket = if on_control {
            self.ctrl_socket.as_ref()
        } else {
            self.data_socket.as_ref()
        };
        let Some(socket) = socket else {
            return;
        };
        match packet.serialize() {
            Ok(bytes) => send_datagram(socket, &bytes, dest),
            Err(e) => warn!("failed to serialize session packet: {}", e),
        }
    }

    /// Sends `IN` to the configured remote, on control or data.
    fn send_invitation(&mut self, to_control: bool) {
        // ---
        let Some(ip) = self.remote_ip_to_invite else {
            return;
        };
        let name = (!self.session_name.is_empty()).then(|| self.session_name.clone());
        let packet = SessionPacket::Invitation {
            token: self.initiator_token,
            ssrc: self.ssrc,
            name,
        };
        let port = if to_control {
            self.partner_ctrl_port
        } else {
            self.partner_data_port
        };
        self.send_session_packet(&packet, to_control, SocketAddr::new(ip, port));
        self.stats.invitations_sent += 1;
    }

    /// Answers an invitation with `OK` or `NO`, back to where it came from.
    fn send_invitation_reply(&self, on_control: bool, accept: bool, dest: SocketAddr) {
        // ---
        let packet = if accept {
            SessionPacket::InvitationAccepted {
                token: self.initiator_token,
                ssrc: self.ssrc,
                name: None,
            }
        } else {
            SessionPacket::InvitationRejected {
                token: self.initiator_token,
                ssrc: self.ssrc,
            }
        };
        self.send_session_packet(&packet, on_control, dest);
    }

    /// Sends one `CK` leg to the partner's data port.
    fn send_clock_sync(&self, count: u8, timestamps: [u64; 3]) {
        // ---
        let Some(ip) = self.partner_ip else {
            return;
        };
        let packet = SessionPacket::ClockSync {
            ssrc: self.ssrc,
            count,
            timestamps,
        };
        self.send_session_packet(&packet, false, SocketAddr::new(ip, self.partner_data_port));
    }

    /// Sends `RS` with the highest received sequence to the partner's
    /// control port.
    fn send_feedback(&self, sequence: u16) {
        // ---
        let Some(ip) = self.partner_ip else {
            return;
        };
        let packet = SessionPacket::ReceiverFeedback {
            ssrc: self.ssrc,
            sequence,
        };
        self.send_session_packet(&packet, true, SocketAddr::new(ip, self.partner_ctrl_port));
    }

    /// Sends `BY` to the partner's control port.
    fn send_end_session(&self) {
        // ---
        let Some(ip) = self.partner_ip else {
            return;
        };
        let packet = SessionPacket::EndSession {
            token: self.initiator_token,
            ssrc: self.ssrc,
        };
        self.send_session_packet(&packet, true, SocketAddr::new(ip, self.partner_ctrl_port));
    }

    fn send_to_partner_data(&self, bytes: &[u8]) {
        // ---
        let (Some(socket), Some(ip)) = (self.data_socket.as_ref(), self.partner_ip) else {
            return;
        };
        send_datagram(socket, bytes, SocketAddr::new(ip, self.partner_data_port));
    }

    // --- bookkeeping -------------------------------------------------------

    fn set_state(&mut self, next: SessionState) {
        // ---
        if next != self.state {
            debug!("session state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Publishes status and latency for the handle side.
    fn sync_shared(&self) {
        // ---
        self.shared
            .status
            .store(self.status() as u8, Ordering::Relaxed);
        let latency = if self.state == SessionState::Opened {
            self.measured_latency
        } else {
            LATENCY_UNKNOWN
        };
        self.shared.latency.store(latency, Ordering::Relaxed);
    }

    fn close_sockets(&mut self) {
        // ---
        self.ctrl_socket = None;
        self.data_socket = None;
    }
}

impl Drop for RtpMidiSession {
    fn drop(&mut self) {
        // ---
        self.close_session();
        self.close_sockets();
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_new_session_is_closed() {
        // ---
        let session = RtpMidiSession::new(512, None);
        assert_eq!(session.status(), SessionStatus::Closed);
        assert_eq!(session.latency(), None);
        assert_eq!(session.local_ports(), None);
    }

    #[test]
    fn test_session_name_length_limit() {
        // ---
        let mut session = RtpMidiSession::new(512, None);
        assert!(session.set_session_name("Studio A").is_ok());
        assert!(matches!(
            session.set_session_name(&"x".repeat(64)),
            Err(SessionError::NameTooLong { length: 64 })
        ));
    }

    #[test]
    fn test_submit_rejected_when_not_opened() {
        // ---
        let mut session = RtpMidiSession::new(512, None);
        assert!(!session.submit_midi(&[0x90, 0x40, 0x7F]));
        // Empty blocks are trivially accepted, as in the original API.
        assert!(session.submit_midi(&[]));
    }

    #[test]
    fn test_listener_initiation_binds_paired_ports() {
        // ---
        let mut session = RtpMidiSession::new(512, None);
        session
            .initiate_session(&SessionConfig::listener(0))
            .expect("initiation failed");

        assert_eq!(session.status(), SessionStatus::Syncing);
        let (ctrl, data) = session.local_ports().expect("sockets missing");
        assert_eq!(data, ctrl.wrapping_add(1));
    }

    #[test]
    fn test_control_bind_conflict_reported() {
        // ---
        let blocker =
            std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).expect("bind failed");
        let port = blocker.local_addr().unwrap().port();

        let mut session = RtpMidiSession::new(512, None);
        let mut config = SessionConfig::listener(port);
        config.local_data_port = port.wrapping_add(1);

        match session.initiate_session(&config) {
            Err(SessionError::ControlBind(_)) => {}
            other => panic!("expected control bind failure, got {:?}", other.err()),
        }
        assert_eq!(session.status(), SessionStatus::Closed);
    }

    #[test]
    fn test_initiator_requires_remote_address() {
        // ---
        let mut session = RtpMidiSession::new(512, None);
        let mut config = SessionConfig::listener(0);
        config.initiator = true;

        assert!(matches!(
            session.initiate_session(&config),
            Err(SessionError::RemoteAddressRequired)
        ));
    }

    #[test]
    fn test_close_is_silent_for_idle_listener() {
        // ---
        let mut session = RtpMidiSession::new(512, None);
        session
            .initiate_session(&SessionConfig::listener(0))
            .expect("initiation failed");

        // A listener that was never invited keeps listening.
        session.close_session();
        assert_eq!(session.status(), SessionStatus::Syncing);
        assert!(session.local_ports().is_some());
    }

    #[test]
    fn test_midi_sender_detaches_once() {
        // ---
        let mut session = RtpMidiSession::new(512, None);
        assert!(session.take_midi_sender().is_some());
        assert!(session.take_midi_sender().is_none());
        assert!(!session.submit_midi(&[0xF8]));
    }

    #[test]
    fn test_event_timer_counts_milliseconds() {
        // ---
        let mut timer = EventTimer::new();
        assert!(!timer.tick());

        timer.arm(3);
        assert!(!timer.tick());
        assert!(!timer.tick());
        assert!(timer.tick());
        assert!(!timer.tick());

        timer.arm(1);
        assert!(timer.tick());

        timer.arm(5);
        timer.cancel();
        assert!(!timer.tick());
    }

    #[test]
    fn test_handle_reflects_status() {
        // ---
        let mut session = RtpMidiSession::new(512, None);
        let handle = session.handle();
        assert_eq!(handle.status(), SessionStatus::Closed);

        session
            .initiate_session(&SessionConfig::listener(0))
            .expect("initiation failed");
        assert_eq!(handle.status(), SessionStatus::Syncing);
        assert_eq!(handle.latency(), None);
    }
}
