//! Statistics tracking for an RTP-MIDI session.
//!
//! Tracks traffic and decoding metrics for observability. The session is
//! tick-driven rather than wall-clock-driven, so periodic logging counts
//! run-step ticks (one per millisecond of host time).

use tracing::info;

/// Ticks between automatic stat lines (~10 s at the nominal 1 ms cadence).
const DEFAULT_LOG_INTERVAL_TICKS: u64 = 10_000;

/// Traffic and decoder statistics for one session.
///
/// Counters are cumulative over the life of the endpoint; they survive
/// session restarts so long-running hosts can track totals.
#[derive(Debug, Clone)]
pub struct SessionStats {
    // ---
    /// RTP-MIDI packets sent to the peer
    pub packets_sent: u64,

    /// Bytes of RTP-MIDI traffic sent (headers included)
    pub bytes_sent: u64,

    /// RTP-MIDI packets accepted from the peer
    pub packets_received: u64,

    /// Bytes of RTP-MIDI traffic accepted
    pub bytes_received: u64,

    /// MIDI messages delivered to the host callback
    pub events_decoded: u64,

    /// Complete SysEx transfers among the delivered messages
    pub sysex_delivered: u64,

    /// SysEx transfers that outgrew the reassembly buffer
    pub sysex_overflows: u64,

    /// Invitation packets sent while establishing sessions
    pub invitations_sent: u64,

    /// Clock-sync exchanges that produced a latency measurement
    pub sync_rounds: u64,

    /// Feedback (`RS`) packets sent
    pub feedback_sent: u64,

    ticks: u64,
    last_log_tick: u64,
    log_interval_ticks: u64,
}

impl SessionStats {
    // ---
    pub fn new(log_interval_ticks: u64) -> Self {
        // ---
        Self {
            packets_sent: 0,
            bytes_sent: 0,
            packets_received: 0,
            bytes_received: 0,
            events_decoded: 0,
            sysex_delivered: 0,
            sysex_overflows: 0,
            invitations_sent: 0,
            sync_rounds: 0,
            feedback_sent: 0,
            ticks: 0,
            last_log_tick: 0,
            log_interval_ticks,
        }
    }

    /// Advances the tick count and emits a stat line when the interval
    /// elapsed. Called once per run-step.
    pub fn tick(&mut self) {
        // ---
        self.ticks += 1;
        if self.log_interval_ticks > 0 && self.ticks - self.last_log_tick >= self.log_interval_ticks
        {
            self.log();
            self.last_log_tick = self.ticks;
        }
    }

    /// Force log current statistics.
    pub fn log(&self) {
        // ---
        info!(
            "session stats: tx {} pkts/{} B, rx {} pkts/{} B, {} events ({} sysex, {} overflows), {} sync rounds",
            self.packets_sent,
            self.bytes_sent,
            self.packets_received,
            self.bytes_received,
            self.events_decoded,
            self.sysex_delivered,
            self.sysex_overflows,
            self.sync_rounds
        );
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        // ---
        Self::new(DEFAULT_LOG_INTERVAL_TICKS)
    }
}
