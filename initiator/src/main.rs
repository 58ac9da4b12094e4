//! RTP-MIDI session initiator.
//!
//! Invites a remote listener, drives the session at a 1 ms cadence, logs
//! every decoded MIDI event, and can stream a repeating test melody to
//! verify the path end to end.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use rtpmidi_common::{encode_delta_time, init_tracing};
use rtpmidi_endpoint::{
    MidiEventCallback, RtpMidiSession, SessionConfig, SessionStatus, DEFAULT_SYSEX_CAPACITY,
};

/// RTP-MIDI Initiator - invite a remote endpoint and exchange MIDI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Remote IP address to invite
    #[arg(short, long)]
    remote: std::net::IpAddr,

    /// Remote control port (the data port is control + 1)
    #[arg(short, long, default_value = "5004")]
    port: u16,

    /// Local control port (0 = OS-assigned; data binds control + 1)
    #[arg(long, default_value = "0")]
    local_port: u16,

    /// Session name sent with the invitation
    #[arg(short, long, default_value = "rtpmidi-rs")]
    name: String,

    /// Stream a repeating test melody once the session opens
    #[arg(long)]
    test_notes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing()?;

    let args = Args::parse();
    info!("Starting RTP-MIDI initiator");
    info!(
        "Remote endpoint: {} control {}, data {}",
        args.remote,
        args.port,
        args.port.wrapping_add(1)
    );

    let callback: MidiEventCallback = Box::new(|bytes, timestamp| {
        info!("MIDI in @{}: {:02X?}", timestamp, bytes);
    });

    let mut session = RtpMidiSession::new(DEFAULT_SYSEX_CAPACITY, Some(callback));
    session
        .set_session_name(&args.name)
        .context("invalid session name")?;

    let mut config = SessionConfig::initiator(args.remote, args.port);
    config.local_ctrl_port = args.local_port;
    session
        .initiate_session(&config)
        .context("failed to start session")?;
    info!("Session '{}' inviting {}", args.name, args.remote);

    drive_session(&mut session, args.test_notes).await;

    session.close_session();
    session.stats().log();
    Ok(())
}

/// Runs the 1 ms tick loop until Ctrl-C.
async fn drive_session(session: &mut RtpMidiSession, test_notes: bool) {
    // ---
    let mut ticker = tokio::time::interval(Duration::from_millis(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut melody = TestMelody::new();
    let mut was_opened = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                session.run_step();

                if session.take_connection_refused() {
                    warn!("invitation refused by remote endpoint");
                }
                if session.take_peer_closed() {
                    warn!("remote endpoint closed the session");
                }
                if session.take_connection_lost() {
                    warn!("connection lost, re-inviting");
                }

                let opened = session.status() == SessionStatus::Opened;
                if opened && !was_opened {
                    info!(
                        "session opened, latency {:?} x100µs",
                        session.latency()
                    );
                }
                was_opened = opened;

                if opened && test_notes {
                    melody.tick(session);
                }
            }
            _ = &mut ctrl_c => {
                info!("shutting down");
                break;
            }
        }
    }
}

/// Cycles through one octave of C major, one note every half second.
struct TestMelody {
    // ---
    ticks: u32,
    step: usize,
}

impl TestMelody {
    // ---
    const NOTES: [u8; 8] = [60, 62, 64, 65, 67, 69, 71, 72];

    fn new() -> Self {
        Self { ticks: 0, step: 0 }
    }

    fn tick(&mut self, session: &mut RtpMidiSession) {
        // ---
        self.ticks += 1;
        if self.ticks % 500 != 0 {
            return;
        }

        let previous = Self::NOTES[self.step];
        self.step = (self.step + 1) % Self::NOTES.len();
        let next = Self::NOTES[self.step];

        // One block: note-off, a zero delta-time, note-on.
        let mut block = vec![0x80, previous, 0x00];
        encode_delta_time(0, &mut block);
        block.extend_from_slice(&[0x90, next, 0x64]);

        if !session.submit_midi(&block) {
            warn!("MIDI queue full, dropping test notes");
        }
    }
}
