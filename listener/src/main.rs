//! RTP-MIDI session listener.
//!
//! Binds the conventional port pair, waits to be invited, and logs every
//! decoded MIDI event. With `--echo`, note events are sent straight back
//! to the peer for round-trip testing.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use rtpmidi_common::init_tracing;
use rtpmidi_endpoint::{
    MidiEventCallback, RtpMidiSession, SessionConfig, SessionStatus, DEFAULT_SYSEX_CAPACITY,
};

/// RTP-MIDI Listener - wait for an invitation and exchange MIDI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Local control port (the data port binds control + 1)
    #[arg(short, long, default_value = "5004")]
    port: u16,

    /// Session name
    #[arg(short, long, default_value = "rtpmidi-rs listener")]
    name: String,

    /// Echo received note-on events back to the peer
    #[arg(long)]
    echo: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing()?;

    let args = Args::parse();
    info!("Starting RTP-MIDI listener");

    let mut session = RtpMidiSession::new(DEFAULT_SYSEX_CAPACITY, None);
    session
        .set_session_name(&args.name)
        .context("invalid session name")?;

    // The callback runs on the tick thread; the detached sender lets it
    // push the echo without touching the session itself.
    let mut echo_sender = session
        .take_midi_sender()
        .context("MIDI sender already taken")?;
    let echo = args.echo;
    let callback: MidiEventCallback = Box::new(move |bytes, timestamp| {
        info!("MIDI in @{}: {:02X?}", timestamp, bytes);
        // Echo note-ons only: one block per tick keeps the outgoing frame a
        // valid command list without inter-block delta-times.
        let is_note_on =
            bytes.len() == 3 && bytes[0] & 0xF0 == 0x90 && bytes[2] > 0;
        if echo && is_note_on && !echo_sender.submit(bytes) {
            warn!("echo queue full, dropping event");
        }
    });
    session.set_callback(Some(callback));

    session
        .initiate_session(&SessionConfig::listener(args.port))
        .context("failed to start session")?;
    let (ctrl, data) = session.local_ports().context("sockets missing")?;
    info!("Session '{}' listening on control {}, data {}", args.name, ctrl, data);

    drive_session(&mut session).await;

    session.close_session();
    session.stats().log();
    Ok(())
}

/// Runs the 1 ms tick loop until Ctrl-C.
async fn drive_session(session: &mut RtpMidiSession) {
    // ---
    let mut ticker = tokio::time::interval(Duration::from_millis(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut last_status = session.status();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                session.run_step();

                if session.take_peer_closed() {
                    info!("peer left, waiting for the next invitation");
                }
                if session.take_connection_lost() {
                    warn!("peer stopped answering, waiting for the next invitation");
                }

                let status = session.status();
                if status != last_status {
                    match status {
                        SessionStatus::Opened => info!(
                            "session opened, latency {:?} x100µs",
                            session.latency()
                        ),
                        SessionStatus::Syncing => info!("handshake in progress"),
                        _ => {}
                    }
                    last_status = status;
                }
            }
            _ = &mut ctrl_c => {
                info!("shutting down");
                break;
            }
        }
    }
}
