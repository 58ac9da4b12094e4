//! AppleMIDI session-control packet codec.
//!
//! Session-control datagrams share a fixed two-byte `0xFF 0xFF` preamble
//! followed by a two-ASCII-byte command. Six commands exist:
//!
//! | Cmd  | Meaning                    | Body                                   |
//! |------|----------------------------|----------------------------------------|
//! | `IN` | invitation                 | version, token, SSRC, optional name    |
//! | `OK` | invitation accepted        | version, token, SSRC, optional name    |
//! | `NO` | invitation rejected        | version, token, SSRC                   |
//! | `BY` | end of session             | version, token, SSRC                   |
//! | `CK` | clock synchronization      | SSRC, count, 3 pad bytes, 3 timestamps |
//! | `RS` | receiver feedback          | SSRC, sequence, 2 pad bytes            |

use anyhow::Result;

/// Preamble identifying a session-control datagram.
pub const SESSION_SIGNATURE: [u8; 2] = [0xFF, 0xFF];

/// AppleMIDI protocol version carried in invitation-family packets.
pub const PROTOCOL_VERSION: u32 = 2;

/// Longest accepted session name, in bytes, excluding the NUL terminator.
pub const MAX_SESSION_NAME_LEN: usize = 63;

/// Body length of the invitation family without a name.
const INVITATION_BASE_LEN: usize = 16;

/// Total length of a `CK` packet.
const CLOCK_SYNC_LEN: usize = 36;

/// Total length of an `RS` packet.
const FEEDBACK_LEN: usize = 12;

/// A parsed session-control packet.
///
/// The three clock-sync timestamps are modeled as `u64`s; their big-endian
/// encoding is bit-identical to the H/L 32-bit pairs the protocol describes.
/// Only the low 32 bits are meaningful to this implementation's 100 µs
/// clock, but peers may fill all 64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPacket {
    // ---
    /// `IN` — invite the receiver into a session.
    Invitation {
        token: u32,
        ssrc: u32,
        name: Option<String>,
    },

    /// `OK` — the invitation was accepted.
    InvitationAccepted {
        token: u32,
        ssrc: u32,
        name: Option<String>,
    },

    /// `NO` — the invitation was rejected.
    InvitationRejected { token: u32, ssrc: u32 },

    /// `BY` — the sender is leaving the session.
    EndSession { token: u32, ssrc: u32 },

    /// `CK` — one leg of the three-packet clock exchange.
    ClockSync {
        ssrc: u32,
        count: u8,
        timestamps: [u64; 3],
    },

    /// `RS` — acknowledgement of the highest received RTP sequence.
    ReceiverFeedback { ssrc: u32, sequence: u16 },
}

impl SessionPacket {
    // ---
    /// Serializes the packet into wire format.
    ///
    /// A `None` or empty name is omitted entirely from the datagram; a
    /// present name is written with its NUL terminator.
    ///
    /// # Errors
    ///
    /// Returns error if the name exceeds [`MAX_SESSION_NAME_LEN`] bytes.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        // ---
        let mut buf = Vec::with_capacity(CLOCK_SYNC_LEN + MAX_SESSION_NAME_LEN);
        buf.extend_from_slice(&SESSION_SIGNATURE);

        match self {
            SessionPacket::Invitation { token, ssrc, name } => {
                buf.extend_from_slice(b"IN");
                write_invitation_body(&mut buf, *token, *ssrc, name.as_deref())?;
            }
            SessionPacket::InvitationAccepted { token, ssrc, name } => {
                buf.extend_from_slice(b"OK");
                write_invitation_body(&mut buf, *token, *ssrc, name.as_deref())?;
            }
            SessionPacket::InvitationRejected { token, ssrc } => {
                buf.extend_from_slice(b"NO");
                write_invitation_body(&mut buf, *token, *ssrc, None)?;
            }
            SessionPacket::EndSession { token, ssrc } => {
                buf.extend_from_slice(b"BY");
                write_invitation_body(&mut buf, *token, *ssrc, None)?;
            }
            SessionPacket::ClockSync {
                ssrc,
                count,
                timestamps,
            } => {
                buf.extend_from_slice(b"CK");
                buf.extend_from_slice(&ssrc.to_be_bytes());
                buf.push(*count);
                buf.extend_from_slice(&[0, 0, 0]);
                for ts in timestamps {
                    buf.extend_from_slice(&ts.to_be_bytes());
                }
            }
            SessionPacket::ReceiverFeedback { ssrc, sequence } => {
                buf.extend_from_slice(b"RS");
                buf.extend_from_slice(&ssrc.to_be_bytes());
                buf.extend_from_slice(&sequence.to_be_bytes());
                buf.extend_from_slice(&[0, 0]);
            }
        }

        Ok(buf)
    }

    /// Deserializes a session-control packet from a received datagram.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The datagram is shorter than the command's fixed body
    /// - The preamble is not `0xFF 0xFF`
    /// - The command is not one of the six known commands
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        // ---
        if data.len() < 4 {
            anyhow::bail!("datagram too small for a session command: {} bytes", data.len());
        }
        if data[0..2] != SESSION_SIGNATURE {
            anyhow::bail!("bad session preamble: {:02X} {:02X}", data[0], data[1]);
        }

        let command = [data[2], data[3]];
        match &command {
            b"IN" => {
                let (token, ssrc, name) = read_invitation_body(data)?;
                Ok(SessionPacket::Invitation { token, ssrc, name })
            }
            b"OK" => {
                let (token, ssrc, name) = read_invitation_body(data)?;
                Ok(SessionPacket::InvitationAccepted { token, ssrc, name })
            }
            b"NO" => {
                let (token, ssrc, _) = read_invitation_body(data)?;
                Ok(SessionPacket::InvitationRejected { token, ssrc })
            }
            b"BY" => {
                let (token, ssrc, _) = read_invitation_body(data)?;
                Ok(SessionPacket::EndSession { token, ssrc })
            }
            b"CK" => {
                if data.len() < CLOCK_SYNC_LEN {
                    anyhow::bail!("CK packet too small: {} bytes", data.len());
                }
                let ssrc = read_u32(data, 4);
                let count = data[8];
                let timestamps = [
                    read_u64(data, 12),
                    read_u64(data, 20),
                    read_u64(data, 28),
                ];
                Ok(SessionPacket::ClockSync {
                    ssrc,
                    count,
                    timestamps,
                })
            }
            b"RS" => {
                if data.len() < FEEDBACK_LEN {
                    anyhow::bail!("RS packet too small: {} bytes", data.len());
                }
                Ok(SessionPacket::ReceiverFeedback {
                    ssrc: read_u32(data, 4),
                    sequence: read_u16(data, 8),
                })
            }
            other => anyhow::bail!("unknown session command: {:02X} {:02X}", other[0], other[1]),
        }
    }
}

/// Writes `version | token | ssrc [| name NUL]` after the command bytes.
fn write_invitation_body(buf: &mut Vec<u8>, token: u32, ssrc: u32, name: Option<&str>) -> Result<()> {
    // ---
    buf.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    buf.extend_from_slice(&token.to_be_bytes());
    buf.extend_from_slice(&ssrc.to_be_bytes());

    if let Some(name) = name.filter(|n| !n.is_empty()) {
        if name.len() > MAX_SESSION_NAME_LEN {
            anyhow::bail!("session name too long: {} bytes", name.len());
        }
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
    }

    Ok(())
}

/// Reads the invitation-family body, tolerating an unterminated name.
fn read_invitation_body(data: &[u8]) -> Result<(u32, u32, Option<String>)> {
    // ---
    if data.len() < INVITATION_BASE_LEN {
        anyhow::bail!("invitation packet too small: {} bytes", data.len());
    }

    // Protocol version at offset 4 is carried but not validated; Apple's
    // driver ignores it as well.
    let token = read_u32(data, 8);
    let ssrc = read_u32(data, 12);

    let name_bytes = &data[INVITATION_BASE_LEN..];
    let name = if name_bytes.is_empty() {
        None
    } else {
        let end = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name_bytes.len());
        Some(String::from_utf8_lossy(&name_bytes[..end]).into_owned())
    };

    Ok((token, ssrc, name))
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}
