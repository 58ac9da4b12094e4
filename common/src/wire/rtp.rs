//! RTP-MIDI data packet structure and serialization.
//!
//! Implements the RTP framing used by Apple's driver: a fixed 12-byte RTP
//! header with payload type `0x61` and the marker bit set, followed by the
//! RFC 6295 MIDI payload header (short or long form) and the MIDI command
//! list. The optional recovery journal is never generated and is ignored on
//! reception: the command-list length field bounds everything we read.

use anyhow::Result;

/// First two RTP header bytes: V=2, P=0, X=0, CC=0, M=1, PT=0x61.
pub const RTP_MIDI_SIGNATURE: [u8; 2] = [0x80, 0x61];

/// Fixed RTP header length preceding the MIDI payload.
const RTP_HEADER_LEN: usize = 12;

/// Cap applied to a single outbound MIDI command list.
pub const MAX_RTP_PAYLOAD: usize = 1024;

/// Longest command list a long-form (12-bit length) payload can carry.
pub const MAX_LONG_MIDI_LIST: usize = 4095;

/// Longest command list a short-form (4-bit length) payload can carry.
pub const MAX_SHORT_MIDI_LIST: usize = 15;

// Long-form payload header flag bits (big-endian 16-bit word). The J bit
// (0x4000) would announce a journal; it is neither set nor honored here.
const LONG_B_BIT: u16 = 0x8000;
const LONG_Z_BIT: u16 = 0x2000;
const LONG_P_BIT: u16 = 0x1000;

// Short-form payload header flag bits.
const SHORT_Z_BIT: u8 = 0x20;
const SHORT_P_BIT: u8 = 0x10;

/// RTP-MIDI packet for MIDI command-list transmission.
///
/// # Protocol Details
///
/// - Sequence: increments by 1 for each packet, wrapping at 65535
/// - Timestamp: 100 µs units, sampled from the sender's session clock
/// - SSRC: synchronization source identifier (random per session)
/// - `first_has_delta` (`Z`): the command list opens with a delta-time
/// - `phantom_status` (`P`): the first command's status byte was elided
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMidiPacket {
    // ---
    /// Packet sequence number (wraps at 65535)
    pub sequence: u16,

    /// RTP timestamp in 100 µs units
    pub timestamp: u32,

    /// Synchronization source identifier
    pub ssrc: u32,

    /// `Z` bit: a delta-time precedes the first MIDI command
    pub first_has_delta: bool,

    /// `P` bit: the first command relies on the receiver's running status
    pub phantom_status: bool,

    /// MIDI command list (no payload header, no journal)
    pub midi_list: Vec<u8>,
}

impl RtpMidiPacket {
    // ---
    /// Creates a new outbound packet; `Z` and `P` are always clear on send.
    pub fn new(sequence: u16, timestamp: u32, ssrc: u32, midi_list: Vec<u8>) -> Self {
        // ---
        Self {
            sequence,
            timestamp,
            ssrc,
            first_has_delta: false,
            phantom_status: false,
            midi_list,
        }
    }

    /// Serializes the packet into wire format.
    ///
    /// Always emits the long payload header (`B=1`) with `J=0`, matching
    /// what Apple's driver sends; `Z` and `P` are taken from the packet.
    ///
    /// # Errors
    ///
    /// Returns error if the command list exceeds the long form's 12-bit
    /// length field.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        // ---
        if self.midi_list.len() > MAX_LONG_MIDI_LIST {
            anyhow::bail!("MIDI list too long: {} bytes", self.midi_list.len());
        }

        let mut buf = Vec::with_capacity(RTP_HEADER_LEN + 2 + self.midi_list.len());

        buf.extend_from_slice(&RTP_MIDI_SIGNATURE);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());

        let mut control = self.midi_list.len() as u16 | LONG_B_BIT;
        if self.first_has_delta {
            control |= LONG_Z_BIT;
        }
        if self.phantom_status {
            control |= LONG_P_BIT;
        }
        buf.extend_from_slice(&control.to_be_bytes());
        buf.extend_from_slice(&self.midi_list);

        Ok(buf)
    }

    /// Deserializes an RTP-MIDI packet from a received datagram.
    ///
    /// Accepts both payload header forms. Bytes beyond the command list
    /// (a journal, when `J=1`) are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The datagram is smaller than header + payload header
    /// - The RTP signature does not match `V=2, M=1, PT=0x61`
    /// - The declared command-list length exceeds the datagram
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        // ---
        if data.len() < RTP_HEADER_LEN + 1 {
            anyhow::bail!("packet too small: {} bytes", data.len());
        }
        if data[0..2] != RTP_MIDI_SIGNATURE {
            anyhow::bail!("bad RTP-MIDI signature: {:02X} {:02X}", data[0], data[1]);
        }

        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let flags = data[RTP_HEADER_LEN];
        let (list_start, list_len, first_has_delta, phantom_status) = if flags & 0x80 != 0 {
            // B=1: two-byte payload header, 12-bit length.
            if data.len() < RTP_HEADER_LEN + 2 {
                anyhow::bail!("long payload header truncated");
            }
            let control = u16::from_be_bytes([data[RTP_HEADER_LEN], data[RTP_HEADER_LEN + 1]]);
            (
                RTP_HEADER_LEN + 2,
                usize::from(control & 0x0FFF),
                control & LONG_Z_BIT != 0,
                control & LONG_P_BIT != 0,
            )
        } else {
            // B=0: one-byte payload header, 4-bit length.
            (
                RTP_HEADER_LEN + 1,
                usize::from(flags & 0x0F),
                flags & SHORT_Z_BIT != 0,
                flags & SHORT_P_BIT != 0,
            )
        };

        if list_start + list_len > data.len() {
            anyhow::bail!(
                "declared MIDI list of {} bytes exceeds datagram of {}",
                list_len,
                data.len()
            );
        }

        Ok(Self {
            sequence,
            timestamp,
            ssrc,
            first_has_delta,
            phantom_status,
            midi_list: data[list_start..list_start + list_len].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_serialization_layout() {
        // ---
        let packet = RtpMidiPacket::new(100, 32000, 0x1234_5678, vec![0x90, 0x40, 0x7F]);
        let bytes = packet.serialize().expect("serialization failed");

        assert_eq!(bytes[0], 0x80); // V=2
        assert_eq!(bytes[1], 0x61); // M=1, PT=0x61
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 100);
        assert_eq!(u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 32000);
        // Long form, J=Z=P=0, length 3.
        assert_eq!(u16::from_be_bytes([bytes[12], bytes[13]]), 0x8003);
        assert_eq!(&bytes[14..], &[0x90, 0x40, 0x7F]);
    }

    #[test]
    fn test_roundtrip() {
        // ---
        let packet = RtpMidiPacket::new(65535, u32::MAX, 0xAABB_CCDD, vec![0xF8]);
        let bytes = packet.serialize().expect("serialization failed");

        assert_eq!(RtpMidiPacket::deserialize(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_z_bit_roundtrip() {
        // ---
        let mut packet = RtpMidiPacket::new(1, 2, 3, vec![0x00, 0xF8]);
        packet.first_has_delta = true;
        let bytes = packet.serialize().expect("serialization failed");

        let parsed = RtpMidiPacket::deserialize(&bytes).unwrap();
        assert!(parsed.first_has_delta);
        assert!(!parsed.phantom_status);
    }

    #[test]
    fn test_short_form_accepted() {
        // ---
        // Handcraft a short-form packet: one header byte, Z=0, length 2.
        let mut bytes = vec![0x80, 0x61];
        bytes.extend_from_slice(&7u16.to_be_bytes());
        bytes.extend_from_slice(&1000u32.to_be_bytes());
        bytes.extend_from_slice(&5u32.to_be_bytes());
        bytes.push(0x02);
        bytes.extend_from_slice(&[0xFE, 0xF8]);

        let parsed = RtpMidiPacket::deserialize(&bytes).unwrap();
        assert_eq!(parsed.sequence, 7);
        assert_eq!(parsed.midi_list, vec![0xFE, 0xF8]);
        assert!(!parsed.first_has_delta);
    }

    #[test]
    fn test_short_form_matches_long_form() {
        // ---
        // A 15-byte list fits either header form; both must yield the same
        // command list.
        let list: Vec<u8> = (0..15).map(|i| if i == 0 { 0x90 } else { i }).collect();

        let long = RtpMidiPacket::new(1, 2, 3, list.clone())
            .serialize()
            .unwrap();

        let mut short = long[..12].to_vec();
        short.push(list.len() as u8); // B=0, J=Z=P=0, 4-bit length
        short.extend_from_slice(&list);

        let from_long = RtpMidiPacket::deserialize(&long).unwrap();
        let from_short = RtpMidiPacket::deserialize(&short).unwrap();
        assert_eq!(from_long.midi_list, from_short.midi_list);
        assert_eq!(from_long.first_has_delta, from_short.first_has_delta);
    }

    #[test]
    fn test_journal_bytes_ignored() {
        // ---
        let packet = RtpMidiPacket::new(9, 9, 9, vec![0x90, 0x40, 0x7F]);
        let mut bytes = packet.serialize().unwrap();
        // Claim a journal follows (J bit of the long control word) and
        // append garbage; the list length field must keep the parser away.
        bytes[12] |= 0x40;
        bytes.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);

        let parsed = RtpMidiPacket::deserialize(&bytes).unwrap();
        assert_eq!(parsed.midi_list, vec![0x90, 0x40, 0x7F]);
    }

    #[test]
    fn test_rejects_undersized_and_bad_signature() {
        // ---
        assert!(RtpMidiPacket::deserialize(&[0x80, 0x61, 0x00]).is_err());

        let mut bytes = RtpMidiPacket::new(0, 0, 0, vec![]).serialize().unwrap();
        bytes[1] = 0x60; // wrong payload type / marker
        assert!(RtpMidiPacket::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_rejects_length_beyond_datagram() {
        // ---
        let mut bytes = RtpMidiPacket::new(0, 0, 0, vec![0x90, 0x40, 0x7F])
            .serialize()
            .unwrap();
        bytes.truncate(bytes.len() - 1);

        assert!(RtpMidiPacket::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_rejects_oversized_list() {
        // ---
        let packet = RtpMidiPacket::new(0, 0, 0, vec![0; MAX_LONG_MIDI_LIST + 1]);
        assert!(packet.serialize().is_err());
    }

    #[test]
    fn test_empty_list_roundtrip() {
        // ---
        let packet = RtpMidiPacket::new(3, 4, 5, Vec::new());
        let bytes = packet.serialize().expect("serialization failed");

        assert_eq!(bytes.len(), 14);
        assert_eq!(RtpMidiPacket::deserialize(&bytes).unwrap().midi_list, Vec::<u8>::new());
    }
}
