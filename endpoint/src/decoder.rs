//! Stateful decoder turning RTP-MIDI command lists into MIDI messages.
//!
//! The decoder survives packet boundaries: running status, a half-received
//! three-byte command, and an in-flight segmented SysEx all carry over from
//! one payload to the next. System Real Time bytes are surfaced immediately
//! even when they arrive inside a SysEx segment.

use rtpmidi_common::read_delta_time;

/// Default capacity for the SysEx reassembly buffer.
pub const DEFAULT_SYSEX_CAPACITY: usize = 512;

pub(crate) struct MidiDecoder {
    // ---
    /// Last channel/system-common status seen; 0 when none applies.
    running_status: u8,

    /// First data byte of a pending three-byte command.
    pending_data: u8,

    /// A three-byte command is waiting for its final data byte.
    awaiting_third_byte: bool,

    /// A SysEx transfer is in progress (possibly across packets).
    in_sysex: bool,

    /// The current payload carries more bytes of that transfer.
    segmenting: bool,

    /// Reassembly buffer, bounded by `sysex_capacity`.
    sysex_buf: Vec<u8>,
    sysex_capacity: usize,

    /// Latched when the transfer outgrew the buffer; cleared on reset.
    sysex_overflow: bool,

    /// Total transfers that overflowed, for statistics.
    overflow_events: u64,
}

impl MidiDecoder {
    // ---
    pub fn new(sysex_capacity: usize) -> Self {
        // ---
        Self {
            running_status: 0,
            pending_data: 0,
            awaiting_third_byte: false,
            in_sysex: false,
            segmenting: false,
            sysex_buf: Vec::with_capacity(sysex_capacity),
            sysex_capacity,
            sysex_overflow: false,
            overflow_events: 0,
        }
    }

    /// Clears all carried stream state; used when a session (re)starts.
    pub fn reset(&mut self) {
        // ---
        self.running_status = 0;
        self.awaiting_third_byte = false;
        self.reset_sysex();
    }

    /// Number of SysEx transfers that exceeded the buffer so far.
    pub fn overflow_events(&self) -> u64 {
        self.overflow_events
    }

    /// Decodes one payload's MIDI command list.
    ///
    /// `first_has_delta` is the payload header's `Z` bit. Every delivered
    /// message is stamped `local_clock + delta` in 100 µs units, where
    /// `delta` is the command's own delta-time (zero for a bare first
    /// command).
    pub fn decode_packet(
        &mut self,
        midi_list: &[u8],
        first_has_delta: bool,
        local_clock: u32,
        emit: &mut dyn FnMut(&[u8], u32),
    ) {
        // ---
        let mut cursor = 0usize;

        let mut delta = 0;
        if first_has_delta {
            delta = read_delta_time(midi_list, &mut cursor);
        }
        // The final command slot of a list may be empty.
        if cursor < midi_list.len() {
            self.decode_command(midi_list, &mut cursor, local_clock.wrapping_add(delta), emit);
        }

        while cursor < midi_list.len() {
            delta = read_delta_time(midi_list, &mut cursor);
            if cursor < midi_list.len() {
                self.decode_command(midi_list, &mut cursor, local_clock.wrapping_add(delta), emit);
            }
        }
    }

    /// Consumes bytes until one complete message is delivered or the list
    /// ends, mirroring one command slot of the payload.
    fn decode_command(
        &mut self,
        list: &[u8],
        cursor: &mut usize,
        timestamp: u32,
        emit: &mut dyn FnMut(&[u8], u32),
    ) {
        // ---
        while *cursor < list.len() {
            let byte = list[*cursor];
            *cursor += 1;

            // SysEx handling comes first: inside a transfer most bytes never
            // reach the plain command parser.
            if byte == 0xF0 && !self.in_sysex {
                self.in_sysex = true;
                self.segmenting = true;
                self.store_sysex(0xF0);
                continue;
            }

            if self.in_sysex {
                if byte == 0xF0 {
                    // End-of-segment marker: the transfer continues in a
                    // later packet.
                    self.segmenting = false;
                    continue;
                }

                if byte == 0xF7 {
                    if self.segmenting {
                        self.store_sysex(0xF7);
                        emit(&self.sysex_buf, timestamp);
                        self.reset_sysex();
                        return;
                    }
                    // Start-of-segment marker: resume the transfer, the
                    // marker itself is not part of the message.
                    self.segmenting = true;
                    continue;
                }

                if byte == 0xF4 {
                    // Cancellation: discard everything collected so far.
                    self.reset_sysex();
                    return;
                }

                if self.segmenting {
                    if byte < 0x80 {
                        self.store_sysex(byte);
                        continue;
                    }

                    if byte >= 0xF8 {
                        // Real Time interleaved inside the SysEx.
                        emit(&[byte], timestamp);
                        continue;
                    }

                    // Any other status inside a segment: the SysEx is
                    // corrupted. Drop it and reprocess this byte normally.
                    self.reset_sysex();
                }
            }

            if byte & 0x80 != 0 {
                if byte >= 0xF8 {
                    // System Real Time never touches running status.
                    emit(&[byte], timestamp);
                    return;
                }

                self.running_status = byte;
                self.awaiting_third_byte = false;

                if byte == 0xF6 {
                    // Tune Request is complete by itself.
                    emit(&[0xF6], timestamp);
                    self.running_status = 0;
                    return;
                }
                continue;
            }

            // Data byte: complete a command under the current running status.
            if self.awaiting_third_byte {
                self.awaiting_third_byte = false;
                let status = self.running_status;
                emit(&[status, self.pending_data, byte], timestamp);
                if status == 0xF2 {
                    // Song Position Pointer is one-shot.
                    self.running_status = 0;
                }
                return;
            }

            match self.running_status {
                0 => return, // no status to attach the byte to
                0x80..=0xBF | 0xE0..=0xEF | 0xF2 => {
                    self.pending_data = byte;
                    self.awaiting_third_byte = true;
                    continue;
                }
                0xC0..=0xDF => {
                    emit(&[self.running_status, byte], timestamp);
                    return;
                }
                0xF1 | 0xF3 => {
                    emit(&[self.running_status, byte], timestamp);
                    self.running_status = 0;
                    return;
                }
                _ => {
                    // A data byte under F4/F5/F7: nothing sensible to build.
                    self.running_status = 0;
                    return;
                }
            }
        }
    }

    fn store_sysex(&mut self, byte: u8) {
        // ---
        if self.sysex_buf.len() < self.sysex_capacity {
            self.sysex_buf.push(byte);
        } else if !self.sysex_overflow {
            self.sysex_overflow = true;
            self.overflow_events += 1;
        }
    }

    fn reset_sysex(&mut self) {
        // ---
        self.sysex_buf.clear();
        self.in_sysex = false;
        self.segmenting = false;
        self.sysex_overflow = false;
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use rtpmidi_common::encode_delta_time;

    /// Runs one payload through a fresh decoder and collects the output.
    fn decode(list: &[u8], first_has_delta: bool) -> Vec<(Vec<u8>, u32)> {
        // ---
        let mut decoder = MidiDecoder::new(DEFAULT_SYSEX_CAPACITY);
        decode_with(&mut decoder, list, first_has_delta, 0)
    }

    fn decode_with(
        decoder: &mut MidiDecoder,
        list: &[u8],
        first_has_delta: bool,
        local_clock: u32,
    ) -> Vec<(Vec<u8>, u32)> {
        // ---
        let mut events = Vec::new();
        decoder.decode_packet(list, first_has_delta, local_clock, &mut |bytes, ts| {
            events.push((bytes.to_vec(), ts));
        });
        events
    }

    #[test]
    fn test_empty_payload_decodes_to_nothing() {
        // ---
        assert!(decode(&[], false).is_empty());
        assert!(decode(&[], true).is_empty());
    }

    #[test]
    fn test_single_note_on() {
        // ---
        let events = decode(&[0x90, 0x40, 0x7F], false);
        assert_eq!(events, vec![(vec![0x90, 0x40, 0x7F], 0)]);
    }

    #[test]
    fn test_running_status_reused_across_commands() {
        // ---
        // Note on, then two more note events without a status byte.
        let list = [0x90, 0x40, 0x7F, 0x00, 0x41, 0x7F, 0x00, 0x40, 0x00];
        let events = decode(&list, false);

        assert_eq!(
            events,
            vec![
                (vec![0x90, 0x40, 0x7F], 0),
                (vec![0x90, 0x41, 0x7F], 0),
                (vec![0x90, 0x40, 0x00], 0),
            ]
        );
    }

    #[test]
    fn test_running_status_survives_packet_boundary() {
        // ---
        let mut decoder = MidiDecoder::new(DEFAULT_SYSEX_CAPACITY);
        decode_with(&mut decoder, &[0x90, 0x40, 0x7F], false, 0);

        // Next payload continues with bare data bytes.
        let events = decode_with(&mut decoder, &[0x41, 0x60], false, 0);
        assert_eq!(events, vec![(vec![0x90, 0x41, 0x60], 0)]);
    }

    #[test]
    fn test_restated_status_is_idempotent() {
        // ---
        let list = [0x90, 0x40, 0x7F, 0x00, 0x90, 0x41, 0x7F];
        let events = decode(&list, false);

        assert_eq!(
            events,
            vec![(vec![0x90, 0x40, 0x7F], 0), (vec![0x90, 0x41, 0x7F], 0)]
        );
    }

    #[test]
    fn test_two_byte_commands() {
        // ---
        // Program change then channel pressure under running status.
        let events = decode(&[0xC5, 0x12, 0x00, 0x13], false);
        assert_eq!(
            events,
            vec![(vec![0xC5, 0x12], 0), (vec![0xC5, 0x13], 0)]
        );
    }

    #[test]
    fn test_pitch_bend_is_three_bytes() {
        // ---
        let events = decode(&[0xE0, 0x00, 0x40], false);
        assert_eq!(events, vec![(vec![0xE0, 0x00, 0x40], 0)]);
    }

    #[test]
    fn test_song_position_is_one_shot() {
        // ---
        // F2 completes with its own status, then running status is gone and
        // the stray data bytes that follow are ignored.
        let list = [0xF2, 0x10, 0x20, 0x00, 0x30, 0x00, 0x31];
        let events = decode(&list, false);

        assert_eq!(events, vec![(vec![0xF2, 0x10, 0x20], 0)]);
    }

    #[test]
    fn test_song_select_clears_running_status() {
        // ---
        let list = [0xF3, 0x05, 0x00, 0x06];
        let events = decode(&list, false);

        assert_eq!(events, vec![(vec![0xF3, 0x05], 0)]);
    }

    #[test]
    fn test_tune_request_and_real_time() {
        // ---
        let list = [0xF6, 0x00, 0xF8, 0x00, 0xFE];
        let events = decode(&list, false);

        assert_eq!(
            events,
            vec![(vec![0xF6], 0), (vec![0xF8], 0), (vec![0xFE], 0)]
        );
    }

    #[test]
    fn test_real_time_does_not_disturb_running_status() {
        // ---
        let list = [0x90, 0x40, 0x7F, 0x00, 0xF8, 0x00, 0x41, 0x7F];
        let events = decode(&list, false);

        assert_eq!(
            events,
            vec![
                (vec![0x90, 0x40, 0x7F], 0),
                (vec![0xF8], 0),
                (vec![0x90, 0x41, 0x7F], 0),
            ]
        );
    }

    #[test]
    fn test_delta_times_stamp_events() {
        // ---
        let mut list = Vec::new();
        encode_delta_time(100, &mut list);
        list.extend_from_slice(&[0x90, 0x40, 0x7F]);
        encode_delta_time(250, &mut list);
        list.extend_from_slice(&[0x41, 0x7F]);

        let mut decoder = MidiDecoder::new(DEFAULT_SYSEX_CAPACITY);
        let events = decode_with(&mut decoder, &list, true, 5000);

        // Each command is stamped local_clock + its own delta.
        assert_eq!(
            events,
            vec![
                (vec![0x90, 0x40, 0x7F], 5100),
                (vec![0x90, 0x41, 0x7F], 5250),
            ]
        );
    }

    #[test]
    fn test_sysex_in_one_payload() {
        // ---
        let list = [0xF0, 0x7E, 0x7F, 0x09, 0x01, 0xF7];
        let events = decode(&list, false);

        assert_eq!(events, vec![(vec![0xF0, 0x7E, 0x7F, 0x09, 0x01, 0xF7], 0)]);
    }

    #[test]
    fn test_sysex_across_two_payloads() {
        // ---
        let mut decoder = MidiDecoder::new(DEFAULT_SYSEX_CAPACITY);

        // First segment ends with an F0 continuation marker.
        let a = decode_with(&mut decoder, &[0x00, 0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF0], true, 0);
        assert!(a.is_empty());

        // Second segment opens with F7 and closes the transfer.
        let b = decode_with(&mut decoder, &[0x00, 0xF7, 0x06, 0x02, 0xF7], true, 0);
        assert_eq!(b, vec![(vec![0xF0, 0x7E, 0x7F, 0x06, 0x01, 0x06, 0x02, 0xF7], 0)]);
    }

    #[test]
    fn test_real_time_inside_sysex_segment() {
        // ---
        let list = [0xF0, 0x7E, 0xF8, 0x7F, 0xF7];
        let events = decode(&list, false);

        assert_eq!(
            events,
            vec![(vec![0xF8], 0), (vec![0xF0, 0x7E, 0x7F, 0xF7], 0)]
        );
    }

    #[test]
    fn test_sysex_cancelled_by_f4() {
        // ---
        let mut decoder = MidiDecoder::new(DEFAULT_SYSEX_CAPACITY);
        let events = decode_with(&mut decoder, &[0xF0, 0x7E, 0x7F, 0xF4], false, 0);
        assert!(events.is_empty());

        // The decoder is clean afterwards: a normal command decodes as usual.
        let events = decode_with(&mut decoder, &[0x90, 0x40, 0x7F], false, 0);
        assert_eq!(events, vec![(vec![0x90, 0x40, 0x7F], 0)]);
    }

    #[test]
    fn test_corrupted_sysex_reprocesses_status() {
        // ---
        // A channel status in the middle of a segment aborts the transfer
        // and is then decoded as the start of a regular command.
        let list = [0xF0, 0x7E, 0x90, 0x40, 0x7F];
        let events = decode(&list, false);

        assert_eq!(events, vec![(vec![0x90, 0x40, 0x7F], 0)]);
    }

    #[test]
    fn test_sysex_overflow_truncates_and_still_delivers() {
        // ---
        let mut decoder = MidiDecoder::new(4);
        let list = [0xF0, 0x01, 0x02, 0x03, 0x04, 0x05, 0xF7];
        let events = decode_with(&mut decoder, &list, false, 0);

        // Capacity 4: bytes beyond it (including the closing F7) are
        // dropped, but the truncated transfer is still delivered.
        assert_eq!(events, vec![(vec![0xF0, 0x01, 0x02, 0x03], 0)]);
        assert_eq!(decoder.overflow_events(), 1);
    }

    #[test]
    fn test_five_byte_delta_treated_as_data() {
        // ---
        // Z=1 with four continuation-flagged delta bytes: the fifth byte is
        // the command, not part of the delta-time.
        let list = [0x81, 0x82, 0x83, 0x84, 0xF8];
        let events = decode(&list, true);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, vec![0xF8]);
    }

    #[test]
    fn test_data_byte_without_status_ignored() {
        // ---
        assert!(decode(&[0x40, 0x7F], false).is_empty());
    }

    #[test]
    fn test_reset_clears_carried_state() {
        // ---
        let mut decoder = MidiDecoder::new(DEFAULT_SYSEX_CAPACITY);
        decode_with(&mut decoder, &[0xF0, 0x01, 0x02], false, 0);
        decoder.reset();

        // No SysEx is in progress anymore; a stray F7 is treated as a
        // status byte with nothing to deliver.
        let events = decode_with(&mut decoder, &[0x03, 0x04, 0xF7], false, 0);
        assert!(events.is_empty());
    }
}
