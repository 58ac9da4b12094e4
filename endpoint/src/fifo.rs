//! Outbound MIDI byte stream between the host and the run-step.
//!
//! A bounded SPSC byte ring: the host thread pushes MIDI blocks (with their
//! inter-command delta-times already encoded), the run-step drains up to one
//! RTP payload per tick. Pushes are all-or-nothing so a frame never carries
//! half a MIDI command.

use rtrb::{Consumer, Producer, RingBuffer};

/// Default ring capacity in bytes.
pub const DEFAULT_STREAM_CAPACITY: usize = 2048;

/// Creates the two halves of a MIDI byte stream with the given capacity.
pub fn midi_stream(capacity: usize) -> (MidiStreamWriter, MidiStreamReader) {
    // ---
    let (producer, consumer) = RingBuffer::new(capacity);
    (
        MidiStreamWriter { queue: producer },
        MidiStreamReader { queue: consumer },
    )
}

/// Producer half; owned by the host side.
pub struct MidiStreamWriter {
    // ---
    queue: Producer<u8>,
}

impl MidiStreamWriter {
    // ---
    /// Pushes a whole block, or nothing.
    ///
    /// Returns `false` when the block does not fit in the free space; no
    /// bytes are written in that case. An empty block trivially succeeds.
    pub fn push(&mut self, block: &[u8]) -> bool {
        // ---
        if block.is_empty() {
            return true;
        }

        let Ok(mut chunk) = self.queue.write_chunk(block.len()) else {
            return false;
        };

        let (first, second) = chunk.as_mut_slices();
        let split = first.len();
        first.copy_from_slice(&block[..split]);
        second.copy_from_slice(&block[split..]);
        chunk.commit_all();

        true
    }
}

/// Consumer half; owned by the session run-step.
pub struct MidiStreamReader {
    // ---
    queue: Consumer<u8>,
}

impl MidiStreamReader {
    // ---
    /// Moves at most `max` bytes into `out`, returning how many were taken.
    pub fn drain_up_to(&mut self, max: usize, out: &mut Vec<u8>) -> usize {
        // ---
        let count = self.queue.slots().min(max);
        if count == 0 {
            return 0;
        }

        let Ok(chunk) = self.queue.read_chunk(count) else {
            return 0;
        };

        let (first, second) = chunk.as_slices();
        out.extend_from_slice(first);
        out.extend_from_slice(second);
        chunk.commit_all();

        count
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_push_is_all_or_nothing() {
        // ---
        let (mut writer, mut reader) = midi_stream(8);

        assert!(writer.push(&[1, 2, 3, 4, 5]));
        // 3 bytes free: a 4-byte block must be rejected without side effects.
        assert!(!writer.push(&[6, 7, 8, 9]));
        assert!(writer.push(&[6, 7, 8]));

        let mut out = Vec::new();
        assert_eq!(reader.drain_up_to(16, &mut out), 8);
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_empty_push_always_succeeds() {
        // ---
        let (mut writer, _reader) = midi_stream(2);
        assert!(writer.push(&[1, 2]));
        assert!(writer.push(&[]));
    }

    #[test]
    fn test_drain_caps_at_max() {
        // ---
        let (mut writer, mut reader) = midi_stream(16);
        assert!(writer.push(&[0; 10]));

        let mut out = Vec::new();
        assert_eq!(reader.drain_up_to(4, &mut out), 4);
        assert_eq!(reader.drain_up_to(4, &mut out), 4);
        assert_eq!(reader.drain_up_to(4, &mut out), 2);
        assert_eq!(reader.drain_up_to(4, &mut out), 0);
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn test_order_preserved_across_wraparound() {
        // ---
        let (mut writer, mut reader) = midi_stream(8);
        let mut out = Vec::new();

        // Advance the internal indices so the next block wraps.
        assert!(writer.push(&[0; 6]));
        reader.drain_up_to(6, &mut out);
        out.clear();

        assert!(writer.push(&[10, 11, 12, 13, 14]));
        assert_eq!(reader.drain_up_to(8, &mut out), 5);
        assert_eq!(out, vec![10, 11, 12, 13, 14]);
    }

    #[test]
    fn test_cross_thread_stream() {
        // ---
        let (mut writer, mut reader) = midi_stream(64);

        let producer = std::thread::spawn(move || {
            for i in 0..100u8 {
                while !writer.push(&[i, i, i]) {
                    std::thread::yield_now();
                }
            }
        });

        let mut received = Vec::new();
        while received.len() < 300 {
            if reader.drain_up_to(32, &mut received) == 0 {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();

        for (i, triple) in received.chunks(3).enumerate() {
            assert_eq!(triple, [i as u8, i as u8, i as u8]);
        }
    }
}
