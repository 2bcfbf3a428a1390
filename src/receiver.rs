//! Streaming receiver: turns a byte stream into whole frames, retaining
//! leftover bytes across calls and resynchronizing on garbage.

use log::{debug, trace, warn};

use crate::constants::{HEADER_LEN, SYNC_MARKER};
use crate::error::{HiDockError, Result};
use crate::frame::parse_header;

/// A fully decoded, body-extracted frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command_id: u16,
    pub sequence_id: u32,
    pub body: Vec<u8>,
}

/// Owns the receive buffer and extracts whole frames from it as bytes
/// arrive, one USB read at a time.
#[derive(Debug, Default)]
pub struct StreamingReceiver {
    buffer: Vec<u8>,
}

impl StreamingReceiver {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Pull exactly one whole frame out of the buffer, resynchronizing on a
    /// bad sync marker when not in streaming mode. Returns `Ok(None)` when
    /// there isn't enough buffered data yet — the caller should read more
    /// from the transport and feed it in.
    fn try_extract(&mut self, streaming: bool) -> Result<Option<Frame>> {
        loop {
            if self.buffer.len() < 2 {
                return Ok(None);
            }
            if self.buffer[0..2] != SYNC_MARKER {
                if streaming {
                    warn!("bad sync marker during streaming read, aborting");
                    self.buffer.clear();
                    return Err(HiDockError::ProtocolError {
                        detail: "bad sync marker during streaming command".into(),
                    });
                }
                match self.buffer[1..]
                    .windows(2)
                    .position(|w| w == SYNC_MARKER)
                {
                    Some(idx) => {
                        trace!("resync: dropping {} leading garbage bytes", idx + 1);
                        self.buffer.drain(..idx + 1);
                        continue;
                    }
                    None => {
                        trace!("resync: no sync marker found, dropping whole buffer");
                        self.buffer.clear();
                        return Ok(None);
                    }
                }
            }

            if self.buffer.len() < HEADER_LEN {
                return Ok(None);
            }
            let header = parse_header(&self.buffer[2..HEADER_LEN])
                .expect("slice length checked above");
            let total = header.total_len();
            if self.buffer.len() < total {
                return Ok(None);
            }

            let body_start = HEADER_LEN;
            let body_end = HEADER_LEN + header.body_length as usize;
            let body = self.buffer[body_start..body_end].to_vec();
            self.buffer.drain(..total);

            debug!(
                "extracted frame cmd={} seq={} body_len={}",
                header.command_id,
                header.sequence_id,
                body.len()
            );

            return Ok(Some(Frame {
                command_id: header.command_id,
                sequence_id: header.sequence_id,
                body,
            }));
        }
    }

    /// Extract the next frame that matches either the expected sequence
    /// (non-streaming commands) or the streaming command id (streaming
    /// commands), discarding anything else. `Ok(None)` means: no match yet,
    /// read more bytes and feed them in.
    pub fn receive_matching(
        &mut self,
        expected_sequence: Option<u32>,
        streaming_cmd_id: Option<u16>,
    ) -> Result<Option<Frame>> {
        let streaming = streaming_cmd_id.is_some();
        loop {
            let Some(frame) = self.try_extract(streaming)? else {
                return Ok(None);
            };

            let sequence_matches = expected_sequence == Some(frame.sequence_id);
            let streaming_matches = streaming_cmd_id == Some(frame.command_id);

            if sequence_matches || streaming_matches {
                return Ok(Some(frame));
            }

            warn!(
                "discarding frame cmd={} seq={} (expected seq={:?}, streaming cmd={:?})",
                frame.command_id, frame.sequence_id, expected_sequence, streaming_cmd_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{build, SequenceCounter};

    fn frames_to_bytes(frames: &[(u16, &[u8])]) -> Vec<u8> {
        let mut counter = SequenceCounter::new();
        let mut out = Vec::new();
        for (cmd, body) in frames {
            out.extend(build(&mut counter, *cmd, body));
        }
        out
    }

    #[test]
    fn any_chunking_of_valid_frames_yields_same_sequence() {
        let wire = frames_to_bytes(&[(4, b"abc"), (4, b"de"), (4, b"")]);

        for chunk_size in 1..=wire.len() {
            let mut recv = StreamingReceiver::new();
            let mut out = Vec::new();
            let mut offset = 0;
            let mut expected_seq = 1u32;
            while out.len() < 3 {
                if offset < wire.len() {
                    let end = (offset + chunk_size).min(wire.len());
                    recv.feed(&wire[offset..end]);
                    offset = end;
                }
                if let Some(frame) = recv.receive_matching(None, Some(4)).unwrap() {
                    out.push(frame);
                    expected_seq += 1;
                } else if offset >= wire.len() {
                    break;
                }
            }
            let _ = expected_seq;
            assert_eq!(out.len(), 3, "chunk_size={chunk_size}");
            assert_eq!(out[0].body, b"abc");
            assert_eq!(out[1].body, b"de");
            assert_eq!(out[2].body, b"");
        }
    }

    #[test]
    fn resync_drops_leading_garbage_before_valid_frame() {
        let mut counter = SequenceCounter::new();
        let valid = build(&mut counter, 1, b"");
        let mut wire = vec![0xAA, 0xBB];
        wire.extend(valid);

        let mut recv = StreamingReceiver::new();
        recv.feed(&wire);
        let frame = recv.receive_matching(Some(1), None).unwrap().unwrap();
        assert_eq!(frame.command_id, 1);
        assert_eq!(frame.sequence_id, 1);
        assert!(frame.body.is_empty());
    }

    #[test]
    fn sync_marker_inside_body_does_not_cause_premature_resync() {
        let mut counter = SequenceCounter::new();
        // body deliberately contains the sync marker bytes.
        let body = [0x12, 0x34, 0xFF];
        let wire = build(&mut counter, 4, &body);

        let mut recv = StreamingReceiver::new();
        recv.feed(&wire);
        let frame = recv.receive_matching(Some(1), None).unwrap().unwrap();
        assert_eq!(frame.body, body);
    }

    #[test]
    fn bad_sync_during_streaming_is_fatal_protocol_error() {
        let mut recv = StreamingReceiver::new();
        recv.feed(&[0xAA, 0xBB, 0xCC, 0xDD]);
        let err = recv.receive_matching(None, Some(4)).unwrap_err();
        assert!(matches!(err, HiDockError::ProtocolError { .. }));
    }

    #[test]
    fn discards_non_matching_frame_and_keeps_reading() {
        let wire = frames_to_bytes(&[(4, b"wrong-cmd"), (5, b"right-cmd")]);
        let mut recv = StreamingReceiver::new();
        recv.feed(&wire);
        let frame = recv.receive_matching(None, Some(5)).unwrap().unwrap();
        assert_eq!(frame.body, b"right-cmd");
    }
}
