//! Transcoder output framing.
//!
//! Raw mode forwards chunks untouched. MJPEG mode reassembles complete JPEG
//! images (`FF D8` .. `FF D9`) out of arbitrarily fragmented stdout reads and
//! wraps each in a multipart part.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use super::DeliveryMode;

const START_MARKER: [u8; 2] = [0xFF, 0xD8];
const END_MARKER: [u8; 2] = [0xFF, 0xD9];

/// Multipart boundary used between MJPEG parts.
pub const BOUNDARY: &str = "frame";

/// Turns transcoder output into the byte payloads sent to the client.
pub enum OutputFramer {
    Raw,
    Mjpeg(FrameExtractor),
}

impl OutputFramer {
    pub fn new(mode: DeliveryMode, max_frame_bytes: usize) -> Self {
        match mode {
            DeliveryMode::Raw => OutputFramer::Raw,
            DeliveryMode::Mjpeg => OutputFramer::Mjpeg(FrameExtractor::new(max_frame_bytes)),
        }
    }

    pub fn frame(&mut self, chunk: Bytes) -> Vec<Bytes> {
        match self {
            OutputFramer::Raw => vec![chunk],
            OutputFramer::Mjpeg(extractor) => extractor
                .push(&chunk)
                .into_iter()
                .map(|frame| multipart_part(&frame))
                .collect(),
        }
    }

    /// Drops partial data left over from a previous pipeline launch.
    pub fn reset(&mut self) {
        if let OutputFramer::Mjpeg(extractor) = self {
            extractor.reset();
        }
    }
}

/// Incremental JPEG frame scanner.
///
/// The buffer always either starts with a start marker or holds at most one
/// trailing `0xFF` that may become one.
pub struct FrameExtractor {
    buf: BytesMut,
    /// Where to resume looking for the end marker of the buffered frame.
    end_scan: usize,
    max_frame_bytes: usize,
}

impl FrameExtractor {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            end_scan: 0,
            max_frame_bytes,
        }
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.end_scan = 0;
    }

    /// Appends `chunk` and returns every frame it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find(&self.buf, &START_MARKER, 0) else {
                let keep = usize::from(self.buf.last() == Some(&START_MARKER[0]));
                let discard = self.buf.len() - keep;
                self.buf.advance(discard);
                self.end_scan = 0;
                break;
            };
            if start > 0 {
                self.buf.advance(start);
                self.end_scan = 0;
            }

            let from = self.end_scan.max(START_MARKER.len());
            match find(&self.buf, &END_MARKER, from) {
                Some(end) => {
                    frames.push(self.buf.split_to(end + END_MARKER.len()).freeze());
                    self.end_scan = 0;
                }
                None => {
                    // the last byte may be the first half of a split end marker
                    self.end_scan = self.buf.len().saturating_sub(1);
                    if self.buf.len() > self.max_frame_bytes {
                        warn!(
                            buffered = self.buf.len(),
                            limit = self.max_frame_bytes,
                            "discarding oversized partial frame"
                        );
                        // skip this start marker and rescan what follows it
                        self.buf.advance(START_MARKER.len());
                        self.end_scan = 0;
                        continue;
                    }
                    break;
                }
            }
        }

        frames
    }
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// Wraps a JPEG in a `multipart/x-mixed-replace` part with a length header.
pub fn multipart_part(frame: &[u8]) -> Bytes {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        frame.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + frame.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(frame);
    part.put_slice(b"\r\n");
    part.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut frame = START_MARKER.to_vec();
        frame.extend_from_slice(body);
        frame.extend_from_slice(&END_MARKER);
        frame
    }

    fn stream() -> Vec<u8> {
        let mut bytes = b"junk".to_vec();
        bytes.extend(jpeg(b"first"));
        bytes.extend(jpeg(&[0x00, 0xFF, 0x00, 0xFF]));
        bytes.extend(b"between");
        bytes.extend(jpeg(b""));
        bytes.extend(&START_MARKER);
        bytes.extend(b"unfinished");
        bytes
    }

    #[test]
    fn test_single_chunk_multiple_frames() {
        let mut extractor = FrameExtractor::new(1 << 20);
        let frames = extractor.push(&stream());
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..], &jpeg(b"first")[..]);
        assert_eq!(&frames[1][..], &jpeg(&[0x00, 0xFF, 0x00, 0xFF])[..]);
        assert_eq!(&frames[2][..], &[0xFF, 0xD8, 0xFF, 0xD9]);
        // the unmatched start stays buffered
        assert_eq!(extractor.buffered(), 2 + b"unfinished".len());
    }

    #[test]
    fn test_fragmentation_does_not_change_output() {
        let input = stream();
        let mut whole = FrameExtractor::new(1 << 20);
        let expected = whole.push(&input);

        for chunk_size in 1..=input.len() {
            let mut extractor = FrameExtractor::new(1 << 20);
            let frames: Vec<Bytes> = input
                .chunks(chunk_size)
                .flat_map(|chunk| extractor.push(chunk))
                .collect();
            assert_eq!(frames, expected, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn test_markers_split_across_chunks() {
        let mut extractor = FrameExtractor::new(1 << 20);
        assert!(extractor.push(&[0xFF]).is_empty());
        assert!(extractor.push(&[0xD8, 0x01, 0xFF]).is_empty());
        let frames = extractor.push(&[0xD9]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &[0xFF, 0xD8, 0x01, 0xFF, 0xD9]);
        assert_eq!(extractor.buffered(), 0);
    }

    #[test]
    fn test_start_marker_only_yields_nothing() {
        let mut extractor = FrameExtractor::new(1 << 20);
        assert!(extractor.push(&START_MARKER).is_empty());
        assert!(extractor.push(b"more bytes, still no end").is_empty());
    }

    #[test]
    fn test_end_marker_must_follow_start() {
        // FF D8 D9 does not close the frame: the end marker needs its own FF
        let mut extractor = FrameExtractor::new(1 << 20);
        assert!(extractor.push(&[0xFF, 0xD8, 0xD9]).is_empty());
        assert_eq!(extractor.push(&[0xFF, 0xD9]).len(), 1);
    }

    #[test]
    fn test_oversized_partial_frame_is_discarded() {
        let mut extractor = FrameExtractor::new(16);
        assert!(extractor.push(&START_MARKER).is_empty());
        assert!(extractor.push(&[0u8; 32]).is_empty());
        assert!(extractor.buffered() <= 1);
        let frames = extractor.push(&jpeg(b"ok"));
        assert_eq!(frames, vec![Bytes::from(jpeg(b"ok"))]);
    }

    #[test]
    fn test_multipart_part_layout() {
        let part = multipart_part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let mut expected =
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n".to_vec();
        expected.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xD9]);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(&part[..], &expected[..]);
    }

    #[test]
    fn test_raw_mode_is_passthrough() {
        let mut framer = OutputFramer::new(DeliveryMode::Raw, 1 << 20);
        let chunk = Bytes::from_static(b"\x00\x00\x00\x18ftypiso5");
        assert_eq!(framer.frame(chunk.clone()), vec![chunk]);
    }
}
