//! Byte-stream framing: start/end delimiters and byte-stuffing escape.

/// Frame start delimiter.
pub const START: u8 = 0x1A;
/// Frame end delimiter.
pub const END: u8 = 0x0D;
/// Escape byte. Any occurrence of `START`, `END`, or `ESCAPE` inside a
/// payload is replaced by `ESCAPE` followed by the byte XORed with
/// [`ESCAPE_XOR`].
pub const ESCAPE: u8 = 0x7D;
/// XOR mask applied to an escaped byte.
pub const ESCAPE_XOR: u8 = 0x20;

fn needs_escape(b: u8) -> bool {
    b == START || b == END || b == ESCAPE
}

/// Wraps a decoded payload into a delimited, byte-stuffed frame ready to
/// write to the wire.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(START);
    for &b in payload {
        if needs_escape(b) {
            out.push(ESCAPE);
            out.push(b ^ ESCAPE_XOR);
        } else {
            out.push(b);
        }
    }
    out.push(END);
    out
}

/// Reassembles complete payloads out of a raw byte stream.
///
/// Bytes are pushed one at a time with [`Framer::push`]. A frame overflowing
/// `max_len` is discarded and framing state resets, matching the board's own
/// overflow behavior (a partial frame is simply abandoned).
#[derive(Debug)]
pub struct Framer {
    start: bool,
    escape: bool,
    buf: Vec<u8>,
    max_len: usize,
}

impl Framer {
    pub fn new(max_len: usize) -> Self {
        Framer {
            start: false,
            escape: false,
            buf: Vec::with_capacity(max_len.min(256)),
            max_len,
        }
    }

    /// Feeds one byte of the incoming stream. Returns `Some(payload)` when a
    /// complete, unescaped message has just been recognized.
    pub fn push(&mut self, b: u8) -> Option<Vec<u8>> {
        if !self.start {
            if b == START {
                self.start = true;
                self.escape = false;
                self.buf.clear();
            }
            return None;
        }

        if b == END && !self.escape {
            self.start = false;
            let payload = std::mem::take(&mut self.buf);
            return Some(payload);
        }

        if b == START && !self.escape {
            // A fresh start byte mid-frame restarts framing rather than
            // being treated as data.
            self.buf.clear();
            self.escape = false;
            return None;
        }

        let byte = if self.escape {
            self.escape = false;
            b ^ ESCAPE_XOR
        } else if b == ESCAPE {
            self.escape = true;
            return None;
        } else {
            b
        };

        self.buf.push(byte);
        if self.buf.len() > self.max_len {
            self.start = false;
            self.escape = false;
            self.buf.clear();
        }
        None
    }

    /// Feeds a chunk of bytes, returning every complete payload recognized.
    pub fn push_all(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for &b in bytes {
            if let Some(payload) = self.push(b) {
                out.push(payload);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_plain_payload() {
        let payload = vec![b'?', 1, 2, 3];
        let frame = encode_frame(&payload);
        let mut framer = Framer::new(64);
        let mut got = None;
        for b in frame {
            if let Some(p) = framer.push(b) {
                got = Some(p);
            }
        }
        assert_eq!(got, Some(payload));
    }

    #[test]
    fn round_trip_with_escaped_bytes() {
        let payload = vec![b'I', START, END, ESCAPE, 0x00, 0xFF];
        let frame = encode_frame(&payload);
        // no interior byte of the frame (other than the delimiters) may equal
        // a raw START/END byte.
        for &b in &frame[1..frame.len() - 1] {
            assert!(b != START && b != END || frame[0] == START);
        }
        let mut framer = Framer::new(64);
        let got = framer.push_all(&frame);
        assert_eq!(got, vec![payload]);
    }

    #[test]
    fn overflow_discards_partial_frame_and_resyncs() {
        let mut framer = Framer::new(4);
        framer.push(START);
        framer.push(1);
        framer.push(2);
        framer.push(3);
        framer.push(4);
        framer.push(5); // overflow, frame abandoned
        let payload = vec![b'?'];
        let frame = encode_frame(&payload);
        let got = framer.push_all(&frame);
        assert_eq!(got, vec![payload]);
    }

    #[test]
    fn garbage_before_start_is_ignored() {
        let mut framer = Framer::new(64);
        framer.push_all(&[0x00, 0xFF, 0x55]);
        let payload = vec![b'?', 9];
        let frame = encode_frame(&payload);
        let got = framer.push_all(&frame);
        assert_eq!(got, vec![payload]);
    }
}
