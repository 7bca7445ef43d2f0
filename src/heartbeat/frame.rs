//! Incremental WebSocket frame boundary tracking
//!
//! The tunnel decorators never buffer or rewrite application bytes. They only
//! need to know where frames start (to slip a probe in between two frames) and
//! which opcodes went by (to spot the client's pong).

pub const OPCODE_PING: u8 = 0x9;
pub const OPCODE_PONG: u8 = 0xA;

/// Unmasked, empty, final Ping frame
pub const PING_FRAME: [u8; 2] = [0x80 | OPCODE_PING, 0x00];

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: u8,
    pub masked: bool,
    pub payload_len: u64,
}

impl FrameHeader {
    pub fn is_pong(&self) -> bool {
        self.opcode == OPCODE_PONG
    }
}

#[derive(Debug)]
enum State {
    Header,
    Payload { remaining: u64 },
}

/// Byte-at-a-time WebSocket frame scanner. Feed it every byte of one
/// direction of a stream, in order.
#[derive(Debug)]
pub struct FrameScanner {
    state: State,
    header: [u8; 14],
    header_len: usize,
}

impl Default for FrameScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameScanner {
    pub fn new() -> Self {
        Self {
            state: State::Header,
            header: [0; 14],
            header_len: 0,
        }
    }

    /// True when the next byte would start a new frame
    pub fn at_boundary(&self) -> bool {
        matches!(self.state, State::Header) && self.header_len == 0
    }

    /// Consume `bytes`, calling `on_header` for every frame header completed
    pub fn feed(&mut self, mut bytes: &[u8], mut on_header: impl FnMut(FrameHeader)) {
        while !bytes.is_empty() {
            match self.state {
                State::Payload { remaining } => {
                    let take = remaining.min(bytes.len() as u64);
                    bytes = &bytes[take as usize..];
                    let remaining = remaining - take;
                    self.state = if remaining == 0 {
                        State::Header
                    } else {
                        State::Payload { remaining }
                    };
                }
                State::Header => {
                    self.header[self.header_len] = bytes[0];
                    self.header_len += 1;
                    bytes = &bytes[1..];

                    if let Some(header) = self.complete_header() {
                        self.header_len = 0;
                        if header.payload_len > 0 {
                            self.state = State::Payload {
                                remaining: header.payload_len,
                            };
                        }
                        on_header(header);
                    }
                }
            }
        }
    }

    /// Header length implied by the first two bytes
    fn required_header_len(&self) -> Option<usize> {
        if self.header_len < 2 {
            return None;
        }
        let extended = match self.header[1] & 0x7F {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let mask = if self.header[1] & 0x80 != 0 { 4 } else { 0 };
        Some(2 + extended + mask)
    }

    fn complete_header(&self) -> Option<FrameHeader> {
        let required = self.required_header_len()?;
        if self.header_len < required {
            return None;
        }

        let first = self.header[0];
        let second = self.header[1];
        let payload_len = match second & 0x7F {
            126 => u16::from_be_bytes([self.header[2], self.header[3]]) as u64,
            127 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&self.header[2..10]);
                u64::from_be_bytes(buf)
            }
            len => len as u64,
        };

        Some(FrameHeader {
            fin: first & 0x80 != 0,
            opcode: first & 0x0F,
            masked: second & 0x80 != 0,
            payload_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(scanner: &mut FrameScanner, bytes: &[u8]) -> Vec<FrameHeader> {
        let mut headers = Vec::new();
        scanner.feed(bytes, |h| headers.push(h));
        headers
    }

    fn text_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x81, payload.len() as u8];
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_ping_frame_constant() {
        let mut scanner = FrameScanner::new();
        let headers = scan(&mut scanner, &PING_FRAME);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].opcode, OPCODE_PING);
        assert!(headers[0].fin);
        assert!(!headers[0].masked);
        assert!(scanner.at_boundary());
    }

    #[test]
    fn test_boundary_tracking_inside_frame() {
        let mut scanner = FrameScanner::new();
        let frame = text_frame(b"hello");

        scan(&mut scanner, &frame[..3]);
        assert!(!scanner.at_boundary());
        scan(&mut scanner, &frame[3..]);
        assert!(scanner.at_boundary());
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut scanner = FrameScanner::new();
        let mut bytes = text_frame(b"a");
        bytes.extend_from_slice(&[0x8A, 0x00]);
        bytes.extend(text_frame(b"bc"));

        let headers = scan(&mut scanner, &bytes);
        let opcodes: Vec<u8> = headers.iter().map(|h| h.opcode).collect();
        assert_eq!(opcodes, vec![0x1, OPCODE_PONG, 0x1]);
        assert!(headers[1].is_pong());
        assert!(scanner.at_boundary());
    }

    #[test]
    fn test_masked_pong_split_byte_by_byte() {
        let mut scanner = FrameScanner::new();
        // masked pong with a 2 byte payload, as a browser sends it
        let bytes = [0x8A, 0x82, 1, 2, 3, 4, 0xAA, 0xBB];
        let mut headers = Vec::new();
        for b in bytes {
            scanner.feed(&[b], |h| headers.push(h));
        }
        assert_eq!(headers.len(), 1);
        assert!(headers[0].is_pong());
        assert!(headers[0].masked);
        assert_eq!(headers[0].payload_len, 2);
        assert!(scanner.at_boundary());
    }

    #[test]
    fn test_extended_16_bit_length() {
        let mut scanner = FrameScanner::new();
        let payload = vec![b'x'; 300];
        let mut bytes = vec![0x82, 126];
        bytes.extend_from_slice(&300u16.to_be_bytes());
        bytes.extend_from_slice(&payload);

        let headers = scan(&mut scanner, &bytes[..100]);
        assert_eq!(headers[0].payload_len, 300);
        assert!(!scanner.at_boundary());
        scan(&mut scanner, &bytes[100..]);
        assert!(scanner.at_boundary());
    }

    #[test]
    fn test_extended_64_bit_length() {
        let mut scanner = FrameScanner::new();
        let mut bytes = vec![0x82, 127];
        bytes.extend_from_slice(&70_000u64.to_be_bytes());
        let headers = scan(&mut scanner, &bytes);
        assert_eq!(headers[0].payload_len, 70_000);

        scan(&mut scanner, &vec![0u8; 69_999]);
        assert!(!scanner.at_boundary());
        scan(&mut scanner, &[0u8]);
        assert!(scanner.at_boundary());
    }
}
