use crate::error::ProxyError;
use bytes::{Buf, Bytes, BytesMut};

pub const FRAME_HEADER_LEN: usize = 4;

/// One unit carved out of the shared TCP byte stream: either an interleaved
/// binary frame or a complete RTSP text message (head plus declared body).
#[derive(Debug)]
pub enum Frame {
    Interleaved { channel: u8, payload: Bytes },
    Message(Bytes),
}

/// Incremental framer for an RTSP connection. Text and `$`-prefixed binary
/// frames share the stream, so the first unconsumed byte picks the mode;
/// partial frames stay buffered until the rest arrives.
pub struct StreamParser {
    buffer: BytesMut,
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    pub fn append(&mut self, data: &[u8]) -> Result<Vec<Frame>, ProxyError> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            let Some(&first) = self.buffer.first() else {
                break;
            };

            if first == b'$' {
                match self.extract_interleaved() {
                    Some(frame) => {
                        frames.push(frame);
                        continue;
                    }
                    None => break,
                }
            }

            if !first.is_ascii_alphabetic() {
                return Err(ProxyError::Parse(format!(
                    "unexpected byte {first:#04x} at message boundary"
                )));
            }

            match self.extract_message() {
                Some(frame) => {
                    frames.push(frame);
                    continue;
                }
                None => break,
            }
        }

        Ok(frames)
    }

    fn extract_interleaved(&mut self) -> Option<Frame> {
        if self.buffer.len() < FRAME_HEADER_LEN {
            return None;
        }

        let channel = self.buffer[1];
        let length = ((self.buffer[2] as usize) << 8) | (self.buffer[3] as usize);
        let total = FRAME_HEADER_LEN + length;
        if self.buffer.len() < total {
            return None;
        }

        let mut frame = self.buffer.split_to(total);
        frame.advance(FRAME_HEADER_LEN);
        Some(Frame::Interleaved {
            channel,
            payload: frame.freeze(),
        })
    }

    fn extract_message(&mut self) -> Option<Frame> {
        let head_end = find_header_end(&self.buffer)?;
        let content_length = parse_content_length(&self.buffer[..head_end]);
        let total = head_end + content_length;
        if self.buffer.len() < total {
            return None;
        }
        Some(Frame::Message(self.buffer.split_to(total).freeze()))
    }
}

fn line_break_len(buffer: &[u8], index: usize) -> Option<usize> {
    match buffer.get(index)? {
        b'\r' => Some(if buffer.get(index + 1) == Some(&b'\n') {
            2
        } else {
            1
        }),
        b'\n' => Some(1),
        _ => None,
    }
}

/// Index one past the blank line terminating a header block, accepting
/// `\r\n`, lone `\r` and lone `\n` as line breaks. A trailing lone `\r` at
/// the very end of the buffer is treated as incomplete, since its `\n` may
/// still be in flight.
pub(crate) fn find_header_end(buffer: &[u8]) -> Option<usize> {
    let mut index = 0;
    while index < buffer.len() {
        match line_break_len(buffer, index) {
            Some(first) => {
                if let Some(second) = line_break_len(buffer, index + first) {
                    let end = index + first + second;
                    if end == buffer.len() && buffer[end - 1] == b'\r' {
                        return None;
                    }
                    return Some(end);
                }
                index += first;
            }
            None => index += 1,
        }
    }
    None
}

fn parse_content_length(head: &[u8]) -> usize {
    let text = String::from_utf8_lossy(head);
    for line in text.lines() {
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse().unwrap_or(0);
            }
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carves_interleaved_frame() {
        let mut parser = StreamParser::new();
        let frames = parser.append(b"$\x02\x00\x04abcd").unwrap();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Interleaved { channel, payload } => {
                assert_eq!(*channel, 2);
                assert_eq!(payload.as_ref(), b"abcd");
            }
            other => panic!("expected interleaved frame, got {other:?}"),
        }
    }

    #[test]
    fn buffers_partial_interleaved_frame() {
        let mut parser = StreamParser::new();
        assert!(parser.append(b"$\x00\x00\x04ab").unwrap().is_empty());
        let frames = parser.append(b"cd").unwrap();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Interleaved { channel, payload } => {
                assert_eq!(*channel, 0);
                assert_eq!(payload.as_ref(), b"abcd");
            }
            other => panic!("expected interleaved frame, got {other:?}"),
        }
    }

    #[test]
    fn accumulates_text_until_blank_line() {
        let mut parser = StreamParser::new();
        assert!(parser
            .append(b"RTSP/1.0 200 OK\r\nCSeq: 1")
            .unwrap()
            .is_empty());
        let frames = parser.append(b"\r\n\r\n").unwrap();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Message(bytes) => {
                assert_eq!(bytes.as_ref(), b"RTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\n");
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn waits_for_declared_body() {
        let mut parser = StreamParser::new();
        let head = b"RTSP/1.0 200 OK\r\nContent-Length: 4\r\n\r\n";
        assert!(parser.append(head).unwrap().is_empty());
        assert!(parser.append(b"v=").unwrap().is_empty());
        let frames = parser.append(b"0\n").unwrap();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Message(bytes) => assert!(bytes.ends_with(b"v=0\n")),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn splits_mixed_text_and_binary() {
        let mut parser = StreamParser::new();
        let mut input = Vec::new();
        input.extend_from_slice(b"$\x00\x00\x02hi");
        input.extend_from_slice(b"RTSP/1.0 200 OK\r\n\r\n");
        input.extend_from_slice(b"$\x01\x00\x01x");
        let frames = parser.append(&input).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[0], Frame::Interleaved { channel: 0, .. }));
        assert!(matches!(frames[1], Frame::Message(_)));
        assert!(matches!(frames[2], Frame::Interleaved { channel: 1, .. }));
    }

    #[test]
    fn rejects_garbage_at_message_boundary() {
        let mut parser = StreamParser::new();
        assert!(parser.append(&[0x01, 0x02]).is_err());
    }

    #[test]
    fn finds_header_end_with_bare_line_breaks() {
        assert_eq!(find_header_end(b"a\r\n\r\nrest"), Some(5));
        assert_eq!(find_header_end(b"a\n\nrest"), Some(3));
        assert_eq!(find_header_end(b"a\r\rrest"), Some(3));
        assert_eq!(find_header_end(b"a\r\nb"), None);
    }

    #[test]
    fn trailing_carriage_return_waits_for_more_data() {
        // The final \r may be half of a \r\n split across reads.
        assert_eq!(find_header_end(b"a\r\n\r"), None);
    }
}
