use std::io;

use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use super::Payload;
use crate::headers::ContentLength;

/// Frames SIP messages on a stream transport.
///
/// A message is the start line, CRLF-delimited headers, an empty line and
/// exactly `Content-Length` bytes of body. CRLF keep-alives between
/// messages are discarded.
#[derive(Default)]
pub(crate) struct StreamingDecoder;

impl Decoder for StreamingDecoder {
    type Error = io::Error;
    type Item = Payload;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Discard keep-alive CRLF sequences ahead of the next start line.
        while src.starts_with(b"\r\n") {
            src.advance(2);
        }
        if src.is_empty() {
            return Ok(None);
        }

        // Find header end.
        let hdr_end = b"\n\r\n";
        let Some(pos) = find_subslice(src, hdr_end) else {
            return Ok(None);
        };
        let body_start = pos + 3;
        let hdr_end = pos + 1;

        // Find the "Content-Length" header.
        let mut content_length = None;

        let lines = src[..hdr_end].split(|&b| b == b'\n');
        for line in lines {
            let mut split = line.splitn(2, |&c| c == b':');
            let Some(name) = split.next() else {
                continue;
            };
            if ContentLength::matches_name(trim_bytes(name)) {
                let Some(value) = split.next() else {
                    continue;
                };
                let Ok(value_str) = std::str::from_utf8(value) else {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "Invalid UTF-8 in Content-Length header",
                    ));
                };
                if let Ok(parsed_value) = value_str.trim().parse::<usize>() {
                    content_length = Some(parsed_value);
                }
            }
        }

        let Some(c_len) = content_length else {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "Content-Length not found"));
        };

        let expected_msg_size = body_start + c_len;
        if src.len() < expected_msg_size {
            src.reserve(expected_msg_size - src.len());
            return Ok(None);
        }
        let src_bytes = src.split_to(expected_msg_size);

        Ok(Some(Payload::new(src_bytes.freeze())))
    }
}

fn find_subslice(src: &[u8], needle: &[u8]) -> Option<usize> {
    src.windows(needle.len()).position(|w| w == needle)
}

fn trim_bytes(b: &[u8]) -> &[u8] {
    let start = b.iter().position(|c| !c.is_ascii_whitespace()).unwrap_or(b.len());
    let end = b.iter().rposition(|c| !c.is_ascii_whitespace()).map_or(start, |e| e + 1);
    &b[start..end]
}
