//! Text-encoding detection and incremental line decoding
//!
//! Both the configuration loader and the file monitor consume text whose
//! encoding is unknown up front: UTF-8, UTF-16 (either byte order), or the
//! host's single-byte codepage. Detection looks at a bounded prefix and the
//! chosen encoding is then fixed for the lifetime of the handle.

use std::char::REPLACEMENT_CHARACTER;

/// Maximum number of bytes examined by [`TextEncoding::detect`].
pub const DETECTION_SAMPLE_LEN: usize = 4096;

/// Byte-statistics detection needs enough data to be trustworthy; shorter
/// BOM-less buffers are treated as single-byte text so that short ANSI
/// strings are not misread as UTF-16.
const STATISTICS_MIN_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Utf16Le,
    Utf16Be,
    /// Host ANSI codepage, decoded as Latin-1.
    Ansi,
}

impl TextEncoding {
    /// Detects the encoding of `sample` (at most the first
    /// [`DETECTION_SAMPLE_LEN`] bytes are considered).
    pub fn detect(sample: &[u8]) -> TextEncoding {
        let sample = &sample[..sample.len().min(DETECTION_SAMPLE_LEN)];

        if sample.starts_with(&[0xEF, 0xBB, 0xBF]) {
            return TextEncoding::Utf8;
        }
        if sample.starts_with(&[0xFF, 0xFE]) {
            return TextEncoding::Utf16Le;
        }
        if sample.starts_with(&[0xFE, 0xFF]) {
            return TextEncoding::Utf16Be;
        }

        if sample.len() >= STATISTICS_MIN_LEN {
            if let Some(encoding) = detect_utf16_by_statistics(sample) {
                return encoding;
            }
        }

        match std::str::from_utf8(sample) {
            Ok(_) => TextEncoding::Utf8,
            // A multi-byte sequence cut off at the end of the sample is still
            // valid UTF-8 text.
            Err(e) if e.error_len().is_none() => TextEncoding::Utf8,
            Err(_) => TextEncoding::Ansi,
        }
    }

    /// Length of this encoding's byte-order mark when `buf` starts with one.
    pub fn bom_len(self, buf: &[u8]) -> usize {
        match self {
            TextEncoding::Utf8 if buf.starts_with(&[0xEF, 0xBB, 0xBF]) => 3,
            TextEncoding::Utf16Le if buf.starts_with(&[0xFF, 0xFE]) => 2,
            TextEncoding::Utf16Be if buf.starts_with(&[0xFE, 0xFF]) => 2,
            _ => 0,
        }
    }

    /// Decodes an entire buffer, detecting the encoding and skipping any BOM.
    /// Undecodable sequences are replaced, never dropped.
    pub fn decode_document(bytes: &[u8]) -> (TextEncoding, String) {
        let encoding = TextEncoding::detect(bytes);
        let body = &bytes[encoding.bom_len(bytes)..];
        (encoding, encoding.decode(body))
    }

    /// Decodes `bytes` under this encoding, replacing invalid sequences.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            TextEncoding::Utf16Le => decode_utf16_units(units(bytes, u16::from_le_bytes)),
            TextEncoding::Utf16Be => decode_utf16_units(units(bytes, u16::from_be_bytes)),
            TextEncoding::Ansi => bytes.iter().map(|&b| b as char).collect(),
        }
    }

    fn unit_len(self) -> usize {
        match self {
            TextEncoding::Utf16Le | TextEncoding::Utf16Be => 2,
            TextEncoding::Utf8 | TextEncoding::Ansi => 1,
        }
    }

    fn is_newline_unit(self, buf: &[u8], at: usize) -> bool {
        match self {
            TextEncoding::Utf8 | TextEncoding::Ansi => buf[at] == b'\n',
            TextEncoding::Utf16Le => buf[at] == 0x0A && buf[at + 1] == 0x00,
            TextEncoding::Utf16Be => buf[at] == 0x00 && buf[at + 1] == 0x0A,
        }
    }
}

fn units<'a>(
    bytes: &'a [u8],
    from_bytes: fn([u8; 2]) -> u16,
) -> impl Iterator<Item = u16> + 'a {
    bytes.chunks_exact(2).map(move |c| from_bytes([c[0], c[1]]))
}

fn decode_utf16_units(iter: impl Iterator<Item = u16>) -> String {
    char::decode_utf16(iter)
        .map(|r| r.unwrap_or(REPLACEMENT_CHARACTER))
        .collect()
}

/// UTF-16 text that is mostly Latin script has near-all-zero high bytes; the
/// parity of the zero bytes tells the byte order apart.
fn detect_utf16_by_statistics(sample: &[u8]) -> Option<TextEncoding> {
    let pairs = sample.len() / 2;
    let mut even_zeros = 0usize;
    let mut odd_zeros = 0usize;
    for (i, &b) in sample.iter().enumerate() {
        if b == 0 {
            if i % 2 == 0 {
                even_zeros += 1;
            } else {
                odd_zeros += 1;
            }
        }
    }

    if odd_zeros * 2 >= pairs && even_zeros * 10 < pairs {
        Some(TextEncoding::Utf16Le)
    } else if even_zeros * 2 >= pairs && odd_zeros * 10 < pairs {
        Some(TextEncoding::Utf16Be)
    } else {
        None
    }
}

/// Incremental splitter over an append-only byte buffer.
///
/// Complete lines (terminated by `\n` or `\r\n`) are decoded and drained from
/// the buffer; the unterminated tail stays behind until more bytes arrive or
/// the owner flushes it.
#[derive(Debug, Clone, Copy)]
pub struct LineDecoder {
    encoding: TextEncoding,
}

impl LineDecoder {
    pub fn new(encoding: TextEncoding) -> Self {
        Self { encoding }
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    /// Extracts every complete line from the front of `buf`.
    pub fn drain_lines(&self, buf: &mut Vec<u8>) -> Vec<String> {
        let unit = self.encoding.unit_len();
        let mut lines = Vec::new();
        let mut start = 0usize;
        let mut at = 0usize;

        while at + unit <= buf.len() {
            if self.encoding.is_newline_unit(buf, at) {
                lines.push(self.decode_line(&buf[start..at]));
                start = at + unit;
            }
            at += unit;
        }

        if start > 0 {
            buf.drain(..start);
        }
        lines
    }

    /// Emits whatever remains in `buf` as a final line. Any non-empty
    /// residual is emitted, even when it decodes to an empty string (a lone
    /// trailing `\r` still counts as a line).
    pub fn flush(&self, buf: &mut Vec<u8>) -> Option<String> {
        if buf.is_empty() {
            return None;
        }
        let line = self.decode_line(buf);
        buf.clear();
        Some(line)
    }

    fn decode_line(&self, bytes: &[u8]) -> String {
        let mut line = self.encoding.decode(bytes);
        if line.ends_with('\r') {
            line.pop();
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16le(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(u16::to_le_bytes).collect()
    }

    fn utf16be(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(u16::to_be_bytes).collect()
    }

    #[test]
    fn detects_by_bom() {
        assert_eq!(TextEncoding::detect(b"\xEF\xBB\xBFhi"), TextEncoding::Utf8);
        assert_eq!(TextEncoding::detect(b"\xFF\xFEh\x00"), TextEncoding::Utf16Le);
        assert_eq!(TextEncoding::detect(b"\xFE\xFF\x00h"), TextEncoding::Utf16Be);
    }

    #[test]
    fn detects_utf8_without_bom() {
        assert_eq!(TextEncoding::detect("caf\u{e9} latte".as_bytes()), TextEncoding::Utf8);
    }

    #[test]
    fn truncated_utf8_sequence_still_utf8() {
        let mut bytes = "snowman \u{2603}".as_bytes().to_vec();
        bytes.pop();
        assert_eq!(TextEncoding::detect(&bytes), TextEncoding::Utf8);
    }

    #[test]
    fn detects_bomless_utf16_by_statistics() {
        let text = "x".repeat(80);
        assert_eq!(TextEncoding::detect(&utf16le(&text)), TextEncoding::Utf16Le);
        assert_eq!(TextEncoding::detect(&utf16be(&text)), TextEncoding::Utf16Be);
    }

    #[test]
    fn short_binary_is_ansi() {
        assert_eq!(TextEncoding::detect(&[0xC0, 0x80, 0xFF, 0x13]), TextEncoding::Ansi);
    }

    #[test]
    fn document_decode_strips_bom() {
        let mut bytes = vec![0xFF, 0xFE];
        bytes.extend(utf16le("{\"a\":1}"));
        let (encoding, text) = TextEncoding::decode_document(&bytes);
        assert_eq!(encoding, TextEncoding::Utf16Le);
        assert_eq!(text, "{\"a\":1}");
    }

    #[test]
    fn drains_complete_lines_only() {
        let decoder = LineDecoder::new(TextEncoding::Utf8);
        let mut buf = b"hello\nwor".to_vec();
        assert_eq!(decoder.drain_lines(&mut buf), vec!["hello".to_string()]);
        assert_eq!(buf, b"wor");

        buf.extend_from_slice(b"ld\r\n");
        assert_eq!(decoder.drain_lines(&mut buf), vec!["world".to_string()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn crlf_is_a_single_terminator() {
        let decoder = LineDecoder::new(TextEncoding::Utf8);
        let mut buf = b"a\r\nb\n".to_vec();
        assert_eq!(decoder.drain_lines(&mut buf), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn utf16_lines_respect_unit_alignment() {
        let decoder = LineDecoder::new(TextEncoding::Utf16Le);
        let mut buf = utf16le("first\nsecond");
        // Split one byte into the terminator of "first" to exercise the
        // partial-unit tail.
        let tail = buf.split_off(11);
        assert!(decoder.drain_lines(&mut buf).is_empty());
        buf.extend(tail);
        assert_eq!(decoder.drain_lines(&mut buf), vec!["first".to_string()]);
        assert_eq!(decoder.flush(&mut buf), Some("second".to_string()));
    }

    #[test]
    fn flush_emits_residual_bytes() {
        let decoder = LineDecoder::new(TextEncoding::Utf8);
        let mut buf = b"partial".to_vec();
        assert_eq!(decoder.flush(&mut buf), Some("partial".to_string()));
        assert!(buf.is_empty());
        assert_eq!(decoder.flush(&mut buf), None);
    }

    #[test]
    fn flush_emits_a_lone_carriage_return_as_an_empty_line() {
        let decoder = LineDecoder::new(TextEncoding::Utf8);
        let mut buf = b"\r".to_vec();
        assert_eq!(decoder.flush(&mut buf), Some(String::new()));
        assert!(buf.is_empty());
    }
}
