//! Bytes-to-lines reassembly.
//!
//! Stateful: a delivery that ends mid-line leaves a fragment that is
//! prepended to the next delivery, so the emitted line sequence is
//! independent of how the transport happened to chunk the underlying bytes.

/// Converts a byte stream into complete, newline-stripped lines.
///
/// Not UTF-8-only: invalid bytes are never fatal, they are replaced with an
/// escaped, printable representation so logging and parsing can continue.
#[derive(Debug, Default)]
pub struct LineReassembler {
    fragment: Option<String>,
}

impl LineReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning zero or more complete, empty-line-filtered lines.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let decoded = decode_lossy(bytes);
        let combined = match self.fragment.take() {
            Some(fragment) => fragment + &decoded,
            None => decoded,
        };

        let mut lines = Vec::new();
        let mut rest = combined.as_str();
        while let Some(idx) = rest.find('\n') {
            let (piece, remainder) = rest.split_at(idx + 1);
            rest = remainder;
            let trimmed = piece.trim_end_matches(['\n', '\r']);
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }

        if !rest.is_empty() {
            self.fragment = Some(rest.to_string());
        }
        lines
    }
}

/// Decodes `bytes` as UTF-8, substituting a printable ASCII-escaped
/// representation for any invalid byte rather than failing the whole read.
/// Valid runs (including newlines) are passed through untouched so line
/// framing survives a stray invalid byte elsewhere in the chunk.
fn decode_lossy(bytes: &[u8]) -> String {
    let mut out = String::new();
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                out.push_str(s);
                break;
            }
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                out.push_str(std::str::from_utf8(&rest[..valid_up_to]).expect("prefix validated by valid_up_to"));
                let invalid_len = err.error_len().unwrap_or(rest.len() - valid_up_to);
                let escaped = rest[valid_up_to..valid_up_to + invalid_len].escape_ascii();
                out.push_str(&String::from_utf8(escaped.collect()).expect("ascii-escaping bytes always yields valid utf-8"));
                rest = &rest[valid_up_to + invalid_len..];
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk_with_multiple_lines() {
        let mut r = LineReassembler::new();
        let lines = r.feed(b"ok\nok T:1.0\n\nok C: X:1 Y:2 Z:3\n");
        assert_eq!(lines, vec!["ok", "ok T:1.0", "ok C: X:1 Y:2 Z:3"]);
    }

    #[test]
    fn byte_boundary_agnostic() {
        let input: &[u8] = b"ok\nok T:1.0 /0.0\nG1 X1\n<Idle|MPos:1,2,3|WPos:0,0,0>\n";
        let mut whole = LineReassembler::new();
        let expected = whole.feed(input);

        // Feed the exact same bytes split at every possible boundary and
        // confirm the line sequence never changes.
        for split in 1..input.len() {
            let mut chunked = LineReassembler::new();
            let mut got = chunked.feed(&input[..split]);
            got.extend(chunked.feed(&input[split..]));
            assert_eq!(got, expected, "split at {split} produced a different line sequence");
        }
    }

    #[test]
    fn fragment_persists_across_calls_without_newline() {
        let mut r = LineReassembler::new();
        assert!(r.feed(b"ok T:1").is_empty());
        let lines = r.feed(b".0 /0.0\n");
        assert_eq!(lines, vec!["ok T:1.0 /0.0"]);
    }

    #[test]
    fn invalid_utf8_is_escaped_not_fatal() {
        let mut r = LineReassembler::new();
        let lines = r.feed(&[0xff, 0xfe, b'\n']);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("\\x"));
    }
}
