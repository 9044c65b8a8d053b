//! Incremental chunked transfer-encoding decoder
//!
//! Consumes raw bytes as they arrive off the socket and appends the
//! dechunked payload to the caller's buffer. The parser is resumable at
//! any byte boundary: feed it whatever the socket produced and check
//! [`ChunkParser::done`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("invalid chunk size line: {0:?}")]
    InvalidSizeLine(String),

    #[error("chunk data not followed by CRLF")]
    MissingChunkTerminator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Reading the "<hex-size>[;ext]\r\n" line.
    SizeLine,
    /// Reading chunk payload bytes.
    Data,
    /// Reading the CRLF that terminates a chunk's payload.
    DataTerminator,
    /// Reading trailer lines after the terminal zero-size chunk.
    Trailer,
    Done,
}

/// Resumable chunked-body decoder.
pub struct ChunkParser {
    state: ParseState,
    remaining: usize,
    line: Vec<u8>,
}

impl ChunkParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::SizeLine,
            remaining: 0,
            line: Vec::new(),
        }
    }

    /// Whether the terminal chunk and trailers have been consumed.
    pub fn done(&self) -> bool {
        self.state == ParseState::Done
    }

    /// Feed raw bytes, appending dechunked payload to `out`. Returns
    /// whether the body is complete.
    pub fn feed(&mut self, mut input: &[u8], out: &mut Vec<u8>) -> Result<bool, ChunkError> {
        while !input.is_empty() {
            match self.state {
                ParseState::SizeLine => {
                    match take_line(&mut self.line, &mut input) {
                        Some(line) => {
                            let size = parse_chunk_size(&line)?;
                            if size == 0 {
                                self.state = ParseState::Trailer;
                            } else {
                                self.remaining = size;
                                self.state = ParseState::Data;
                            }
                        }
                        None => break,
                    }
                }
                ParseState::Data => {
                    let take = self.remaining.min(input.len());
                    out.extend_from_slice(&input[..take]);
                    input = &input[take..];
                    self.remaining -= take;
                    if self.remaining == 0 {
                        self.state = ParseState::DataTerminator;
                    }
                }
                ParseState::DataTerminator => match take_line(&mut self.line, &mut input) {
                    Some(line) => {
                        if !line.is_empty() {
                            return Err(ChunkError::MissingChunkTerminator);
                        }
                        self.state = ParseState::SizeLine;
                    }
                    None => break,
                },
                ParseState::Trailer => match take_line(&mut self.line, &mut input) {
                    Some(line) => {
                        if line.is_empty() {
                            self.state = ParseState::Done;
                        }
                    }
                    None => break,
                },
                ParseState::Done => break,
            }
        }
        Ok(self.done())
    }
}

impl Default for ChunkParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulate bytes into `pending` until a LF; returns the completed line
/// without its CR/LF, or `None` if more input is needed.
fn take_line(pending: &mut Vec<u8>, input: &mut &[u8]) -> Option<Vec<u8>> {
    match input.iter().position(|&b| b == b'\n') {
        Some(pos) => {
            pending.extend_from_slice(&input[..pos]);
            *input = &input[pos + 1..];
            let mut line = std::mem::take(pending);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            Some(line)
        }
        None => {
            pending.extend_from_slice(input);
            *input = &[];
            None
        }
    }
}

/// Parse "<hex-size>[;extension]".
fn parse_chunk_size(line: &[u8]) -> Result<usize, ChunkError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ChunkError::InvalidSizeLine(String::from_utf8_lossy(line).into_owned()))?;
    let size_part = text.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(size_part, 16)
        .map_err(|_| ChunkError::InvalidSizeLine(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dechunk(input: &[u8]) -> (Vec<u8>, bool) {
        let mut parser = ChunkParser::new();
        let mut out = Vec::new();
        let done = parser.feed(input, &mut out).unwrap();
        (out, done)
    }

    #[test]
    fn test_single_chunk() {
        let (out, done) = dechunk(b"5\r\nhello\r\n0\r\n\r\n");
        assert_eq!(out, b"hello");
        assert!(done);
    }

    #[test]
    fn test_multiple_chunks() {
        let (out, done) = dechunk(b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n");
        assert_eq!(out, b"hello world");
        assert!(done);
    }

    #[test]
    fn test_chunk_extension_ignored() {
        let (out, done) = dechunk(b"5;name=value\r\nhello\r\n0\r\n\r\n");
        assert_eq!(out, b"hello");
        assert!(done);
    }

    #[test]
    fn test_trailers_consumed() {
        let (out, done) = dechunk(b"3\r\nabc\r\n0\r\nX-Trailer: v\r\n\r\n");
        assert_eq!(out, b"abc");
        assert!(done);
    }

    #[test]
    fn test_byte_at_a_time() {
        let input = b"a\r\n0123456789\r\n0\r\n\r\n";
        let mut parser = ChunkParser::new();
        let mut out = Vec::new();
        for byte in input.iter() {
            parser.feed(std::slice::from_ref(byte), &mut out).unwrap();
        }
        assert_eq!(out, b"0123456789");
        assert!(parser.done());
    }

    #[test]
    fn test_incomplete_body_not_done() {
        let (out, done) = dechunk(b"5\r\nhel");
        assert_eq!(out, b"hel");
        assert!(!done);
    }

    #[test]
    fn test_invalid_size_line() {
        let mut parser = ChunkParser::new();
        let mut out = Vec::new();
        assert!(parser.feed(b"zz\r\n", &mut out).is_err());
    }

    #[test]
    fn test_missing_terminator() {
        let mut parser = ChunkParser::new();
        let mut out = Vec::new();
        assert!(parser.feed(b"3\r\nabcX\r\n", &mut out).is_err());
    }
}
