//! HTTP response receiving
//!
//! The transport drives a response by asking for a buffer
//! ([`HttpResponse::next_buffer`]), reading socket bytes into it, and
//! reporting the count ([`HttpResponse::recv`]). Header bytes accumulate
//! until the blank line; after that, bytes flow into a [`Body`] sink that
//! undoes chunked framing and records the payload, either in memory or
//! straight into a downloaded file.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;

use super::chunk::ChunkParser;
use super::compress::{decode, EncodingType};

const NETWORK_BUF_SIZE: usize = 16 * 1024;

/// Result of feeding bytes to a body sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyState {
    Error,
    Ok,
    Incomplete,
}

/// Pull sink for response payload bytes.
///
/// The transport obtains a buffer from `next_buf`, fills some prefix of it
/// from the socket, and calls `process(n)`. `n == 0` signals EOF; a
/// negative `n` signals a transport error.
pub trait Body: Send {
    /// A non-empty buffer to receive into. Valid until the next call on
    /// this body.
    fn next_buf(&mut self) -> &mut [u8];

    /// Consume `n` bytes of the buffer returned by the last `next_buf`.
    fn process(&mut self, n: isize) -> BodyState;

    /// Total payload bytes produced so far (after dechunking).
    fn byte_count(&self) -> usize;
}

/// In-memory body: dechunks as bytes arrive and decodes the content
/// encoding once the transfer completes.
pub struct ParsedBody {
    content_length: Option<usize>,
    chunk_parser: Option<ChunkParser>,
    encoding: EncodingType,
    buf: Vec<u8>,
    dechunked: Vec<u8>,
    parsed: Vec<u8>,
    complete: bool,
    error: Option<String>,
}

impl ParsedBody {
    pub fn new(content_length: Option<usize>, is_chunked: bool, encoding: EncodingType) -> Self {
        Self {
            content_length,
            chunk_parser: is_chunked.then(ChunkParser::new),
            encoding,
            buf: vec![0u8; NETWORK_BUF_SIZE],
            dechunked: Vec::new(),
            parsed: Vec::new(),
            complete: false,
            error: None,
        }
    }

    /// The dechunked, decoded payload. Empty until `process` returns
    /// [`BodyState::Ok`].
    pub fn parsed_bytes(&self) -> &[u8] {
        &self.parsed
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn fail(&mut self, message: String) -> BodyState {
        self.error = Some(message);
        BodyState::Error
    }

    fn finalize(&mut self) -> BodyState {
        match decode(self.encoding, &self.dechunked) {
            Ok(parsed) => {
                self.parsed = parsed;
                self.complete = true;
                BodyState::Ok
            }
            Err(e) => self.fail(format!("{} decoding failed: {}", self.encoding.as_str(), e)),
        }
    }
}

impl Body for ParsedBody {
    fn next_buf(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn process(&mut self, n: isize) -> BodyState {
        if n < 0 {
            return self.fail("transport error while receiving body".to_string());
        }
        if n == 0 {
            // EOF from the peer.
            if let Some(parser) = &self.chunk_parser {
                if !parser.done() {
                    return self.fail("connection closed mid-chunk".to_string());
                }
                return BodyState::Ok;
            }
            if let Some(expected) = self.content_length {
                if self.dechunked.len() != expected {
                    return self.fail(format!(
                        "content length mismatch: expected {}, received {}",
                        expected,
                        self.dechunked.len()
                    ));
                }
            }
            return self.finalize();
        }

        let n = n as usize;
        let data: Vec<u8> = self.buf[..n].to_vec();
        if let Some(parser) = &mut self.chunk_parser {
            match parser.feed(&data, &mut self.dechunked) {
                Ok(true) => self.finalize(),
                Ok(false) => BodyState::Incomplete,
                Err(e) => self.fail(format!("chunked encoding error: {}", e)),
            }
        } else {
            self.dechunked.extend_from_slice(&data);
            match self.content_length {
                Some(expected) if self.dechunked.len() > expected => self.fail(format!(
                    "content length mismatch: expected {}, received {}",
                    expected,
                    self.dechunked.len()
                )),
                Some(expected) if self.dechunked.len() == expected => self.finalize(),
                // Unknown length: read until the peer closes.
                _ => BodyState::Incomplete,
            }
        }
    }

    fn byte_count(&self) -> usize {
        if self.complete {
            self.parsed.len()
        } else {
            self.dechunked.len()
        }
    }
}

/// Body that lands in a file: write to `<target>.tmp`, fsync, rename on a
/// complete transfer. Identity payloads stream straight to disk;
/// compressed payloads buffer and decode at EOF.
pub struct FileDownloadBody {
    target: PathBuf,
    tmp: PathBuf,
    file: Option<File>,
    content_length: Option<usize>,
    chunk_parser: Option<ChunkParser>,
    encoding: EncodingType,
    buf: Vec<u8>,
    /// Compressed payload accumulated for decode-at-EOF.
    pending: Vec<u8>,
    received: usize,
    written: usize,
    error: Option<String>,
    committed: bool,
}

impl FileDownloadBody {
    pub fn new(
        target: PathBuf,
        content_length: Option<usize>,
        is_chunked: bool,
        encoding: EncodingType,
    ) -> io::Result<Self> {
        let mut tmp = target.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let file = File::create(&tmp)?;
        Ok(Self {
            target,
            tmp,
            file: Some(file),
            content_length,
            chunk_parser: is_chunked.then(ChunkParser::new),
            encoding,
            buf: vec![0u8; NETWORK_BUF_SIZE],
            pending: Vec::new(),
            received: 0,
            written: 0,
            error: None,
            committed: false,
        })
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn fail(&mut self, message: String) -> BodyState {
        self.error = Some(message);
        self.file = None;
        let _ = fs::remove_file(&self.tmp);
        BodyState::Error
    }

    /// Route dechunked bytes: straight to disk for identity, buffered for
    /// compressed payloads.
    fn sink(&mut self, data: &[u8]) -> io::Result<()> {
        if self.encoding == EncodingType::Identity {
            if let Some(file) = &mut self.file {
                file.write_all(data)?;
                self.written += data.len();
            }
        } else {
            self.pending.extend_from_slice(data);
        }
        Ok(())
    }

    fn commit(&mut self) -> BodyState {
        if self.encoding != EncodingType::Identity {
            let pending = std::mem::take(&mut self.pending);
            let decoded = match decode(self.encoding, &pending) {
                Ok(decoded) => decoded,
                Err(e) => {
                    return self.fail(format!(
                        "{} decoding failed: {}",
                        self.encoding.as_str(),
                        e
                    ))
                }
            };
            if let Some(file) = &mut self.file {
                if let Err(e) = file.write_all(&decoded) {
                    return self.fail(format!("write failed: {}", e));
                }
                self.written += decoded.len();
            }
        }
        let Some(file) = self.file.take() else {
            return self.fail("download already finished".to_string());
        };
        if let Err(e) = file.sync_all() {
            return self.fail(format!("fsync failed: {}", e));
        }
        drop(file);
        if let Err(e) = fs::rename(&self.tmp, &self.target) {
            return self.fail(format!("rename failed: {}", e));
        }
        self.committed = true;
        BodyState::Ok
    }
}

impl Body for FileDownloadBody {
    fn next_buf(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn process(&mut self, n: isize) -> BodyState {
        if n < 0 {
            return self.fail("transport error while downloading".to_string());
        }
        if n == 0 {
            if let Some(parser) = &self.chunk_parser {
                if !parser.done() {
                    return self.fail("connection closed mid-chunk".to_string());
                }
                return BodyState::Ok;
            }
            if let Some(expected) = self.content_length {
                if self.received != expected {
                    return self.fail(format!(
                        "content length mismatch: expected {}, received {}",
                        expected, self.received
                    ));
                }
            }
            return self.commit();
        }

        let n = n as usize;
        let data: Vec<u8> = self.buf[..n].to_vec();
        if let Some(parser) = &mut self.chunk_parser {
            let mut dechunked = Vec::new();
            let done = match parser.feed(&data, &mut dechunked) {
                Ok(done) => done,
                Err(e) => return self.fail(format!("chunked encoding error: {}", e)),
            };
            self.received += dechunked.len();
            if let Err(e) = self.sink(&dechunked) {
                return self.fail(format!("write failed: {}", e));
            }
            if done {
                return self.commit();
            }
            BodyState::Incomplete
        } else {
            self.received += data.len();
            if let Some(expected) = self.content_length {
                if self.received > expected {
                    return self.fail(format!(
                        "content length mismatch: expected {}, received {}",
                        expected, self.received
                    ));
                }
            }
            if let Err(e) = self.sink(&data) {
                return self.fail(format!("write failed: {}", e));
            }
            if self.content_length == Some(self.received) {
                return self.commit();
            }
            BodyState::Incomplete
        }
    }

    fn byte_count(&self) -> usize {
        self.written.max(self.received)
    }
}

impl Drop for FileDownloadBody {
    fn drop(&mut self) {
        if !self.committed {
            self.file = None;
            let _ = fs::remove_file(&self.tmp);
        }
    }
}

enum ResponseKind {
    Parsed,
    FileDownload { target: PathBuf },
}

enum ResponseBody {
    None,
    Parsed(ParsedBody),
    FileDownload(FileDownloadBody),
}

/// One HTTP response in flight.
pub struct HttpResponse {
    kind: ResponseKind,
    scratch: Vec<u8>,
    raw_header: Vec<u8>,
    header_complete: bool,

    status_code: u16,
    content_length: Option<usize>,
    is_chunked: bool,
    encoding: EncodingType,
    connection_close: bool,

    body: ResponseBody,
    total_recv_len: usize,
    finished: bool,
    ok: bool,
    err_message: String,

    request_path: String,
    trace_id: String,
}

impl HttpResponse {
    /// A response whose payload is parsed into memory.
    pub fn new_parsed() -> Self {
        Self::with_kind(ResponseKind::Parsed)
    }

    /// A response whose payload is downloaded to `target` atomically.
    pub fn new_file_download(target: impl Into<PathBuf>) -> Self {
        Self::with_kind(ResponseKind::FileDownload {
            target: target.into(),
        })
    }

    fn with_kind(kind: ResponseKind) -> Self {
        Self {
            kind,
            scratch: vec![0u8; NETWORK_BUF_SIZE],
            raw_header: Vec::new(),
            header_complete: false,
            status_code: 0,
            content_length: None,
            is_chunked: false,
            encoding: EncodingType::Identity,
            connection_close: false,
            body: ResponseBody::None,
            total_recv_len: 0,
            finished: false,
            ok: false,
            err_message: String::new(),
            request_path: String::new(),
            trace_id: String::new(),
        }
    }

    pub fn set_request_path(&mut self, path: impl Into<String>) {
        self.request_path = path.into();
    }

    pub fn set_trace_id(&mut self, trace_id: impl Into<String>) {
        self.trace_id = trace_id.into();
    }

    /// Reset for a retry attempt. Keeps the kind and logging context.
    pub fn reset(&mut self) {
        self.raw_header.clear();
        self.header_complete = false;
        self.status_code = 0;
        self.content_length = None;
        self.is_chunked = false;
        self.encoding = EncodingType::Identity;
        self.connection_close = false;
        self.body = ResponseBody::None;
        self.total_recv_len = 0;
        self.finished = false;
        self.ok = false;
        self.err_message.clear();
    }

    pub fn has_header(&self) -> bool {
        self.header_complete
    }

    pub fn header(&self) -> String {
        String::from_utf8_lossy(&self.raw_header).into_owned()
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn total_recv_len(&self) -> usize {
        self.total_recv_len
    }

    /// Whether the transaction completed with a well-formed response.
    pub fn ok(&self) -> bool {
        self.ok
    }

    pub fn err_message(&self) -> &str {
        &self.err_message
    }

    pub fn has_connection_close(&self) -> bool {
        self.connection_close
    }

    /// The decoded in-memory payload (empty for file downloads).
    pub fn parsed_body(&self) -> &[u8] {
        match &self.body {
            ResponseBody::Parsed(body) => body.parsed_bytes(),
            _ => &[],
        }
    }

    /// Buffer for the transport to receive into.
    pub(crate) fn next_buffer(&mut self) -> &mut [u8] {
        if self.header_complete {
            match &mut self.body {
                ResponseBody::Parsed(body) => body.next_buf(),
                ResponseBody::FileDownload(body) => body.next_buf(),
                ResponseBody::None => &mut self.scratch,
            }
        } else {
            &mut self.scratch
        }
    }

    /// Report `n` bytes received into the last buffer (0 = EOF, negative =
    /// transport error). Returns true once the response is complete or
    /// failed; check [`HttpResponse::ok`].
    pub(crate) fn recv(&mut self, n: isize) -> bool {
        if self.finished {
            return true;
        }
        if n < 0 {
            self.body_process(-1);
            return self.finish_err("transport error while receiving response");
        }
        if n > 0 {
            self.total_recv_len += n as usize;
        }

        if !self.header_complete {
            return self.recv_header(n as usize);
        }
        self.recv_body(n)
    }

    fn recv_header(&mut self, n: usize) -> bool {
        if n == 0 {
            return self.finish_err("connection closed before response header");
        }
        let scratch: Vec<u8> = self.scratch[..n].to_vec();
        self.raw_header.extend_from_slice(&scratch);

        let Some(body_offset) = find_header_end(&self.raw_header) else {
            return false;
        };
        let leftover: Vec<u8> = self.raw_header.split_off(body_offset);
        if let Err(message) = self.parse_header() {
            return self.finish_err(&message);
        }
        if let Err(message) = self.make_body() {
            return self.finish_err(&message);
        }

        // No payload expected: complete the body immediately so a file
        // download still commits its (empty) target.
        if !self.is_chunked && self.content_length == Some(0) {
            return self.recv_body(0);
        }

        if !leftover.is_empty() {
            return self.feed_body_bytes(&leftover);
        }
        false
    }

    fn recv_body(&mut self, n: isize) -> bool {
        match self.body_process(n) {
            BodyState::Ok => {
                self.ok = true;
                self.finished = true;
                true
            }
            BodyState::Incomplete => false,
            BodyState::Error => {
                let message = self
                    .body_error()
                    .unwrap_or_else(|| "response body error".to_string());
                self.finish_err(&message)
            }
        }
    }

    /// Copy already-received bytes (the tail of the header read) through
    /// the body sink.
    fn feed_body_bytes(&mut self, mut data: &[u8]) -> bool {
        while !data.is_empty() {
            let (take, state) = {
                let body: &mut dyn Body = match &mut self.body {
                    ResponseBody::Parsed(body) => body,
                    ResponseBody::FileDownload(body) => body,
                    ResponseBody::None => return self.finish_err("no response body sink"),
                };
                let buf = body.next_buf();
                let take = buf.len().min(data.len());
                buf[..take].copy_from_slice(&data[..take]);
                (take, body.process(take as isize))
            };
            data = &data[take..];
            match state {
                BodyState::Ok => {
                    self.ok = true;
                    self.finished = true;
                    return true;
                }
                BodyState::Incomplete => {}
                BodyState::Error => {
                    let message = self
                        .body_error()
                        .unwrap_or_else(|| "response body error".to_string());
                    return self.finish_err(&message);
                }
            }
        }
        false
    }

    fn body_process(&mut self, n: isize) -> BodyState {
        match &mut self.body {
            ResponseBody::Parsed(body) => body.process(n),
            ResponseBody::FileDownload(body) => body.process(n),
            ResponseBody::None => BodyState::Error,
        }
    }

    fn body_error(&self) -> Option<String> {
        match &self.body {
            ResponseBody::Parsed(body) => body.error().map(str::to_string),
            ResponseBody::FileDownload(body) => body.error().map(str::to_string),
            ResponseBody::None => None,
        }
    }

    fn finish_err(&mut self, message: &str) -> bool {
        self.ok = false;
        self.finished = true;
        self.err_message = if self.request_path.is_empty() {
            message.to_string()
        } else {
            format!("{} ({})", message, self.request_path)
        };
        true
    }

    fn parse_header(&mut self) -> Result<(), String> {
        let header = String::from_utf8_lossy(&self.raw_header);
        let mut lines = header.split("\r\n");
        let status_line = lines.next().unwrap_or("");
        let mut parts = status_line.split_whitespace();
        let version = parts.next().unwrap_or("");
        if !version.starts_with("HTTP/1.") {
            return Err(format!("not an HTTP response: {:?}", status_line));
        }
        self.status_code = parts
            .next()
            .and_then(|code| code.parse().ok())
            .ok_or_else(|| format!("bad status line: {:?}", status_line))?;

        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();
            match name.as_str() {
                "content-length" => {
                    self.content_length = value.parse().ok();
                    if self.content_length.is_none() {
                        return Err(format!("bad Content-Length: {:?}", value));
                    }
                }
                "transfer-encoding" => {
                    self.is_chunked = value.eq_ignore_ascii_case("chunked");
                }
                "content-encoding" => {
                    self.encoding = EncodingType::from_content_encoding(Some(value));
                }
                "connection" => {
                    self.connection_close = value.eq_ignore_ascii_case("close");
                }
                _ => {}
            }
        }

        // These never carry a payload regardless of headers.
        if matches!(self.status_code, 204 | 304) {
            self.content_length = Some(0);
            self.is_chunked = false;
        }
        Ok(())
    }

    fn make_body(&mut self) -> Result<(), String> {
        self.body = match &self.kind {
            ResponseKind::Parsed => ResponseBody::Parsed(ParsedBody::new(
                self.content_length,
                self.is_chunked,
                self.encoding,
            )),
            ResponseKind::FileDownload { target } => ResponseBody::FileDownload(
                FileDownloadBody::new(
                    target.clone(),
                    self.content_length,
                    self.is_chunked,
                    self.encoding,
                )
                .map_err(|e| format!("cannot open download target: {}", e))?,
            ),
        };
        Ok(())
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Push raw wire bytes through a response the way the transport does.
    fn drive(resp: &mut HttpResponse, wire: &[u8]) -> bool {
        let mut rest = wire;
        while !rest.is_empty() {
            let buf = resp.next_buffer();
            let take = buf.len().min(rest.len());
            buf[..take].copy_from_slice(&rest[..take]);
            rest = &rest[take..];
            if resp.recv(take as isize) {
                return true;
            }
        }
        false
    }

    #[test]
    fn test_simple_response() {
        let mut resp = HttpResponse::new_parsed();
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        assert!(drive(&mut resp, wire));
        assert!(resp.ok());
        assert_eq!(resp.status_code(), 200);
        assert_eq!(resp.parsed_body(), b"hello");
    }

    #[test]
    fn test_chunked_response() {
        let mut resp = HttpResponse::new_parsed();
        let wire =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        assert!(drive(&mut resp, wire));
        assert!(resp.ok());
        assert_eq!(resp.parsed_body(), b"hello world");
    }

    #[test]
    fn test_gzip_response() {
        use std::io::Write as _;
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"compressed payload").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut wire = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Encoding: gzip\r\n\r\n",
            compressed.len()
        )
        .into_bytes();
        wire.extend_from_slice(&compressed);

        let mut resp = HttpResponse::new_parsed();
        assert!(drive(&mut resp, &wire));
        assert!(resp.ok());
        assert_eq!(resp.parsed_body(), b"compressed payload");
    }

    #[test]
    fn test_content_length_mismatch_short() {
        let mut resp = HttpResponse::new_parsed();
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhello";
        assert!(!drive(&mut resp, wire));
        // Peer closes early.
        assert!(resp.recv(0));
        assert!(!resp.ok());
        assert!(resp.err_message().contains("content length mismatch"));
    }

    #[test]
    fn test_content_length_mismatch_long() {
        let mut resp = HttpResponse::new_parsed();
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhello";
        assert!(drive(&mut resp, wire));
        assert!(!resp.ok());
        assert!(resp.err_message().contains("content length mismatch"));
    }

    #[test]
    fn test_no_content_status() {
        let mut resp = HttpResponse::new_parsed();
        assert!(drive(&mut resp, b"HTTP/1.1 204 No Content\r\n\r\n"));
        assert!(resp.ok());
        assert_eq!(resp.status_code(), 204);
    }

    #[test]
    fn test_read_until_close() {
        let mut resp = HttpResponse::new_parsed();
        assert!(!drive(&mut resp, b"HTTP/1.1 200 OK\r\n\r\npartial"));
        assert!(resp.recv(0));
        assert!(resp.ok());
        assert_eq!(resp.parsed_body(), b"partial");
    }

    #[test]
    fn test_connection_close_header() {
        let mut resp = HttpResponse::new_parsed();
        let wire = b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";
        assert!(drive(&mut resp, wire));
        assert!(resp.has_connection_close());
    }

    #[test]
    fn test_eof_before_header() {
        let mut resp = HttpResponse::new_parsed();
        assert!(resp.recv(0));
        assert!(!resp.ok());
        assert!(resp.err_message().contains("before response header"));
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc";
        let mut resp = HttpResponse::new_parsed();
        let mut finished = false;
        for byte in wire.iter() {
            let buf = resp.next_buffer();
            buf[0] = *byte;
            if resp.recv(1) {
                finished = true;
                break;
            }
        }
        assert!(finished);
        assert!(resp.ok());
        assert_eq!(resp.parsed_body(), b"abc");
    }

    #[test]
    fn test_parsed_body_byte_count() {
        let mut body = ParsedBody::new(Some(5), false, EncodingType::Identity);
        assert_eq!(body.byte_count(), 0);

        let buf = body.next_buf();
        buf[..5].copy_from_slice(b"hello");
        assert_eq!(body.process(5), BodyState::Ok);
        assert_eq!(body.byte_count(), 5);
        assert_eq!(body.parsed_bytes(), b"hello");
    }

    #[test]
    fn test_file_download_commits_atomically() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("artifact.o");

        let mut resp = HttpResponse::new_file_download(&target);
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nobject-code";
        assert!(drive(&mut resp, wire));
        assert!(resp.ok());
        assert_eq!(fs::read(&target).unwrap(), b"object-code");
        assert!(!dir.path().join("artifact.o.tmp").exists());
    }

    #[test]
    fn test_file_download_failure_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("artifact.o");

        let mut resp = HttpResponse::new_file_download(&target);
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nshort";
        assert!(!drive(&mut resp, wire));
        assert!(resp.recv(0));
        assert!(!resp.ok());
        assert!(!target.exists());
        assert!(!dir.path().join("artifact.o.tmp").exists());
    }

    #[test]
    fn test_file_download_chunked() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("artifact.o");

        let mut resp = HttpResponse::new_file_download(&target);
        let wire =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nobject\r\n5\r\n-code\r\n0\r\n\r\n";
        assert!(drive(&mut resp, wire));
        assert!(resp.ok());
        assert_eq!(fs::read(&target).unwrap(), b"object-code");
    }

    #[test]
    fn test_reset_for_retry() {
        let mut resp = HttpResponse::new_parsed();
        assert!(drive(
            &mut resp,
            b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n"
        ));
        assert_eq!(resp.status_code(), 500);

        resp.reset();
        assert!(!resp.has_header());
        assert!(drive(
            &mut resp,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"
        ));
        assert!(resp.ok());
        assert_eq!(resp.parsed_body(), b"ok");
    }
}
