//! HTTP request construction and serialization

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;

/// Request body variants. Sized bodies (`Empty`, `Bytes`, `File`) are sent
/// with `Content-Length` and can be replayed on retry; an unbounded
/// `Stream` is sent with chunked transfer encoding and can be sent only
/// once.
pub enum RequestBody {
    Empty,
    Bytes(Vec<u8>),
    File { path: PathBuf, size: u64 },
    Stream(Box<dyn Read + Send>),
    /// A stream that has already been consumed by a previous attempt.
    Consumed,
}

/// One HTTP request. Built via [`super::HttpClient::init_request`], which
/// fills in host, authorization, cookie, and path prefix from the client
/// options.
pub struct HttpRequest {
    method: String,
    path: String,
    host: String,
    content_type: String,
    authorization: Option<String>,
    cookie: Option<String>,
    headers: Vec<(String, String)>,
    body: RequestBody,
}

const CHUNK_WRITE_SIZE: usize = 16 * 1024;

impl HttpRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            host: String::new(),
            content_type: "application/octet-stream".to_string(),
            authorization: None,
            cookie: None,
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The logical request path, before prefixing.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = host.into();
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = content_type.into();
    }

    pub fn set_authorization(&mut self, authorization: impl Into<String>) {
        self.authorization = Some(authorization.into());
    }

    pub fn set_cookie(&mut self, cookie: impl Into<String>) {
        self.cookie = Some(cookie.into());
    }

    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.push((key.into(), value.into()));
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = RequestBody::Bytes(body);
    }

    /// Upload a file of known size.
    pub fn set_body_file(&mut self, path: impl Into<PathBuf>, size: u64) {
        self.body = RequestBody::File {
            path: path.into(),
            size,
        };
    }

    /// Upload from an unbounded reader; the request is sent chunked.
    pub fn set_body_stream(&mut self, stream: Box<dyn Read + Send>) {
        self.body = RequestBody::Stream(stream);
    }

    /// Whether this request can be retried (its body is replayable).
    pub fn is_replayable(&self) -> bool {
        !matches!(self.body, RequestBody::Stream(_) | RequestBody::Consumed)
    }

    fn content_length(&self) -> Option<u64> {
        match &self.body {
            RequestBody::Empty => Some(0),
            RequestBody::Bytes(bytes) => Some(bytes.len() as u64),
            RequestBody::File { size, .. } => Some(*size),
            RequestBody::Stream(_) | RequestBody::Consumed => None,
        }
    }

    /// Build the header block for the given request-target. A known body
    /// size produces `Content-Length`; an unbounded body produces
    /// `Transfer-Encoding: chunked`.
    pub(crate) fn build_header(&self, request_target: &str) -> String {
        let mut header = String::with_capacity(256);
        header.push_str(&format!(
            "{} {} HTTP/1.1\r\n",
            self.method, request_target
        ));
        if !self.host.is_empty() {
            header.push_str(&format!("Host: {}\r\n", self.host));
        }
        header.push_str("User-Agent: offload-client\r\n");
        header.push_str(&format!("Content-Type: {}\r\n", self.content_type));
        header.push_str("Accept-Encoding: gzip, deflate\r\n");
        if let Some(authorization) = &self.authorization {
            header.push_str(&format!("Authorization: {}\r\n", authorization));
        }
        if let Some(cookie) = &self.cookie {
            header.push_str(&format!("Cookie: {}\r\n", cookie));
        }
        for (key, value) in &self.headers {
            header.push_str(&format!("{}: {}\r\n", key, value));
        }
        match self.content_length() {
            Some(len) => header.push_str(&format!("Content-Length: {}\r\n", len)),
            None => header.push_str("Transfer-Encoding: chunked\r\n"),
        }
        header.push_str("\r\n");
        header
    }

    /// Write the body to `w`. Returns the number of body bytes put on the
    /// wire (chunk framing included for streamed bodies).
    pub(crate) fn write_body<W: Write>(&mut self, w: &mut W) -> io::Result<u64> {
        match &mut self.body {
            RequestBody::Empty => Ok(0),
            RequestBody::Bytes(bytes) => {
                w.write_all(bytes)?;
                Ok(bytes.len() as u64)
            }
            RequestBody::File { path, size } => {
                let mut file = File::open(&*path)?;
                let written = io::copy(&mut file, w)?;
                if written != *size {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("file body size changed: expected {}, wrote {}", size, written),
                    ));
                }
                Ok(written)
            }
            RequestBody::Stream(stream) => {
                let mut written = 0u64;
                let mut buf = vec![0u8; CHUNK_WRITE_SIZE];
                loop {
                    let n = stream.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    let framed = format!("{:x}\r\n", n);
                    w.write_all(framed.as_bytes())?;
                    w.write_all(&buf[..n])?;
                    w.write_all(b"\r\n")?;
                    written += framed.len() as u64 + n as u64 + 2;
                }
                w.write_all(b"0\r\n\r\n")?;
                written += 5;
                self.body = RequestBody::Consumed;
                Ok(written)
            }
            RequestBody::Consumed => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "request body stream already consumed",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_with_content_length() {
        let mut req = HttpRequest::new("POST", "/exec");
        req.set_host("compile.example.com");
        req.set_body(b"payload".to_vec());

        let header = req.build_header("/prefix/exec");
        assert!(header.starts_with("POST /prefix/exec HTTP/1.1\r\n"));
        assert!(header.contains("Host: compile.example.com\r\n"));
        assert!(header.contains("Content-Length: 7\r\n"));
        assert!(header.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_header_authorization_and_cookie() {
        let mut req = HttpRequest::new("GET", "/ping");
        req.set_authorization("Bearer token");
        req.set_cookie("session=1");
        req.add_header("X-Trace-Id", "t-42");

        let header = req.build_header("/ping");
        assert!(header.contains("Authorization: Bearer token\r\n"));
        assert!(header.contains("Cookie: session=1\r\n"));
        assert!(header.contains("X-Trace-Id: t-42\r\n"));
    }

    #[test]
    fn test_stream_body_is_chunked() {
        let mut req = HttpRequest::new("POST", "/upload");
        req.set_body_stream(Box::new(&b"hello world"[..]));

        let header = req.build_header("/upload");
        assert!(header.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!header.contains("Content-Length"));

        let mut wire = Vec::new();
        req.write_body(&mut wire).unwrap();
        assert_eq!(wire, b"b\r\nhello world\r\n0\r\n\r\n");
        assert!(!req.is_replayable());
    }

    #[test]
    fn test_consumed_stream_cannot_replay() {
        let mut req = HttpRequest::new("POST", "/upload");
        req.set_body_stream(Box::new(&b"x"[..]));
        let mut wire = Vec::new();
        req.write_body(&mut wire).unwrap();
        assert!(req.write_body(&mut wire).is_err());
    }

    #[test]
    fn test_bytes_body_is_replayable() {
        let mut req = HttpRequest::new("POST", "/exec");
        req.set_body(b"abc".to_vec());
        let mut first = Vec::new();
        let mut second = Vec::new();
        req.write_body(&mut first).unwrap();
        req.write_body(&mut second).unwrap();
        assert_eq!(first, second);
        assert!(req.is_replayable());
    }
}
