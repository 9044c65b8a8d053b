//! Response content decoding
//!
//! Maps `Content-Encoding` header values to decoders. Decoding happens on
//! the dechunked body bytes once the transfer is complete.

use std::io::{self, Read};

/// Supported `Content-Encoding` values. Unknown encodings are treated as
/// identity so a misconfigured server degrades to a parse failure rather
/// than a dropped response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodingType {
    #[default]
    Identity,
    Deflate,
    Gzip,
    Brotli,
    Lzma,
}

impl EncodingType {
    /// Parse a `Content-Encoding` header value.
    pub fn from_content_encoding(value: Option<&str>) -> Self {
        let Some(value) = value else {
            return EncodingType::Identity;
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => EncodingType::Identity,
            "deflate" => EncodingType::Deflate,
            "gzip" | "x-gzip" => EncodingType::Gzip,
            "br" => EncodingType::Brotli,
            "lzma" | "x-lzma" => EncodingType::Lzma,
            other => {
                tracing::warn!(encoding = other, "unknown content encoding, assuming identity");
                EncodingType::Identity
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EncodingType::Identity => "identity",
            EncodingType::Deflate => "deflate",
            EncodingType::Gzip => "gzip",
            EncodingType::Brotli => "br",
            EncodingType::Lzma => "lzma",
        }
    }
}

/// Decode a complete body according to its content encoding.
pub fn decode(encoding: EncodingType, bytes: &[u8]) -> io::Result<Vec<u8>> {
    match encoding {
        EncodingType::Identity => Ok(bytes.to_vec()),
        EncodingType::Deflate => {
            let mut out = Vec::new();
            flate2::read::ZlibDecoder::new(bytes).read_to_end(&mut out)?;
            Ok(out)
        }
        EncodingType::Gzip => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(bytes).read_to_end(&mut out)?;
            Ok(out)
        }
        EncodingType::Brotli => {
            let mut out = Vec::new();
            brotli::Decompressor::new(bytes, 4096).read_to_end(&mut out)?;
            Ok(out)
        }
        EncodingType::Lzma => {
            let mut input = bytes;
            let mut out = Vec::new();
            lzma_rs::lzma_decompress(&mut input, &mut out)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("lzma: {:?}", e)))?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_parse_content_encoding() {
        assert_eq!(
            EncodingType::from_content_encoding(None),
            EncodingType::Identity
        );
        assert_eq!(
            EncodingType::from_content_encoding(Some("gzip")),
            EncodingType::Gzip
        );
        assert_eq!(
            EncodingType::from_content_encoding(Some(" Deflate ")),
            EncodingType::Deflate
        );
        assert_eq!(
            EncodingType::from_content_encoding(Some("br")),
            EncodingType::Brotli
        );
        assert_eq!(
            EncodingType::from_content_encoding(Some("x-lzma")),
            EncodingType::Lzma
        );
        assert_eq!(
            EncodingType::from_content_encoding(Some("snappy")),
            EncodingType::Identity
        );
    }

    #[test]
    fn test_identity_decode() {
        assert_eq!(decode(EncodingType::Identity, b"hello").unwrap(), b"hello");
    }

    #[test]
    fn test_gzip_decode() {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(b"compiler info payload").unwrap();
        let compressed = encoder.finish().unwrap();

        let decoded = decode(EncodingType::Gzip, &compressed).unwrap();
        assert_eq!(decoded, b"compiler info payload");
    }

    #[test]
    fn test_deflate_decode() {
        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(b"zlib framed deflate").unwrap();
        let compressed = encoder.finish().unwrap();

        let decoded = decode(EncodingType::Deflate, &compressed).unwrap();
        assert_eq!(decoded, b"zlib framed deflate");
    }

    #[test]
    fn test_corrupt_gzip_is_error() {
        assert!(decode(EncodingType::Gzip, b"definitely not gzip").is_err());
    }
}
