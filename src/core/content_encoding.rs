use std::io::{self, Read, Write};

use bytes::Bytes;

#[derive(Debug)]
pub(crate) struct CodecError {
    pub(crate) encoding: String,
    pub(crate) message: String,
}

fn codec_error(encoding: &str, error: impl std::fmt::Display) -> CodecError {
    CodecError {
        encoding: encoding.to_owned(),
        message: error.to_string(),
    }
}

pub(crate) fn is_encoding_supported(encoding: &str) -> bool {
    encoding.split(',').map(str::trim).all(|item| {
        matches!(
            item.to_ascii_lowercase().as_str(),
            "identity" | "gzip" | "deflate" | "br" | "zstd"
        )
    })
}

fn read_to_end<R: Read>(mut reader: R, encoding: &str) -> Result<Vec<u8>, CodecError> {
    let mut decoded = Vec::new();
    reader
        .read_to_end(&mut decoded)
        .map_err(|error: io::Error| codec_error(encoding, error))?;
    Ok(decoded)
}

/// Compress a request body for the declared `Content-Encoding`.
/// The caller has already checked `is_encoding_supported`.
pub(crate) fn compress(encoding: &str, body: &[u8]) -> Result<Bytes, CodecError> {
    let mut compressed = Bytes::copy_from_slice(body);
    for item in encoding.split(',').map(str::trim) {
        let encoded = match item.to_ascii_lowercase().as_str() {
            "identity" => continue,
            "gzip" => {
                let mut encoder =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder
                    .write_all(&compressed)
                    .and_then(|()| encoder.finish())
                    .map_err(|error| codec_error(item, error))?
            }
            "deflate" => {
                let mut encoder =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder
                    .write_all(&compressed)
                    .and_then(|()| encoder.finish())
                    .map_err(|error| codec_error(item, error))?
            }
            "br" => {
                let mut encoded = Vec::new();
                {
                    let mut encoder = brotli::CompressorWriter::new(&mut encoded, 4096, 5, 22);
                    encoder
                        .write_all(&compressed)
                        .and_then(|()| encoder.flush())
                        .map_err(|error| codec_error(item, error))?;
                }
                encoded
            }
            "zstd" => zstd::stream::encode_all(compressed.as_ref(), 0)
                .map_err(|error| codec_error(item, error))?,
            other => {
                return Err(CodecError {
                    encoding: other.to_owned(),
                    message: "unsupported content-encoding".to_owned(),
                });
            }
        };
        compressed = Bytes::from(encoded);
    }
    Ok(compressed)
}

/// Decode a response body per its `Content-Encoding` value. Codings are
/// undone right-to-left; an unknown coding leaves the body untouched so the
/// caller sees exactly what the server sent.
pub(crate) fn decode(encoding: &str, mut body: Bytes) -> Result<Bytes, CodecError> {
    let mut encodings = encoding
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect::<Vec<_>>();

    while let Some(item) = encodings.pop() {
        let decoded = match item.to_ascii_lowercase().as_str() {
            "identity" => continue,
            "gzip" => read_to_end(flate2::read::GzDecoder::new(body.as_ref()), item)?,
            "deflate" => read_to_end(flate2::read::ZlibDecoder::new(body.as_ref()), item)?,
            "br" => read_to_end(brotli::Decompressor::new(body.as_ref(), 4096), item)?,
            "zstd" => {
                let decoder = zstd::stream::read::Decoder::new(body.as_ref())
                    .map_err(|error| codec_error(item, error))?;
                read_to_end(decoder, item)?
            }
            _ => return Ok(body),
        };
        body = Bytes::from(decoded);
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_round_trip() {
        let payload = b"the quick brown fox jumps over the lazy dog";
        let compressed = compress("gzip", payload).expect("compress");
        assert_ne!(compressed.as_ref(), payload.as_slice());
        let decoded = decode("gzip", compressed).expect("decode");
        assert_eq!(decoded.as_ref(), payload.as_slice());
    }

    #[test]
    fn zstd_round_trip() {
        let payload = vec![42_u8; 4096];
        let compressed = compress("zstd", &payload).expect("compress");
        let decoded = decode("zstd", compressed).expect("decode");
        assert_eq!(decoded.as_ref(), payload.as_slice());
    }

    #[test]
    fn unknown_encoding_passes_body_through() {
        let body = Bytes::from_static(b"opaque");
        let decoded = decode("sdch", body.clone()).expect("unknown coding is a passthrough");
        assert_eq!(decoded, body);
    }

    #[test]
    fn stacked_encodings_are_undone_right_to_left() {
        let payload = b"layered";
        let inner = compress("deflate", payload).expect("deflate");
        let outer = compress("gzip", &inner).expect("gzip");
        let decoded = decode("deflate, gzip", outer).expect("decode stack");
        assert_eq!(decoded.as_ref(), payload.as_slice());
    }

    #[test]
    fn truncated_gzip_reports_decode_error() {
        let compressed = compress("gzip", b"payload").expect("compress");
        let truncated = compressed.slice(0..compressed.len() / 2);
        let error = decode("gzip", truncated).expect_err("truncated stream must fail");
        assert_eq!(error.encoding, "gzip");
    }

    #[test]
    fn supported_encoding_checks() {
        assert!(is_encoding_supported("gzip"));
        assert!(is_encoding_supported("gzip, br"));
        assert!(!is_encoding_supported("sdch"));
    }
}
