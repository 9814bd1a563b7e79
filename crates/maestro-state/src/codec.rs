//! Storage envelope with transparent compression.
//!
//! Stored values carry a one-byte tag followed by the payload. Values whose
//! serialized form is strictly larger than 1 MiB are gzip-compressed; the
//! boundary value itself stays plain.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use maestro_core::{MaestroError, MaestroResult};
use std::io::{Read, Write};

/// Values strictly larger than this many serialized bytes are compressed.
pub const COMPRESSION_THRESHOLD: usize = 1024 * 1024;

const TAG_PLAIN: u8 = 0;
const TAG_GZIP: u8 = 1;

/// Wrap `payload` in the storage envelope, compressing when oversized.
pub fn encode(payload: &[u8]) -> MaestroResult<Vec<u8>> {
    if payload.len() <= COMPRESSION_THRESHOLD {
        let mut out = Vec::with_capacity(payload.len() + 1);
        out.push(TAG_PLAIN);
        out.extend_from_slice(payload);
        return Ok(out);
    }
    let mut encoder = GzEncoder::new(vec![TAG_GZIP], Compression::default());
    encoder.write_all(payload)?;
    Ok(encoder.finish()?)
}

/// Unwrap the storage envelope, decompressing when needed.
pub fn decode(stored: &[u8]) -> MaestroResult<Vec<u8>> {
    match stored.split_first() {
        Some((&TAG_PLAIN, payload)) => Ok(payload.to_vec()),
        Some((&TAG_GZIP, compressed)) => {
            let mut decoder = GzDecoder::new(compressed);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
        Some((tag, _)) => Err(MaestroError::Permanent(format!(
            "unknown storage envelope tag {tag}"
        ))),
        None => Err(MaestroError::Permanent("empty storage envelope".into())),
    }
}

/// Whether a stored value carries the compressed tag.
pub fn is_compressed(stored: &[u8]) -> bool {
    stored.first() == Some(&TAG_GZIP)
}
