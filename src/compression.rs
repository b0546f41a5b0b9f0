//! Payload compression for batched messages and cache entries.
//!
//! Two algorithms are supported, both via `flate2`: gzip (self-describing,
//! used for anything that might be inspected outside the gateway) and raw
//! deflate (slightly smaller, used internally for cache entries that are
//! only ever read back by this process).

use std::io::{Read, Write};

use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::errors::{ErrorTag, GatewayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Gzip,
    Deflate,
}

pub fn compress(data: &[u8], algorithm: Algorithm, level: u32) -> GatewayResult<Vec<u8>> {
    let level = Compression::new(level.min(9));
    let mut out = Vec::new();
    let result = match algorithm {
        Algorithm::Gzip => {
            let mut enc = GzEncoder::new(&mut out, level);
            enc.write_all(data).and_then(|_| enc.finish().map(|_| ()))
        }
        Algorithm::Deflate => {
            let mut enc = DeflateEncoder::new(&mut out, level);
            enc.write_all(data).and_then(|_| enc.finish().map(|_| ()))
        }
    };
    result.map_err(io_err)?;
    Ok(out)
}

pub fn decompress(data: &[u8], algorithm: Algorithm) -> GatewayResult<Vec<u8>> {
    let mut out = Vec::new();
    let result = match algorithm {
        Algorithm::Gzip => GzDecoder::new(data).read_to_end(&mut out),
        Algorithm::Deflate => DeflateDecoder::new(data).read_to_end(&mut out),
    };
    result.map_err(io_err)?;
    Ok(out)
}

fn io_err(e: std::io::Error) -> crate::errors::GatewayError {
    crate::errors::GatewayError::new(ErrorTag::ProcessingError, format!("compression error: {e}"))
}
