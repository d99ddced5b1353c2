// src/hash.rs

//! SHA-256 helpers for source checksums, lockfile entries and wheel RECORD files

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const BUF_SIZE: usize = 64 * 1024;

fn digest_reader<R: Read>(mut reader: R) -> io::Result<(Vec<u8>, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hasher.finalize().to_vec(), total))
}

/// Hex-encoded SHA-256 of a file, streamed in fixed-size chunks
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let (digest, _) = digest_reader(File::open(path)?)?;
    Ok(hex::encode(digest))
}

/// Hex-encoded SHA-256 of an in-memory buffer
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// RECORD-style digest of a file: `sha256=<urlsafe base64, unpadded>` and its size
pub fn record_digest(path: &Path) -> io::Result<(String, u64)> {
    let (digest, size) = digest_reader(File::open(path)?)?;
    Ok((format!("sha256={}", URL_SAFE_NO_PAD.encode(digest)), size))
}
