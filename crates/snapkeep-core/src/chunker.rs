//! Fixed-size chunking and SHA-256 hashing.
//!
//! Files are split into non-overlapping ranges of exactly `chunk_size`
//! bytes with a possibly shorter tail. Every chunk is addressed by the
//! lowercase-hex SHA-256 of its bytes; identical content therefore maps to
//! the same address wherever it appears.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Result;

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Buffer size for streaming whole-file hashing.
const HASH_BUF_SIZE: usize = 64 * 1024;

/// One content-addressed chunk of a file.
#[derive(Debug, Clone)]
pub struct ChunkInfo {
    /// Lowercase hex SHA-256 of `data`.
    pub hash: String,
    pub size: u64,
    pub data: Vec<u8>,
}

/// Splits files into fixed-size hashed chunks.
#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self { chunk_size }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Read `path` and return its chunks in byte order. Each chunk owns a
    /// copy of its data, so memory is bounded by one read buffer plus the
    /// returned list.
    pub fn chunk_file(&self, path: &Path) -> Result<Vec<ChunkInfo>> {
        let mut file = File::open(path)?;
        let mut chunks = Vec::new();
        let mut buf = vec![0u8; self.chunk_size];

        loop {
            let n = read_full(&mut file, &mut buf)?;
            if n == 0 {
                break;
            }
            let data = buf[..n].to_vec();
            chunks.push(ChunkInfo {
                hash: hash_bytes(&data),
                size: n as u64,
                data,
            });
            if n < self.chunk_size {
                break;
            }
        }

        Ok(chunks)
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

/// Fill `buf` from `reader` until full or EOF. Returns bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Lowercase hex SHA-256 of a byte slice.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Stream a whole file through SHA-256 and return the lowercase hex digest.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
