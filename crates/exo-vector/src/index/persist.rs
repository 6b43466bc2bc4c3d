//! On-disk index pair: `index.vec` plus `index.meta.jsonl`.
//!
//! `index.vec` layout (little-endian):
//!
//! | bytes | field |
//! |-------|-------|
//! | 8     | magic `EXOVEC1\0` |
//! | 4     | format version (u32) |
//! | 4     | dimension (u32) |
//! | 8     | vector count (u64) |
//! | 8     | sidecar length in bytes (u64) |
//! | 32    | SHA-256 of the sidecar bytes |
//! | 4 × dimension × count | f32 components, row-major |
//!
//! The sidecar holds one JSON `ChunkMetadata` per line, in vector order.
//! The vector file is renamed into place first, so a crash between the two
//! renames leaves a new vector file next to an old sidecar; the recorded
//! length and digest make that pair fail to load.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use exo_core::error::{ExoError, Result};
use exo_core::types::ChunkMetadata;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

pub const VECTOR_FILE: &str = "index.vec";
pub const METADATA_FILE: &str = "index.meta.jsonl";

const MAGIC: &[u8; 8] = b"EXOVEC1\0";
const FORMAT_VERSION: u32 = 1;
const DIGEST_LEN: usize = 32;
const HEADER_LEN: u64 = 8 + 4 + 4 + 8 + 8 + DIGEST_LEN as u64;

/// Length and digest of the sidecar a vector file was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PairToken {
    sidecar_len: u64,
    digest: [u8; DIGEST_LEN],
}

impl PairToken {
    fn of(sidecar: &[u8]) -> Self {
        Self {
            sidecar_len: sidecar.len() as u64,
            digest: Sha256::digest(sidecar).into(),
        }
    }
}

/// Raw contents of a persisted index.
#[derive(Debug)]
pub struct StoredPair {
    pub dimension: usize,
    pub vectors: Vec<Vec<f32>>,
    pub metadata: Vec<ChunkMetadata>,
}

/// Write both files through temp files, then rename vector file first.
pub fn write_pair(
    dir: &Path,
    dimension: usize,
    vectors: &[Vec<f32>],
    metadata: &[ChunkMetadata],
) -> Result<()> {
    if vectors.len() != metadata.len() {
        return Err(ExoError::IndexCorrupt(format!(
            "refusing to persist {} vectors with {} metadata records",
            vectors.len(),
            metadata.len()
        )));
    }
    let dim32 = u32::try_from(dimension)
        .map_err(|_| ExoError::Index(format!("dimension {} too large", dimension)))?;
    fs::create_dir_all(dir)?;

    let vec_tmp = dir.join(format!("{}.tmp", VECTOR_FILE));
    let meta_tmp = dir.join(format!("{}.tmp", METADATA_FILE));

    let mut sidecar = Vec::new();
    for record in metadata {
        serde_json::to_writer(&mut sidecar, record)?;
        sidecar.push(b'\n');
    }
    let token = PairToken::of(&sidecar);

    {
        let file = File::create(&vec_tmp)?;
        let mut w = BufWriter::new(file);
        w.write_all(MAGIC)?;
        w.write_all(&FORMAT_VERSION.to_le_bytes())?;
        w.write_all(&dim32.to_le_bytes())?;
        w.write_all(&(vectors.len() as u64).to_le_bytes())?;
        w.write_all(&token.sidecar_len.to_le_bytes())?;
        w.write_all(&token.digest)?;
        for v in vectors {
            for x in v {
                w.write_all(&x.to_le_bytes())?;
            }
        }
        let file = w.into_inner().map_err(|e| ExoError::Io(e.into_error()))?;
        file.sync_all()?;
    }

    {
        let mut file = File::create(&meta_tmp)?;
        file.write_all(&sidecar)?;
        file.sync_all()?;
    }

    fs::rename(&vec_tmp, dir.join(VECTOR_FILE))?;
    fs::rename(&meta_tmp, dir.join(METADATA_FILE))?;
    sync_dir(dir)?;

    info!(
        dir = %dir.display(),
        vectors = vectors.len(),
        dimension,
        "Index persisted"
    );
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

pub fn vector_path(dir: &Path) -> PathBuf {
    dir.join(VECTOR_FILE)
}

pub fn metadata_path(dir: &Path) -> PathBuf {
    dir.join(METADATA_FILE)
}

/// Read and validate both files. Any disagreement is `IndexCorrupt`.
pub fn read_pair(dir: &Path) -> Result<StoredPair> {
    let vec_path = vector_path(dir);
    let meta_path = metadata_path(dir);
    match (vec_path.exists(), meta_path.exists()) {
        (true, true) => {}
        (false, false) => {
            return Err(ExoError::Index(format!("no index found in {}", dir.display())))
        }
        (true, false) => {
            return Err(ExoError::IndexCorrupt(format!(
                "{} present without {}",
                VECTOR_FILE, METADATA_FILE
            )))
        }
        (false, true) => {
            return Err(ExoError::IndexCorrupt(format!(
                "{} present without {}",
                METADATA_FILE, VECTOR_FILE
            )))
        }
    }

    let (dimension, token, vectors) = read_vectors(&vec_path)?;
    let sidecar = fs::read(&meta_path)?;
    let metadata = parse_metadata(&sidecar)?;

    if vectors.len() != metadata.len() {
        return Err(ExoError::IndexCorrupt(format!(
            "{} vectors but {} metadata records",
            vectors.len(),
            metadata.len()
        )));
    }
    if PairToken::of(&sidecar) != token {
        return Err(ExoError::IndexCorrupt(format!(
            "{} was not written together with {}",
            METADATA_FILE, VECTOR_FILE
        )));
    }
    debug!(dir = %dir.display(), vectors = vectors.len(), "Index pair validated");
    Ok(StoredPair {
        dimension,
        vectors,
        metadata,
    })
}

fn read_vectors(path: &Path) -> Result<(usize, PairToken, Vec<Vec<f32>>)> {
    let file_len = fs::metadata(path)?.len();
    if file_len < HEADER_LEN {
        return Err(ExoError::IndexCorrupt(format!(
            "{} is {} bytes, shorter than its header",
            VECTOR_FILE, file_len
        )));
    }

    let mut r = BufReader::new(File::open(path)?);
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(ExoError::IndexCorrupt(format!("{} has a bad magic number", VECTOR_FILE)));
    }
    let mut u32_buf = [0u8; 4];
    r.read_exact(&mut u32_buf)?;
    let version = u32::from_le_bytes(u32_buf);
    if version != FORMAT_VERSION {
        return Err(ExoError::IndexCorrupt(format!(
            "unsupported {} version {}",
            VECTOR_FILE, version
        )));
    }
    r.read_exact(&mut u32_buf)?;
    let dimension = u32::from_le_bytes(u32_buf) as usize;
    let mut u64_buf = [0u8; 8];
    r.read_exact(&mut u64_buf)?;
    let count = u64::from_le_bytes(u64_buf);
    r.read_exact(&mut u64_buf)?;
    let sidecar_len = u64::from_le_bytes(u64_buf);
    let mut digest = [0u8; DIGEST_LEN];
    r.read_exact(&mut digest)?;
    let token = PairToken {
        sidecar_len,
        digest,
    };

    let expected = (dimension as u64)
        .checked_mul(count)
        .and_then(|c| c.checked_mul(4))
        .and_then(|c| c.checked_add(HEADER_LEN));
    if expected != Some(file_len) {
        return Err(ExoError::IndexCorrupt(format!(
            "{} header claims {} vectors of dimension {}, file is {} bytes",
            VECTOR_FILE, count, dimension, file_len
        )));
    }
    if count > 0 && dimension == 0 {
        return Err(ExoError::IndexCorrupt("zero-dimension vectors".into()));
    }

    let mut vectors = Vec::with_capacity(count as usize);
    let mut f32_buf = [0u8; 4];
    for _ in 0..count {
        let mut v = Vec::with_capacity(dimension);
        for _ in 0..dimension {
            r.read_exact(&mut f32_buf)?;
            v.push(f32::from_le_bytes(f32_buf));
        }
        vectors.push(v);
    }
    Ok((dimension, token, vectors))
}

fn parse_metadata(sidecar: &[u8]) -> Result<Vec<ChunkMetadata>> {
    let mut records = Vec::new();
    for (i, line) in sidecar.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: ChunkMetadata = serde_json::from_str(&line).map_err(|e| {
            ExoError::IndexCorrupt(format!("{} line {}: {}", METADATA_FILE, i + 1, e))
        })?;
        records.push(record);
    }
    Ok(records)
}
