//! Append-only binary ledger.
//!
//! Layout (little-endian):
//!
//! ```text
//! header:  "BLKC" | version u32 | created u32 | block_count u32
//! record:  len u32 | bincode(Block) (len bytes) | checksum (4 bytes)
//! ```
//!
//! - The checksum is the first 4 bytes of blake3 over the encoded block
//! - Every append is fsynced before the header count is advanced; the count
//!   is the commit point
//! - Every counted record must be whole and pass its checksum, otherwise the
//!   file is corrupt and nothing is modified
//! - Bytes after the counted records are an interrupted append and are
//!   truncated on open

use super::PersistenceError;
use crate::types::Block;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const MAGIC: &[u8; 4] = b"BLKC";
pub const VERSION: u32 = 1;
pub const HEADER_LEN: usize = 16;
/// Upper bound on one encoded block; larger length prefixes are treated as garbage.
pub const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub created: u32,
    pub block_count: u32,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(MAGIC);
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..12].copy_from_slice(&self.created.to_le_bytes());
        out[12..16].copy_from_slice(&self.block_count.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self, PersistenceError> {
        if bytes.len() < HEADER_LEN {
            return Err(PersistenceError::Corrupt(format!("short header: {} bytes", bytes.len())));
        }
        if &bytes[..4] != MAGIC {
            return Err(PersistenceError::BadMagic);
        }
        let u32_at = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let version = u32_at(4);
        if version != VERSION {
            return Err(PersistenceError::UnsupportedVersion(version));
        }
        Ok(Self { version, created: u32_at(8), block_count: u32_at(12) })
    }
}

fn checksum(body: &[u8]) -> [u8; 4] {
    let h = blake3::hash(body);
    let mut out = [0u8; 4];
    out.copy_from_slice(&h.as_bytes()[..4]);
    out
}

pub fn encode_record(block: &Block) -> Result<Vec<u8>, PersistenceError> {
    let body = bincode::serialize(block).map_err(|e| PersistenceError::Encode(e.to_string()))?;
    let mut out = Vec::with_capacity(body.len() + 8);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&checksum(&body));
    Ok(out)
}

/// Result of validating a ledger image.
#[derive(Debug, Clone)]
pub struct Scan {
    pub header: Header,
    /// Byte ranges of the encoded block bodies, in file order.
    pub bodies: Vec<Range<usize>>,
    /// Offset of uncounted bytes after the last counted record, if any.
    pub torn_at: Option<usize>,
}

impl Scan {
    /// Length of the committed prefix of the image.
    pub fn valid_len(&self) -> usize {
        self.bodies.last().map_or(HEADER_LEN, |r| r.end + 4)
    }
}

/// Frame `count` records at the front of `bytes`, which starts at file
/// offset `base`. `first` numbers them in errors.
fn frame_records(
    bytes: &[u8],
    base: usize,
    count: usize,
    first: usize,
) -> Result<(Vec<Range<usize>>, usize), PersistenceError> {
    let mut bodies = Vec::with_capacity(count);
    let mut pos = 0;
    for i in first..first + count {
        let at = base + pos;
        let rest = &bytes[pos..];
        if rest.len() < 4 {
            return Err(PersistenceError::Corrupt(format!("record {i} at offset {at}: missing length")));
        }
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if len > MAX_RECORD_LEN || len + 8 > rest.len() {
            return Err(PersistenceError::Corrupt(format!("record {i} at offset {at}: length {len} runs past the file")));
        }
        let body = pos + 4..pos + 4 + len;
        if checksum(&bytes[body.clone()]) != bytes[body.end..body.end + 4] {
            return Err(PersistenceError::Corrupt(format!("checksum mismatch in record {i} at offset {at}")));
        }
        bodies.push(base + body.start..base + body.end);
        pos = body.end + 4;
    }
    Ok((bodies, base + pos))
}

/// Validate header and the counted records of an in-memory ledger image.
pub fn scan(bytes: &[u8]) -> Result<Scan, PersistenceError> {
    let header = Header::decode(bytes)?;
    let (bodies, end) = frame_records(&bytes[HEADER_LEN..], HEADER_LEN, header.block_count as usize, 0)?;
    let torn_at = (end < bytes.len()).then_some(end);
    Ok(Scan { header, bodies, torn_at })
}

pub fn decode_body(body: &[u8]) -> Result<Block, PersistenceError> {
    bincode::deserialize(body).map_err(|e| PersistenceError::Corrupt(format!("block decode: {e}")))
}

/// Decode every counted block of a ledger image.
pub fn read_blocks(bytes: &[u8]) -> Result<Vec<Block>, PersistenceError> {
    let s = scan(bytes)?;
    s.bodies.iter().map(|r| decode_body(&bytes[r.clone()])).collect()
}

pub struct BinaryLedger {
    path: PathBuf,
    file: Mutex<File>,
    header: Header,
    /// (offset, len) of each block body; index == height.
    records: Vec<(u64, u32)>,
    end: u64,
}

impl BinaryLedger {
    /// Open or create the ledger file. Uncounted trailing bytes are
    /// truncated with a warning; a damaged counted record is an error.
    pub fn open(path: impl AsRef<Path>, now: u64) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        if bytes.is_empty() {
            let header = Header { version: VERSION, created: now.min(u32::MAX as u64) as u32, block_count: 0 };
            file.write_all(&header.encode())?;
            file.sync_all()?;
            return Ok(Self { path, file: Mutex::new(file), header, records: Vec::new(), end: HEADER_LEN as u64 });
        }

        let s = scan(&bytes)?;
        let end = s.valid_len();
        if let Some(at) = s.torn_at {
            warn!(path = %path.display(), offset = at, dropped = bytes.len() - end, "truncating uncommitted ledger tail");
            file.set_len(end as u64)?;
            file.sync_all()?;
        }
        let records = s.bodies.iter().map(|r| (r.start as u64, (r.end - r.start) as u32)).collect();
        Ok(Self { path, file: Mutex::new(file), header: s.header, records, end: end as u64 })
    }

    fn disk_header(f: &mut File) -> Result<Header, PersistenceError> {
        let mut buf = [0u8; HEADER_LEN];
        f.seek(SeekFrom::Start(0))?;
        f.read_exact(&mut buf)?;
        Header::decode(&buf)
    }

    /// Pick up records another handle committed since this one last looked.
    /// Returns how many were added.
    pub fn refresh(&mut self) -> Result<usize, PersistenceError> {
        let mut f = self.file.lock();
        let disk = Self::disk_header(&mut f)?;
        let known = self.records.len();
        let count = disk.block_count as usize;
        if count == known {
            return Ok(0);
        }
        if count < known {
            return Err(PersistenceError::Corrupt(format!("block count fell from {known} to {count}")));
        }
        let mut bytes = Vec::new();
        f.seek(SeekFrom::Start(self.end))?;
        f.read_to_end(&mut bytes)?;
        drop(f);

        let (bodies, end) = frame_records(&bytes, self.end as usize, count - known, known)?;
        self.records.extend(bodies.iter().map(|r| (r.start as u64, (r.end - r.start) as u32)));
        self.end = end as u64;
        self.header = disk;
        Ok(count - known)
    }

        pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> Header {
        self.header
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append one block and advance the header count. Fails with `Stale`
    /// if the file gained blocks this handle has not seen.
    pub fn append(&mut self, block: &Block) -> Result<(), PersistenceError> {
        let rec = encode_record(block)?;
        let mut f = self.file.lock();
        let disk = Self::disk_header(&mut f)?;
        if disk.block_count != self.header.block_count {
            return Err(PersistenceError::Stale { known: self.header.block_count, on_disk: disk.block_count });
        }
        f.set_len(self.end)?;
        f.seek(SeekFrom::Start(self.end))?;
        f.write_all(&rec)?;
        f.sync_data()?;

        let count = self.header.block_count + 1;
        f.seek(SeekFrom::Start(12))?;
        f.write_all(&count.to_le_bytes())?;
        f.sync_data()?;
        drop(f);

        self.header.block_count = count;
        self.records.push((self.end + 4, (rec.len() - 8) as u32));
        self.end += rec.len() as u64;
        Ok(())
    }

    /// Block at position `i` (== height for a well-formed chain).
    pub fn read(&self, i: usize) -> Result<Option<Block>, PersistenceError> {
        let Some(&(offset, len)) = self.records.get(i) else { return Ok(None) };
        let mut buf = vec![0u8; len as usize + 4];
        {
            let mut f = self.file.lock();
            f.seek(SeekFrom::Start(offset))?;
            f.read_exact(&mut buf)?;
        }
        let (body, sum) = buf.split_at(len as usize);
        if checksum(body) != sum {
            return Err(PersistenceError::Corrupt(format!("checksum mismatch in record {i}")));
        }
        decode_body(body).map(Some)
    }

    /// Re-read and re-validate the whole file.
    pub fn read_all(&self) -> Result<Vec<Block>, PersistenceError> {
        let mut bytes = Vec::new();
        {
            let mut f = self.file.lock();
            f.seek(SeekFrom::Start(0))?;
            f.read_to_end(&mut bytes)?;
        }
        read_blocks(&bytes)
    }
}
