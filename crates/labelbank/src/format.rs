//! On-disk shard layout.
//!
//! Modeled on the durability layer's WAL segment format: a fixed magic +
//! version header, followed by fixed-size sections, closed by a CRC32
//! over the body. Unlike a WAL segment this file is written once (at
//! build time) and only ever read thereafter.
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │ Header (fixed)                             │
//! ├───────────────────────────────────────────┤
//! │ Matrix: count * dim * f32, row-major LE    │
//! ├───────────────────────────────────────────┤
//! │ Label-id table: count * u32 LE             │
//! ├───────────────────────────────────────────┤
//! │ Label dictionary: JSON, length-prefixed    │
//! ├───────────────────────────────────────────┤
//! │ Calibration block: JSON, length-prefixed   │
//! ├───────────────────────────────────────────┤
//! │ CRC32 of everything above (4 bytes, LE)    │
//! └───────────────────────────────────────────┘
//! ```

use crate::calibration::CalibrationTable;
use std::io::{self, Write};

/// Magic bytes identifying a LabelBank shard file.
pub const MAGIC: [u8; 4] = *b"LBK1";

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Fixed-size section preceding the variable-length body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// [`MAGIC`].
    pub magic: [u8; 4],
    /// [`FORMAT_VERSION`].
    pub format_version: u32,
    /// Embedding dimension.
    pub dim: u32,
    /// Number of exemplar rows.
    pub count: u32,
}

const HEADER_LEN: usize = 4 + 4 + 4 + 4;

impl Header {
    fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        out.write_all(&self.magic)?;
        out.write_all(&self.format_version.to_le_bytes())?;
        out.write_all(&self.dim.to_le_bytes())?;
        out.write_all(&self.count.to_le_bytes())?;
        Ok(())
    }

    fn read_from(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated shard header"));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        if magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad shard magic",
            ));
        }
        let format_version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let dim = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let count = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        Ok(Header {
            magic,
            format_version,
            dim,
            count,
        })
    }
}

/// Everything needed to serialize/deserialize a shard file body.
pub struct ShardBody {
    /// Row-major matrix, `count * dim` f32 values.
    pub matrix: Vec<f32>,
    /// Dim.
    pub dim: u32,
    /// Row index -> label id.
    pub label_ids: Vec<u32>,
    /// label id -> label string, dense, indexed by id.
    pub label_dict: Vec<String>,
    /// Calibration block.
    pub calibration: CalibrationTable,
}

/// Write a [`ShardBody`] to `out` in the on-disk layout described above.
pub fn write_shard(out: &mut impl Write, body: &ShardBody) -> io::Result<()> {
    let count = body.label_ids.len() as u32;
    let header = Header {
        magic: MAGIC,
        format_version: FORMAT_VERSION,
        dim: body.dim,
        count,
    };

    let mut buf = Vec::new();
    header.write_to(&mut buf)?;

    for v in &body.matrix {
        buf.write_all(&v.to_le_bytes())?;
    }
    for id in &body.label_ids {
        buf.write_all(&id.to_le_bytes())?;
    }

    let dict_json = serde_json::to_vec(&body.label_dict)?;
    buf.write_all(&(dict_json.len() as u64).to_le_bytes())?;
    buf.write_all(&dict_json)?;

    let calib_json = serde_json::to_vec(&body.calibration)?;
    buf.write_all(&(calib_json.len() as u64).to_le_bytes())?;
    buf.write_all(&calib_json)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf);
    let checksum = hasher.finalize();

    out.write_all(&buf)?;
    out.write_all(&checksum.to_le_bytes())?;
    Ok(())
}

/// Read a [`ShardBody`] back from raw file bytes, validating the checksum.
pub fn read_shard(bytes: &[u8]) -> io::Result<ShardBody> {
    if bytes.len() < 4 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "empty shard file"));
    }
    let body_len = bytes.len() - 4;
    let body = &bytes[..body_len];
    let stored_checksum = u32::from_le_bytes(bytes[body_len..].try_into().unwrap());

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    if hasher.finalize() != stored_checksum {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "shard checksum mismatch",
        ));
    }

    let header = Header::read_from(body)?;
    let mut cursor = HEADER_LEN;

    let matrix_len = header.dim as usize * header.count as usize;
    let mut matrix = Vec::with_capacity(matrix_len);
    for _ in 0..matrix_len {
        let bytes4: [u8; 4] = body[cursor..cursor + 4].try_into().unwrap();
        matrix.push(f32::from_le_bytes(bytes4));
        cursor += 4;
    }

    let mut label_ids = Vec::with_capacity(header.count as usize);
    for _ in 0..header.count as usize {
        let bytes4: [u8; 4] = body[cursor..cursor + 4].try_into().unwrap();
        label_ids.push(u32::from_le_bytes(bytes4));
        cursor += 4;
    }

    let dict_len = read_u64(body, &mut cursor) as usize;
    let label_dict: Vec<String> = serde_json::from_slice(&body[cursor..cursor + dict_len])?;
    cursor += dict_len;

    let calib_len = read_u64(body, &mut cursor) as usize;
    let calibration: CalibrationTable = serde_json::from_slice(&body[cursor..cursor + calib_len])?;
    cursor += calib_len;
    let _ = cursor;

    Ok(ShardBody {
        matrix,
        dim: header.dim,
        label_ids,
        label_dict,
        calibration,
    })
}

fn read_u64(buf: &[u8], cursor: &mut usize) -> u64 {
    let v = u64::from_le_bytes(buf[*cursor..*cursor + 8].try_into().unwrap());
    *cursor += 8;
    v
}

/// Stable structural hash over the fields that must round-trip identically
/// regardless of build-machine ordering: dim, count, sorted label
/// dictionary, and the quantized matrix bytes.
///
/// Used by [`crate::shard::Shard::open`] to validate that a shard file
/// matches expectations without re-deriving calibration or re-sorting
/// rows (`bench_struct_hash`, §4.1).
pub fn bench_struct_hash(body: &ShardBody) -> u64 {
    use xxhash_rust::xxh3::Xxh3;
    let mut hasher = Xxh3::new();
    hasher.update(&body.dim.to_le_bytes());
    hasher.update(&(body.label_ids.len() as u32).to_le_bytes());

    let mut sorted_dict = body.label_dict.clone();
    sorted_dict.sort();
    for label in &sorted_dict {
        hasher.update(label.as_bytes());
    }
    for v in &body.matrix {
        hasher.update(&v.to_le_bytes());
    }
    hasher.digest()
}

/// Read an entire file's bytes via `mmap`, then copy out into owned
/// memory. Copying at open time keeps the hot path free of page-fault
/// latency while still avoiding a second buffered read of the file.
pub fn mmap_read_all(file: &std::fs::File) -> io::Result<Vec<u8>> {
    // Safety: the shard file is immutable for the lifetime of a run
    // (§3 invariant); nothing else in this process writes to it concurrently.
    let mmap = unsafe { memmap2::Mmap::map(file)? };
    let mut buf = Vec::with_capacity(mmap.len());
    buf.extend_from_slice(&mmap[..]);
    Ok(buf)
}
