//! ISO9660 directory walker.
//!
//! Reads the primary volume descriptor, then walks directory extents with an
//! explicit worklist. Extents already visited are skipped, so a corrupt or
//! hostile image with directory loops still terminates.

use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};
use std::time::SystemTime;

use chrono::{FixedOffset, NaiveDate, TimeZone};
use tracing::warn;

use crate::error::{FsError, FsResult};

/// First volume descriptor sector.
const DESCRIPTOR_START: u64 = 16;
const SECTOR: u64 = 2048;
const PRIMARY: u8 = 1;
const TERMINATOR: u8 = 255;
/// Guard against images that never terminate their descriptor set.
const MAX_DESCRIPTORS: u64 = 64;
const FLAG_DIRECTORY: u8 = 0x02;
/// Largest directory extent read into memory.
const MAX_DIRECTORY_EXTENT: u64 = 16 * 1024 * 1024;

/// One file or directory inside an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoEntry {
    /// Absolute path inside the image, `/` separated.
    pub path: String,
    pub modified: Option<SystemTime>,
    pub size: u64,
    pub is_dir: bool,
    /// First logical block of the entry's data.
    pub extent: u32,
}

impl IsoEntry {
    /// Byte offset of the entry data within the image.
    pub fn offset(&self, block_size: u64) -> u64 {
        self.extent as u64 * block_size
    }
}

/// Walk result: every entry plus the image's logical block size.
#[derive(Debug, Clone)]
pub struct Walk {
    pub block_size: u64,
    pub entries: Vec<IsoEntry>,
}

fn malformed(reason: impl Into<String>) -> FsError {
    FsError::backend(format!("not a valid ISO9660 image: {}", reason.into()))
}

fn u16_le(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn u32_le(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Seven-byte directory record date: years since 1900, month, day, hour,
/// minute, second, GMT offset in 15 minute steps.
fn record_date(raw: &[u8]) -> Option<SystemTime> {
    let date = NaiveDate::from_ymd_opt(1900 + raw[0] as i32, raw[1] as u32, raw[2] as u32)?;
    let naive = date.and_hms_opt(raw[3] as u32, raw[4] as u32, raw[5] as u32)?;
    let offset = FixedOffset::east_opt(raw[6] as i8 as i32 * 15 * 60)?;
    let stamped = offset.from_local_datetime(&naive).single()?;
    Some(stamped.into())
}

/// `NAME.EXT;1` → `NAME.EXT`, `DIR.` → `DIR`.
///
/// Returns `None` for names that cannot be a single path component: empty,
/// `.`, `..`, or anything holding a separator or NUL.
fn clean_name(raw: &[u8]) -> Option<String> {
    let name = String::from_utf8_lossy(raw);
    let name = name.split(';').next().unwrap_or("");
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return None;
    }
    Some(name.to_string())
}

struct Record {
    len: usize,
    extent: u32,
    size: u32,
    modified: Option<SystemTime>,
    is_dir: bool,
    /// Raw file identifier; `[0]` and `[1]` are the `.` and `..` entries.
    raw_name: Vec<u8>,
}

fn parse_record(buf: &[u8]) -> FsResult<Record> {
    let len = buf[0] as usize;
    if len < 34 || len > buf.len() {
        return Err(malformed("truncated directory record"));
    }
    let name_len = buf[32] as usize;
    if 33 + name_len > len {
        return Err(malformed("directory record name overflows"));
    }
    let raw_name = &buf[33..33 + name_len];
    Ok(Record {
        len,
        extent: u32_le(buf, 2),
        size: u32_le(buf, 10),
        modified: record_date(&buf[18..25]),
        is_dir: buf[25] & FLAG_DIRECTORY != 0,
        raw_name: raw_name.to_vec(),
    })
}

fn read_at<R: Read + Seek>(image: &mut R, offset: u64, len: u64) -> FsResult<Vec<u8>> {
    let image_len = image.seek(SeekFrom::End(0))?;
    let available = image_len.saturating_sub(offset);
    if len > available {
        return Err(malformed(format!(
            "extent of {len} bytes at {offset} runs past the {image_len} byte image"
        )));
    }
    image.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len as usize];
    image
        .read_exact(&mut buf)
        .map_err(|e| malformed(format!("short read at {offset}: {e}")))?;
    Ok(buf)
}

/// Root directory record of the primary volume descriptor, plus block size.
fn primary_root<R: Read + Seek>(image: &mut R) -> FsResult<(Record, u64)> {
    for index in 0..MAX_DESCRIPTORS {
        let sector = read_at(image, (DESCRIPTOR_START + index) * SECTOR, SECTOR)?;
        if &sector[1..6] != b"CD001" {
            return Err(malformed("missing CD001 signature"));
        }
        match sector[0] {
            PRIMARY => {
                let block_size = u16_le(&sector, 128) as u64;
                if block_size == 0 {
                    return Err(malformed("zero logical block size"));
                }
                let root = parse_record(&sector[156..190])?;
                return Ok((root, block_size));
            }
            TERMINATOR => break,
            _ => continue,
        }
    }
    Err(malformed("no primary volume descriptor"))
}

/// Enumerate every entry of the image.
pub fn walk<R: Read + Seek>(image: &mut R) -> FsResult<Walk> {
    let (root, block_size) = primary_root(image)?;

    let mut entries = Vec::new();
    let mut visited = HashSet::new();
    let mut worklist = vec![(String::new(), root.extent, root.size)];

    while let Some((dir_path, extent, size)) = worklist.pop() {
        if !visited.insert(extent) {
            continue;
        }
        if size as u64 > MAX_DIRECTORY_EXTENT {
            return Err(malformed(format!(
                "directory extent of {size} bytes exceeds {MAX_DIRECTORY_EXTENT}"
            )));
        }
        let data = read_at(image, extent as u64 * block_size, size as u64)?;

        let mut pos = 0usize;
        while pos < data.len() {
            if data[pos] == 0 {
                // Records never straddle blocks; zero padding runs to the next one.
                let block = block_size as usize;
                pos = (pos / block + 1) * block;
                continue;
            }
            let record = parse_record(&data[pos..])?;
            pos += record.len;

            if matches!(record.raw_name.as_slice(), [0] | [1]) {
                continue;
            }
            let Some(name) = clean_name(&record.raw_name) else {
                warn!(
                    dir = %dir_path,
                    name = %String::from_utf8_lossy(&record.raw_name),
                    "skipping ISO entry with unusable name"
                );
                continue;
            };
            let path = format!("{dir_path}/{name}");
            if record.is_dir {
                worklist.push((path.clone(), record.extent, record.size));
            }
            entries.push(IsoEntry {
                path,
                modified: record.modified,
                size: if record.is_dir { 0 } else { record.size as u64 },
                is_dir: record.is_dir,
                extent: record.extent,
            });
        }
    }

    Ok(Walk {
        block_size,
        entries,
    })
}
