// # Journal Files
//
// A journal is a sequence of files named `<prefix>.<generation:012>`. Each
// file opens with a 64-byte header; records follow back to back. The valid
// region ends at the first zero length, bad crc, or truncated frame: a
// crash can tear the last record, and everything before the tear is a
// usable prefix.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::common::Timestamp;
use crate::error::{EngineError, Result};
use crate::journal::record::{JournalRecord, RECORD_HEADER_LEN};

pub const FILE_HEADER_LEN: usize = 64;
pub const FILE_MAGIC: &[u8; 16] = b"CELLARDB JOURNAL";
pub const FILE_VERSION: u32 = 1;

/// Sanity ceiling on a single record body; a length beyond this is treated
/// as tail garbage rather than attempted as an allocation.
const MAX_RECORD_BODY: u32 = 256 * 1024 * 1024;

pub fn file_name(prefix: &str, generation: u64) -> String {
    format!("{prefix}.{generation:012}")
}

/// Parse a generation number out of a journal file name.
pub fn parse_generation(prefix: &str, name: &str) -> Option<u64> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('.')?;
    if rest.len() != 12 || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}

/// All journal generations in `dir`, ascending.
pub fn list_generations(dir: &Path, prefix: &str) -> Result<Vec<(u64, PathBuf)>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some(generation) = parse_generation(prefix, name) {
                out.push((generation, entry.path()));
            }
        }
    }
    out.sort_unstable_by_key(|(generation, _)| *generation);
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub generation: u64,
    pub created_unix_secs: u64,
    pub page_size: u32,
    pub max_size: u64,
}

impl FileHeader {
    pub fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..16].copy_from_slice(FILE_MAGIC);
        buf[16..20].copy_from_slice(&FILE_VERSION.to_le_bytes());
        buf[20..28].copy_from_slice(&self.generation.to_le_bytes());
        buf[28..36].copy_from_slice(&self.created_unix_secs.to_le_bytes());
        buf[36..40].copy_from_slice(&self.page_size.to_le_bytes());
        buf[40..48].copy_from_slice(&self.max_size.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; FILE_HEADER_LEN]) -> Result<FileHeader> {
        if &buf[0..16] != FILE_MAGIC {
            return Err(EngineError::Corrupt("bad journal file magic".to_string()));
        }
        let version = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        if version != FILE_VERSION {
            return Err(EngineError::Corrupt(format!(
                "unsupported journal format version {version}"
            )));
        }
        Ok(FileHeader {
            generation: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
            created_unix_secs: u64::from_le_bytes(buf[28..36].try_into().unwrap()),
            page_size: u32::from_le_bytes(buf[36..40].try_into().unwrap()),
            max_size: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
        })
    }
}

/// One decoded record with its position.
#[derive(Debug, Clone)]
pub struct ScannedRecord {
    pub timestamp: Timestamp,
    pub offset: u64,
    pub record: JournalRecord,
}

/// Sequential reader over one journal file.
pub struct JournalFileReader {
    path: PathBuf,
    reader: BufReader<File>,
    header: FileHeader,
    offset: u64,
    done: bool,
}

impl JournalFileReader {
    pub fn open(path: &Path) -> Result<JournalFileReader> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut header_buf = [0u8; FILE_HEADER_LEN];
        reader.read_exact(&mut header_buf).map_err(|_| {
            EngineError::CorruptJournal {
                file: path.display().to_string(),
                offset: 0,
                detail: "file shorter than header".to_string(),
            }
        })?;
        let header = FileHeader::decode(&header_buf).map_err(|e| EngineError::CorruptJournal {
            file: path.display().to_string(),
            offset: 0,
            detail: e.to_string(),
        })?;
        Ok(JournalFileReader {
            path: path.to_path_buf(),
            reader,
            header,
            offset: FILE_HEADER_LEN as u64,
            done: false,
        })
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Next record, or `None` at the end of the valid region. A torn or
    /// zeroed tail ends the region silently; a record that decodes but
    /// fails its crc is corruption.
    pub fn next_record(&mut self) -> Result<Option<ScannedRecord>> {
        if self.done {
            return Ok(None);
        }
        let record_offset = self.offset;
        let mut frame = [0u8; RECORD_HEADER_LEN];
        match read_fully(&mut self.reader, &mut frame) {
            ReadOutcome::Eof => {
                self.done = true;
                return Ok(None);
            }
            ReadOutcome::Partial => {
                warn!(file = %self.path.display(), offset = record_offset, "torn record header at journal tail");
                self.done = true;
                return Ok(None);
            }
            ReadOutcome::Full => {}
            ReadOutcome::Err(e) => return Err(e.into()),
        }
        let body_len = u32::from_le_bytes(frame[0..4].try_into().unwrap());
        if body_len == 0 {
            // Zero length terminates the file; the remainder is padding.
            self.done = true;
            return Ok(None);
        }
        if body_len > MAX_RECORD_BODY {
            warn!(file = %self.path.display(), offset = record_offset, body_len, "implausible record length at journal tail");
            self.done = true;
            return Ok(None);
        }
        let type_code = frame[4];
        let timestamp = u64::from_le_bytes(frame[5..13].try_into().unwrap());
        let crc = u32::from_le_bytes(frame[13..17].try_into().unwrap());
        let mut body = vec![0u8; body_len as usize];
        match read_fully(&mut self.reader, &mut body) {
            ReadOutcome::Full => {}
            ReadOutcome::Eof | ReadOutcome::Partial => {
                warn!(file = %self.path.display(), offset = record_offset, "torn record body at journal tail");
                self.done = true;
                return Ok(None);
            }
            ReadOutcome::Err(e) => return Err(e.into()),
        }
        if crc32fast::hash(&body) != crc {
            // A bad crc on the final record is a torn write; recovery takes
            // the prefix before it. We cannot distinguish mid-file damage
            // here, so the scan ends either way and the caller decides
            // whether later generations make that fatal.
            warn!(file = %self.path.display(), offset = record_offset, "crc mismatch ends journal scan");
            self.done = true;
            return Ok(None);
        }
        let record = JournalRecord::decode(type_code, &body).map_err(|e| {
            EngineError::CorruptJournal {
                file: self.path.display().to_string(),
                offset: record_offset,
                detail: e.to_string(),
            }
        })?;
        self.offset += (RECORD_HEADER_LEN + body_len as usize) as u64;
        Ok(Some(ScannedRecord {
            timestamp,
            offset: record_offset,
            record,
        }))
    }
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
    Err(std::io::Error),
}

fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> ReadOutcome {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial
                }
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return ReadOutcome::Err(e),
        }
    }
    ReadOutcome::Full
}
