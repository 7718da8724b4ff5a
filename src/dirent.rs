//! Directory entry records as returned by stat and list replies
//!
//! Record layout, offsets from the start of the reply frame:
//!
//! ```text
//! 0..6    frame header (19 10 00 <type> <lenHi> <lenLo>)
//! 6..10   opaque
//! 10      name length in UTF-16 code units (n)
//! 11      name, UTF-16LE, 2n bytes
//! +0      size, u32 big-endian
//! +4      year (u16 BE), month, day, hour, minute, second
//! +11     attributes (0x10 directory, 0x20 file)
//! ```

use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use filetime::FileTime;

use crate::codec::{decode_utf16le, encode_utf16le, read_u16_be, read_u32_be, sub_slice};
use crate::protocol::{opcode, HEADER_LEN};

pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_FILE: u8 = 0x20;

const NAME_LENGTH_OFFSET: usize = 10;
const OPAQUE: [u8; 4] = [0x00, 0x01, 0x00, 0x69];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Absent entries and anything that is neither file nor directory
    Other,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntryKind::File => "file",
            EntryKind::Directory => "directory",
            EntryKind::Other => "nothing",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub size_bytes: u32,
    /// Device-local wall clock time, interpreted as UTC
    pub modified_at: Option<NaiveDateTime>,
    pub kind: EntryKind,
}

impl DirectoryEntry {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Modification time in a form `filetime` can apply
    pub fn file_time(&self) -> Option<FileTime> {
        self.modified_at
            .map(|t| FileTime::from_unix_time(t.and_utc().timestamp(), 0))
    }
}

fn unknown(name: String) -> DirectoryEntry {
    DirectoryEntry {
        name,
        size_bytes: 0,
        modified_at: None,
        kind: EntryKind::Other,
    }
}

/// Decode one record. Never fails: short or unrecognised records come back as `Other`.
pub fn decode(record: &[u8]) -> DirectoryEntry {
    let Some(&units) = record.get(NAME_LENGTH_OFFSET) else {
        return unknown(String::new());
    };
    let name_start = NAME_LENGTH_OFFSET + 1;
    let name_len = units as usize * 2;
    let Some(name_bytes) = sub_slice(record, name_start, name_len) else {
        return unknown(decode_utf16le(record.get(name_start..).unwrap_or_default()));
    };
    let name = decode_utf16le(name_bytes);

    let base = name_start + name_len;
    let (Some(size), Some(year), Some(stamp), Some(&attrs)) = (
        read_u32_be(record, base),
        read_u16_be(record, base + 4),
        sub_slice(record, base + 6, 5),
        record.get(base + 11),
    ) else {
        return unknown(name);
    };

    let modified_at = NaiveDate::from_ymd_opt(year as i32, stamp[0] as u32, stamp[1] as u32)
        .and_then(|d| d.and_hms_opt(stamp[2] as u32, stamp[3] as u32, stamp[4] as u32));

    let kind = if attrs & ATTR_DIRECTORY != 0 {
        EntryKind::Directory
    } else if attrs & ATTR_FILE != 0 {
        EntryKind::File
    } else {
        EntryKind::Other
    };

    DirectoryEntry {
        name,
        size_bytes: size,
        modified_at,
        kind,
    }
}

/// Encode one record in the layout `decode` reads
pub fn encode(entry: &DirectoryEntry) -> Vec<u8> {
    let name = encode_utf16le(&entry.name, false);
    let units = (name.len() / 2).min(u8::MAX as usize);
    let name = &name[..units * 2];

    let mut body = Vec::with_capacity(17 + name.len());
    body.extend_from_slice(&OPAQUE);
    body.push(units as u8);
    body.extend_from_slice(name);
    body.extend_from_slice(&entry.size_bytes.to_be_bytes());
    match entry.modified_at {
        Some(t) => {
            body.extend_from_slice(&(t.year() as u16).to_be_bytes());
            body.extend_from_slice(&[
                t.month() as u8,
                t.day() as u8,
                t.hour() as u8,
                t.minute() as u8,
                t.second() as u8,
            ]);
        }
        None => body.extend_from_slice(&[0u8; 7]),
    }
    body.push(match entry.kind {
        EntryKind::File => ATTR_FILE,
        EntryKind::Directory => ATTR_DIRECTORY,
        EntryKind::Other => 0,
    });

    let mut record = Vec::with_capacity(HEADER_LEN + body.len());
    record.extend_from_slice(&[0x19, 0x10, 0x00, opcode::FILE]);
    record.extend_from_slice(&(body.len() as u16).to_be_bytes());
    record.extend_from_slice(&body);
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_core::split_records;

    fn stamp() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2009, 6, 21)
            .unwrap()
            .and_hms_opt(14, 5, 9)
            .unwrap()
    }

    #[test]
    fn test_decode_file_record() {
        let entry = DirectoryEntry {
            name: "ringtone.mid".to_string(),
            size_bytes: 70_000,
            modified_at: Some(stamp()),
            kind: EntryKind::File,
        };
        let record = encode(&entry);
        assert_eq!(decode(&record), entry);
        assert!(decode(&record).is_file());
        // The header length field covers the body exactly
        assert_eq!(split_records(&record).unwrap().len(), 1);
    }

    #[test]
    fn test_decode_directory_wins_over_file_bit() {
        let mut record = encode(&DirectoryEntry {
            name: "Images".to_string(),
            size_bytes: 0,
            modified_at: Some(stamp()),
            kind: EntryKind::Directory,
        });
        let last = record.len() - 1;
        record[last] |= ATTR_FILE;
        assert_eq!(decode(&record).kind, EntryKind::Directory);
    }

    #[test]
    fn test_short_and_empty_records_are_other() {
        assert_eq!(decode(&[]).kind, EntryKind::Other);
        assert_eq!(decode(&[0x19, 0x10, 0x00, 0x6d, 0x00, 0x00]).kind, EntryKind::Other);

        let full = encode(&DirectoryEntry {
            name: "x".to_string(),
            size_bytes: 1,
            modified_at: None,
            kind: EntryKind::File,
        });
        let truncated = decode(&full[..full.len() - 1]);
        assert_eq!(truncated.kind, EntryKind::Other);
        assert_eq!(truncated.name, "x");
    }

    #[test]
    fn test_zero_attributes_and_bad_date() {
        let record = encode(&DirectoryEntry {
            name: String::new(),
            size_bytes: 0,
            modified_at: None,
            kind: EntryKind::Other,
        });
        let entry = decode(&record);
        assert_eq!(entry.kind, EntryKind::Other);
        assert_eq!(entry.modified_at, None);
        assert_eq!(entry.file_time(), None);
    }

    #[test]
    fn test_file_time_is_utc() {
        let entry = DirectoryEntry {
            name: "a".to_string(),
            size_bytes: 0,
            modified_at: Some(stamp()),
            kind: EntryKind::File,
        };
        let ft = entry.file_time().unwrap();
        assert_eq!(ft.unix_seconds(), stamp().and_utc().timestamp());
    }
}
