//! Command table for the phone's file and device service
//!
//! Every request starts from an immutable [`CommandTemplate`]. Building a
//! request copies the template payload into a fresh buffer and patches the
//! named fields there, so templates are never modified.

use crate::codec::{encode_utf16le, write_u16_be_at};
use crate::error::{Error, Result};

// Outbound header: 0x19 0x00 0x10 <opcode> <lenHi> <lenLo>
pub const HEADER_PREFIX: [u8; 3] = [0x19, 0x00, 0x10];
pub const HEADER_LEN: usize = 6;

// The header length field is 16 bits wide
pub const MAX_PAYLOAD: usize = 0xFFFF;

// Transfer block size for both directions
pub const BLOCK_SIZE: usize = 256;

// Block indices are 16 bits wide on the wire (~16 MB per file)
pub const MAX_BLOCKS: usize = 1 << 16;

/// The only acceptable reply to [`command::INIT`]
pub const INIT_ACK: [u8; 7] = [0x19, 0x10, 0x00, 0xd0, 0x00, 0x01, 0x05];

// Opcodes placed in byte 3 of the header
pub mod opcode {
    pub const INIT: u8 = 0xd0;
    pub const DEVICE_INFO: u8 = 0x1b;
    pub const RESET: u8 = 0x15;
    pub const FILE: u8 = 0x6d;
}

// Offsets of fields inside replies (from the start of the reply frame)
pub mod reply {
    pub const RECORD_LENGTH_OFFSET: usize = 4;
    pub const DESCRIPTOR_OFFSET: usize = 14;
    pub const BLOCK_COUNT_OFFSET: usize = 14;
    pub const BLOCK_DATA_OFFSET: usize = 16;
    pub const IMEI_OFFSET: usize = 16;
    pub const IMEI_LEN: usize = 15;
    pub const FIRMWARE_SKIP: usize = 18;
}

// Receive loop tuning
pub mod timeouts {
    // Wait after the stream goes quiet before declaring the reply complete (ms)
    pub const IDLE_WAIT_MS: u64 = 100;

    // Number of quiet waits before giving up on stragglers
    pub const IDLE_RETRIES: u32 = 1;

    // Size of a single read from the stream
    pub const READ_CHUNK: usize = 64;
}

/// Variable fields a template may expose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// Encoded path length, one byte
    PathLength8,
    /// Encoded path length, two bytes
    PathLength16,
    Descriptor,
    BlockIndex,
    WantedBytes,
    BlockLength,
}

impl Field {
    fn width(self) -> usize {
        match self {
            Field::PathLength8 => 1,
            _ => 2,
        }
    }
}

/// A named offset into a template payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Patch {
    pub field: Field,
    pub offset: usize,
}

/// Read-only blueprint of a command
#[derive(Debug)]
pub struct CommandTemplate {
    pub name: &'static str,
    pub opcode: u8,
    pub payload: &'static [u8],
    pub patches: &'static [Patch],
    /// Whether a UTF-16LE path follows the fixed payload
    pub takes_path: bool,
}

pub mod command {
    use super::{opcode, CommandTemplate, Field, Patch};

    pub const INIT: CommandTemplate = CommandTemplate {
        name: "init",
        opcode: opcode::INIT,
        payload: &[0x04],
        patches: &[],
        takes_path: false,
    };

    pub const FIRMWARE_INFO: CommandTemplate = CommandTemplate {
        name: "firmware-info",
        opcode: opcode::DEVICE_INFO,
        payload: &[0x00, 0x01, 0x00, 0x07, 0x01, 0x00],
        patches: &[],
        takes_path: false,
    };

    pub const IMEI: CommandTemplate = CommandTemplate {
        name: "imei",
        opcode: opcode::DEVICE_INFO,
        payload: &[0x00, 0x01, 0x00, 0x00, 0x41],
        patches: &[],
        takes_path: false,
    };

    pub const RESET: CommandTemplate = CommandTemplate {
        name: "reset",
        opcode: opcode::RESET,
        payload: &[0x00, 0x01, 0x00, 0x05, 0x80, 0x00],
        patches: &[],
        takes_path: false,
    };

    pub const LIST_DIRECTORY: CommandTemplate = CommandTemplate {
        name: "list-directory",
        opcode: opcode::FILE,
        payload: &[0x00, 0x01, 0x00, 0x68, 0x00, 0x00, 0x00],
        patches: &[Patch {
            field: Field::PathLength8,
            offset: 5,
        }],
        takes_path: true,
    };

    pub const STAT_ENTRY: CommandTemplate = CommandTemplate {
        name: "stat-entry",
        opcode: opcode::FILE,
        payload: &[0x00, 0x01, 0x00, 0x68, 0x00, 0x68, 0x00],
        patches: &[],
        takes_path: true,
    };

    pub const OPEN_FOR_READ: CommandTemplate = CommandTemplate {
        name: "open-read",
        opcode: opcode::FILE,
        payload: &[0x00, 0x01, 0x00, 0x72, 0x00, 0x00, 0x00, 0x68, 0x00],
        patches: &[],
        takes_path: true,
    };

    pub const READ_BLOCK: CommandTemplate = CommandTemplate {
        name: "read-block",
        opcode: opcode::FILE,
        payload: &[
            0x00, 0x01, 0x00, 0x5e, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00,
        ],
        patches: &[
            Patch {
                field: Field::Descriptor,
                offset: 8,
            },
            Patch {
                field: Field::BlockIndex,
                offset: 11,
            },
            Patch {
                field: Field::WantedBytes,
                offset: 20,
            },
        ],
        takes_path: false,
    };

    pub const OPEN_FOR_WRITE: CommandTemplate = CommandTemplate {
        name: "open-write",
        opcode: opcode::FILE,
        payload: &[0x00, 0x01, 0x00, 0x72, 0x11, 0x00, 0x00, 0x00],
        patches: &[Patch {
            field: Field::PathLength16,
            offset: 6,
        }],
        takes_path: true,
    };

    pub const WRITE_BLOCK: CommandTemplate = CommandTemplate {
        name: "write-block",
        opcode: opcode::FILE,
        payload: &[
            0x00, 0x01, 0x00, 0x58, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ],
        patches: &[
            Patch {
                field: Field::Descriptor,
                offset: 8,
            },
            Patch {
                field: Field::BlockLength,
                offset: 12,
            },
        ],
        takes_path: false,
    };

    pub const CLOSE_HANDLE: CommandTemplate = CommandTemplate {
        name: "close-handle",
        opcode: opcode::FILE,
        payload: &[0x00, 0x01, 0x00, 0x74, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
        patches: &[Patch {
            field: Field::Descriptor,
            offset: 8,
        }],
        takes_path: false,
    };

    pub const DELETE_FILE: CommandTemplate = CommandTemplate {
        name: "delete-file",
        opcode: opcode::FILE,
        payload: &[0x00, 0x01, 0x00, 0x62, 0x00, 0x00],
        patches: &[Patch {
            field: Field::PathLength8,
            offset: 5,
        }],
        takes_path: true,
    };
}

/// A concrete request: an owned copy of a template with its fields filled in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub name: &'static str,
    pub opcode: u8,
    pub payload: Vec<u8>,
    patches: &'static [Patch],
}

impl CommandTemplate {
    /// Copy the template into a fresh, patchable request
    pub fn instantiate(&self) -> Request {
        Request {
            name: self.name,
            opcode: self.opcode,
            payload: self.payload.to_vec(),
            patches: self.patches,
        }
    }
}

impl Request {
    /// Patch a named field. Fails if the value does not fit the field width.
    pub fn set(mut self, field: Field, value: usize) -> Result<Self> {
        let patch = self
            .patches
            .iter()
            .find(|p| p.field == field)
            .copied()
            .ok_or_else(|| {
                Error::protocol(format!("command {} has no {:?} field", self.name, field))
            })?;
        match field.width() {
            1 => {
                let v = u8::try_from(value).map_err(|_| {
                    Error::protocol(format!(
                        "{:?} value {} does not fit one byte in {}",
                        field, value, self.name
                    ))
                })?;
                self.payload[patch.offset] = v;
            }
            _ => {
                let v = u16::try_from(value).map_err(|_| {
                    Error::protocol(format!(
                        "{:?} value {} does not fit two bytes in {}",
                        field, value, self.name
                    ))
                })?;
                write_u16_be_at(&mut self.payload, patch.offset, v);
            }
        }
        Ok(self)
    }

    /// Append raw bytes after the fixed payload
    pub fn append(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }
}

pub fn init() -> Request {
    command::INIT.instantiate()
}

pub fn firmware_info() -> Request {
    command::FIRMWARE_INFO.instantiate()
}

pub fn imei() -> Request {
    command::IMEI.instantiate()
}

pub fn reset() -> Request {
    command::RESET.instantiate()
}

/// List the entries matching `pattern` (a directory path ending in `*`)
pub fn list_directory(pattern: &str) -> Result<Request> {
    let path = encode_utf16le(pattern, true);
    Ok(command::LIST_DIRECTORY
        .instantiate()
        .set(Field::PathLength8, path.len())?
        .append(&path))
}

pub fn stat_entry(path: &str) -> Request {
    command::STAT_ENTRY
        .instantiate()
        .append(&encode_utf16le(path, true))
}

pub fn open_for_read(path: &str) -> Request {
    command::OPEN_FOR_READ
        .instantiate()
        .append(&encode_utf16le(path, true))
}

pub fn read_block(descriptor: u16, block_index: u16, wanted: usize) -> Result<Request> {
    if wanted > BLOCK_SIZE {
        return Err(Error::protocol(format!(
            "block request of {} bytes exceeds block size {}",
            wanted, BLOCK_SIZE
        )));
    }
    command::READ_BLOCK
        .instantiate()
        .set(Field::Descriptor, descriptor as usize)?
        .set(Field::BlockIndex, block_index as usize)?
        .set(Field::WantedBytes, wanted)
}

pub fn open_for_write(path: &str) -> Result<Request> {
    let path = encode_utf16le(path, true);
    Ok(command::OPEN_FOR_WRITE
        .instantiate()
        .set(Field::PathLength16, path.len())?
        .append(&path))
}

pub fn write_block(descriptor: u16, data: &[u8]) -> Result<Request> {
    if data.len() > BLOCK_SIZE {
        return Err(Error::protocol(format!(
            "block of {} bytes exceeds block size {}",
            data.len(),
            BLOCK_SIZE
        )));
    }
    Ok(command::WRITE_BLOCK
        .instantiate()
        .set(Field::Descriptor, descriptor as usize)?
        .set(Field::BlockLength, data.len())?
        .append(data))
}

pub fn close_handle(descriptor: u16) -> Result<Request> {
    command::CLOSE_HANDLE
        .instantiate()
        .set(Field::Descriptor, descriptor as usize)
}

pub fn delete_file(path: &str) -> Result<Request> {
    let path = encode_utf16le(path, true);
    Ok(command::DELETE_FILE
        .instantiate()
        .set(Field::PathLength8, path.len())?
        .append(&path))
}

/// Split a file size into per-block request lengths.
///
/// Fails when the file needs more blocks than a 16-bit block index can address.
pub fn block_plan(size: u64) -> Result<Vec<usize>> {
    let block = BLOCK_SIZE as u64;
    let count = size.div_ceil(block);
    if count > MAX_BLOCKS as u64 {
        return Err(Error::protocol(format!(
            "file of {} bytes needs {} blocks; the protocol addresses at most {}",
            size, count, MAX_BLOCKS
        )));
    }
    Ok((0..count)
        .map(|i| (size - i * block).min(block) as usize)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_plan_arithmetic() {
        assert_eq!(block_plan(256).unwrap(), vec![256]);
        assert_eq!(block_plan(257).unwrap(), vec![256, 1]);
        assert_eq!(block_plan(0).unwrap(), Vec::<usize>::new());
        assert_eq!(block_plan(512).unwrap(), vec![256, 256]);
        assert_eq!(block_plan(100).unwrap(), vec![100]);
    }

    #[test]
    fn test_block_plan_ceiling() {
        let max = (MAX_BLOCKS * BLOCK_SIZE) as u64;
        assert_eq!(block_plan(max).unwrap().len(), MAX_BLOCKS);
        assert!(matches!(block_plan(max + 1), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_read_block_patches_fields() {
        let req = read_block(0x0102, 0x0304, 256).unwrap();
        assert_eq!(req.opcode, opcode::FILE);
        assert_eq!(req.payload.len(), 22);
        assert_eq!(&req.payload[8..10], &[0x01, 0x02]);
        assert_eq!(&req.payload[11..13], &[0x03, 0x04]);
        assert_eq!(&req.payload[20..22], &[0x01, 0x00]);
        assert_eq!(req.payload[16], 0x04);
    }

    #[test]
    fn test_requests_do_not_share_template_state() {
        let first = read_block(7, 1, 10).unwrap();
        let second = read_block(9, 2, 20).unwrap();
        assert_eq!(&first.payload[8..10], &[0x00, 0x07]);
        assert_eq!(&second.payload[8..10], &[0x00, 0x09]);
        assert!(command::READ_BLOCK.payload[8..10].iter().all(|&b| b == 0));
        assert_eq!(command::READ_BLOCK.payload[21], 0);
    }

    #[test]
    fn test_list_directory_sets_path_length() {
        let req = list_directory("/c/*").unwrap();
        assert_eq!(&req.payload[..7], &[0x00, 0x01, 0x00, 0x68, 0x00, 10, 0x00]);
        assert_eq!(req.payload.len(), 7 + 10);
        assert_eq!(&req.payload[req.payload.len() - 2..], &[0, 0]);
    }

    #[test]
    fn test_path_length_overflow_is_rejected() {
        let long = "a".repeat(200);
        assert!(matches!(list_directory(&long), Err(Error::Protocol(_))));
        assert!(matches!(delete_file(&long), Err(Error::Protocol(_))));
        // Two-byte length field accepts it
        let req = open_for_write(&long).unwrap();
        assert_eq!(&req.payload[6..8], &[0x01, 0x92]);
    }

    #[test]
    fn test_write_block_appends_data() {
        let req = write_block(0x0a0b, &[1, 2, 3]).unwrap();
        assert_eq!(&req.payload[8..10], &[0x0a, 0x0b]);
        assert_eq!(&req.payload[12..14], &[0x00, 0x03]);
        assert_eq!(&req.payload[14..], &[1, 2, 3]);
        assert!(write_block(1, &[0u8; BLOCK_SIZE + 1]).is_err());
    }

    #[test]
    fn test_fixed_commands() {
        assert_eq!(init().payload, vec![0x04]);
        assert_eq!(init().opcode, 0xd0);
        assert_eq!(imei().opcode, 0x1b);
        assert_eq!(reset().opcode, 0x15);
        assert_eq!(close_handle(5).unwrap().payload[8..10], [0x00, 0x05]);
        assert_eq!(stat_entry("/a").payload[5], 0x68);
    }

    #[test]
    fn test_set_unknown_field_fails() {
        assert!(init().set(Field::Descriptor, 1).is_err());
    }

    #[test]
    fn test_requests_compare_by_value() {
        assert_eq!(read_block(3, 4, 5).unwrap(), read_block(3, 4, 5).unwrap());
        assert_ne!(read_block(3, 4, 5).unwrap(), read_block(3, 4, 6).unwrap());
        assert_eq!(command::CLOSE_HANDLE.patches[0], command::CLOSE_HANDLE.patches[0]);
    }
}
