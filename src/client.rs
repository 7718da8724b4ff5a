//! File system client for one phone connection
//!
//! Every operation is a fixed sequence of request/reply exchanges over the
//! framer. Transfers go through a [`FileHandle`] that is closed exactly once
//! whether the transfer body succeeds or not.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use filetime::FileTime;

use crate::codec::read_u16_be;
use crate::dirent::{self, DirectoryEntry, EntryKind};
use crate::error::{Error, Result};
use crate::protocol::{self, reply, BLOCK_SIZE, INIT_ACK, MAX_BLOCKS};
use crate::protocol_core::{
    ensure_dir_exists, join_remote, local_child, remote_dir, split_records, strip_remote_dir,
};
use crate::transport::{Framer, Transport};

/// Firmware details read once during the handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub firmware_version: String,
    pub firmware_date: String,
    pub phone_model: String,
}

/// An open remote file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle {
    pub descriptor: u16,
    pub block_index: u16,
    pub total_size: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpStats {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
}

pub struct PhoneClient<T: Transport> {
    framer: Framer<T>,
    info: DeviceInfo,
}

impl<T: Transport> PhoneClient<T> {
    /// Wrap a framer without talking to the phone yet
    pub fn new(framer: Framer<T>) -> Self {
        Self {
            framer,
            info: DeviceInfo::default(),
        }
    }

    /// Wrap a framer and run the handshake
    pub fn connect(framer: Framer<T>) -> Result<Self> {
        let mut client = Self::new(framer);
        client.initialize()?;
        Ok(client)
    }

    pub fn framer(&self) -> &Framer<T> {
        &self.framer
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Init handshake followed by the firmware info query
    pub fn initialize(&mut self) -> Result<()> {
        let ack = self.framer.exchange(&protocol::init())?;
        if ack != INIT_ACK {
            return Err(Error::protocol("unexpected init response"));
        }

        let reply = self.framer.exchange(&protocol::firmware_info())?;
        let text = reply.get(reply::FIRMWARE_SKIP..).ok_or_else(|| {
            Error::protocol(format!(
                "firmware info reply too short: {} bytes",
                reply.len()
            ))
        })?;
        let mut lines = text.split(|&b| b == b'\n').map(|line| {
            std::str::from_utf8(line)
                .map(|s| s.trim_end_matches('\r').to_string())
                .map_err(|e| Error::protocol(format!("firmware info is not UTF-8: {}", e)))
        });
        let mut next = |what: &str| {
            lines
                .next()
                .unwrap_or_else(|| Err(Error::protocol(format!("firmware info lacks {}", what))))
        };
        self.info = DeviceInfo {
            firmware_version: next("version")?,
            firmware_date: next("date")?,
            phone_model: next("model")?,
        };
        Ok(())
    }

    pub fn imei(&mut self) -> Result<String> {
        let reply = self.framer.exchange(&protocol::imei())?;
        let digits = reply
            .get(reply::IMEI_OFFSET..reply::IMEI_OFFSET + reply::IMEI_LEN)
            .ok_or_else(|| Error::protocol(format!("IMEI reply too short: {} bytes", reply.len())))?;
        std::str::from_utf8(digits)
            .map(str::to_string)
            .map_err(|_| Error::protocol("IMEI is not ASCII"))
    }

    /// Look up one entry. Absent entries are `NotFound`.
    pub fn stat_entry(&mut self, path: &str) -> Result<DirectoryEntry> {
        let reply = self.framer.exchange(&protocol::stat_entry(path))?;
        let entry = dirent::decode(&reply);
        match entry.kind {
            EntryKind::Other => Err(Error::NotFound(path.to_string())),
            _ => Ok(entry),
        }
    }

    fn expect_kind(&mut self, path: &str, expected: EntryKind) -> Result<DirectoryEntry> {
        let entry = self.stat_entry(path)?;
        if entry.kind != expected {
            return Err(Error::TypeMismatch {
                path: path.to_string(),
                expected,
                found: entry.kind,
            });
        }
        Ok(entry)
    }

    /// Entries of a directory, files and directories only
    pub fn list_directory(&mut self, path: &str) -> Result<Vec<DirectoryEntry>> {
        let path = strip_remote_dir(path);
        if path != "/" {
            self.expect_kind(path, EntryKind::Directory)?;
        }
        let pattern = format!("{}*", remote_dir(path));
        let reply = self.framer.exchange(&protocol::list_directory(&pattern)?)?;
        Ok(split_records(&reply)?
            .into_iter()
            .map(dirent::decode)
            .filter(|e| e.kind != EntryKind::Other)
            .collect())
    }

    fn open_for_read(&mut self, path: &str, size: u32) -> Result<FileHandle> {
        let reply = self.framer.exchange(&protocol::open_for_read(path))?;
        Ok(FileHandle {
            descriptor: descriptor(&reply)?,
            block_index: 0,
            total_size: size,
        })
    }

    fn open_for_write(&mut self, path: &str) -> Result<FileHandle> {
        let reply = self.framer.exchange(&protocol::open_for_write(path)?)?;
        Ok(FileHandle {
            descriptor: descriptor(&reply)?,
            block_index: 0,
            total_size: 0,
        })
    }

    fn close_handle(&mut self, handle: FileHandle) -> Result<()> {
        self.framer
            .exchange(&protocol::close_handle(handle.descriptor)?)
            .map(|_| ())
    }

    fn read_block(&mut self, handle: &mut FileHandle, wanted: usize) -> Result<Vec<u8>> {
        let request = protocol::read_block(handle.descriptor, handle.block_index, wanted)?;
        let mut reply = self.framer.exchange(&request)?;
        let count = read_u16_be(&reply, reply::BLOCK_COUNT_OFFSET)
            .ok_or_else(|| Error::protocol("read reply too short for a byte count"))?;
        if count as usize != wanted {
            return Err(Error::protocol(format!(
                "block {}: asked for {} bytes, phone returned {}",
                handle.block_index, wanted, count
            )));
        }
        if reply.len() != reply::BLOCK_DATA_OFFSET + wanted {
            return Err(Error::protocol(format!(
                "block {}: reply carries {} data bytes, expected {}",
                handle.block_index,
                reply.len().saturating_sub(reply::BLOCK_DATA_OFFSET),
                wanted
            )));
        }
        handle.block_index = handle.block_index.wrapping_add(1);
        Ok(reply.split_off(reply::BLOCK_DATA_OFFSET))
    }

    fn read_blocks(
        &mut self,
        handle: &mut FileHandle,
        writer: &mut dyn Write,
        sink: &Path,
    ) -> Result<u64> {
        let mut total = 0u64;
        for wanted in protocol::block_plan(handle.total_size as u64)? {
            let data = self.read_block(handle, wanted)?;
            writer.write_all(&data).map_err(|e| Error::io(sink, e))?;
            total += data.len() as u64;
        }
        writer.flush().map_err(|e| Error::io(sink, e))?;
        Ok(total)
    }

    fn download_entry(
        &mut self,
        path: &str,
        entry: &DirectoryEntry,
        writer: &mut dyn Write,
        sink: &Path,
    ) -> Result<u64> {
        let mut handle = self.open_for_read(path, entry.size_bytes)?;
        let body = self.read_blocks(&mut handle, writer, sink);
        let close = self.close_handle(handle);
        let result = Error::with_close(body, close);
        match &result {
            Ok(bytes) => self.framer.logger().transfer_done("GET", path, *bytes),
            Err(e) => self.framer.logger().error("GET", path, &e.to_string()),
        }
        result
    }

    /// Stream a remote file into `writer`; returns the entry that was read
    pub fn download_to_writer(
        &mut self,
        path: &str,
        writer: &mut dyn Write,
    ) -> Result<DirectoryEntry> {
        let entry = self.expect_kind(path, EntryKind::File)?;
        self.download_entry(path, &entry, writer, Path::new("<writer>"))?;
        Ok(entry)
    }

    /// Download a remote file into memory
    pub fn download_to_vec(&mut self, path: &str) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.download_to_writer(path, &mut buf)?;
        Ok(buf)
    }

    /// Download a remote file to `destination` and stamp it with the remote mtime
    pub fn download_file(&mut self, path: &str, destination: &Path) -> Result<u64> {
        let entry = self.expect_kind(path, EntryKind::File)?;
        self.download_to_path(path, &entry, destination)
    }

    fn download_to_path(
        &mut self,
        path: &str,
        entry: &DirectoryEntry,
        destination: &Path,
    ) -> Result<u64> {
        let file = File::create(destination).map_err(|e| Error::io(destination, e))?;
        let mut writer = BufWriter::new(file);
        let bytes = match self.download_entry(path, entry, &mut writer, destination) {
            Ok(bytes) => bytes,
            Err(e) => {
                drop(writer);
                let _ = std::fs::remove_file(destination);
                return Err(e);
            }
        };
        drop(writer);
        if let Some(mtime) = entry.file_time() {
            filetime::set_file_mtime(destination, mtime).map_err(|e| Error::io(destination, e))?;
        }
        Ok(bytes)
    }

    fn write_blocks(
        &mut self,
        handle: &mut FileHandle,
        reader: &mut dyn Read,
        source: &Path,
    ) -> Result<u64> {
        let mut buf = [0u8; BLOCK_SIZE];
        let mut blocks = 0usize;
        loop {
            let filled = fill_block(reader, &mut buf).map_err(|e| Error::io(source, e))?;
            if filled == 0 {
                break;
            }
            if blocks == MAX_BLOCKS {
                return Err(Error::protocol(format!(
                    "upload exceeds {} blocks of {} bytes",
                    MAX_BLOCKS, BLOCK_SIZE
                )));
            }
            self.framer
                .exchange(&protocol::write_block(handle.descriptor, &buf[..filled])?)?;
            handle.block_index = handle.block_index.wrapping_add(1);
            handle.total_size = handle.total_size.saturating_add(filled as u32);
            blocks += 1;
            if filled < BLOCK_SIZE {
                break;
            }
        }
        Ok(handle.total_size as u64)
    }

    fn upload_inner(&mut self, path: &str, reader: &mut dyn Read, source: &Path) -> Result<u64> {
        let mut handle = self.open_for_write(path)?;
        let body = self.write_blocks(&mut handle, reader, source);
        let close = self.close_handle(handle);
        let result = Error::with_close(body, close);
        match &result {
            Ok(bytes) => self.framer.logger().transfer_done("PUT", path, *bytes),
            Err(e) => self.framer.logger().error("PUT", path, &e.to_string()),
        }
        result
    }

    /// Create or replace a remote file from `reader`
    pub fn upload_from_reader(&mut self, path: &str, reader: &mut dyn Read) -> Result<u64> {
        self.upload_inner(path, reader, Path::new("<reader>"))
    }

    /// Create or replace a remote file from a local file
    pub fn upload_file(&mut self, path: &str, source: &Path) -> Result<u64> {
        let file = File::open(source).map_err(|e| Error::io(source, e))?;
        self.upload_inner(path, &mut BufReader::new(file), source)
    }

    /// Delete a remote file. Directories are refused.
    pub fn delete_file(&mut self, path: &str) -> Result<()> {
        self.expect_kind(path, EntryKind::File)?;
        self.framer.exchange(&protocol::delete_file(path)?)?;
        self.framer.logger().delete(path);
        Ok(())
    }

    /// Copy a remote file or directory tree under `local_root`
    pub fn dump_tree(
        &mut self,
        remote_path: &str,
        local_root: &Path,
        recursive: bool,
    ) -> Result<DumpStats> {
        ensure_dir_exists(local_root)?;
        let mut stats = DumpStats::default();
        let remote_path = strip_remote_dir(remote_path);

        if remote_path != "/" {
            let entry = self.stat_entry(remote_path)?;
            if entry.is_file() {
                let name = remote_path.rsplit('/').next().unwrap_or(remote_path);
                let dest = local_child(local_root, name)?;
                stats.bytes += self.download_to_path(remote_path, &entry, &dest)?;
                stats.files += 1;
                return Ok(stats);
            }
        }

        let mut stack: Vec<(String, PathBuf)> = vec![(remote_path.to_string(), local_root.to_path_buf())];
        let mut dir_times: Vec<(PathBuf, FileTime)> = Vec::new();

        while let Some((remote, local)) = stack.pop() {
            for entry in self.list_directory(&remote)? {
                let child_remote = join_remote(&remote, &entry.name);
                let child_local = local_child(&local, &entry.name)?;
                match entry.kind {
                    EntryKind::Directory if recursive => {
                        ensure_dir_exists(&child_local)?;
                        stats.directories += 1;
                        if let Some(t) = entry.file_time() {
                            dir_times.push((child_local.clone(), t));
                        }
                        stack.push((child_remote, child_local));
                    }
                    EntryKind::File => {
                        stats.bytes += self.download_to_path(&child_remote, &entry, &child_local)?;
                        stats.files += 1;
                    }
                    _ => {}
                }
            }
        }

        // Children were discovered after their parents, so reverse order is deepest first
        for (path, t) in dir_times.iter().rev() {
            filetime::set_file_mtime(path, *t).map_err(|e| Error::io(path, e))?;
        }
        Ok(stats)
    }

    /// Ask the phone to restart, then drop the connection
    pub fn reboot(mut self) -> Result<()> {
        self.framer.exchange(&protocol::reset())?;
        self.framer.close()
    }

    pub fn close(mut self) -> Result<()> {
        self.framer.close()
    }
}

fn descriptor(reply: &[u8]) -> Result<u16> {
    read_u16_be(reply, reply::DESCRIPTOR_OFFSET).ok_or_else(|| {
        Error::protocol(format!(
            "open reply too short for a descriptor: {} bytes",
            reply.len()
        ))
    })
}

// Read until `buf` is full or the reader is exhausted
fn fill_block(reader: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<usize> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{InstantClock, MockPhone, ScriptedReply, ScriptedTransport};

    fn client(phone: &MockPhone) -> PhoneClient<MockPhone> {
        let framer = Framer::new(phone.clone()).with_clock(Box::new(InstantClock::default()));
        PhoneClient::connect(framer).unwrap()
    }

    fn firmware_reply(text: &[u8]) -> Vec<u8> {
        let mut reply = vec![0u8; 18];
        reply.extend_from_slice(text);
        reply
    }

    fn scripted(replies: Vec<ScriptedReply>) -> PhoneClient<ScriptedTransport> {
        let t = ScriptedTransport::new(replies);
        let clock = t.clock();
        PhoneClient::new(Framer::new(t).with_clock(Box::new(clock)))
    }

    #[test]
    fn test_initialize_reads_firmware_lines() {
        let mut c = scripted(vec![
            ScriptedReply::data(INIT_ACK.to_vec()),
            ScriptedReply::data(firmware_reply(b"1.0\r\n2020-01-01\nTestPhone\n")),
        ]);
        c.initialize().unwrap();
        assert_eq!(
            c.device_info(),
            &DeviceInfo {
                firmware_version: "1.0".to_string(),
                firmware_date: "2020-01-01".to_string(),
                phone_model: "TestPhone".to_string(),
            }
        );
    }

    #[test]
    fn test_initialize_rejects_bad_ack() {
        let mut c = scripted(vec![ScriptedReply::data(vec![0x19, 0x10, 0x00, 0xd0, 0x00, 0x01, 0x06])]);
        let err = c.initialize().unwrap_err();
        assert_eq!(err.to_string(), "protocol error: unexpected init response");
    }

    #[test]
    fn test_initialize_rejects_short_or_invalid_firmware_info() {
        let mut c = scripted(vec![
            ScriptedReply::data(INIT_ACK.to_vec()),
            ScriptedReply::data(firmware_reply(b"1.0\nonly-two")),
        ]);
        assert!(matches!(c.initialize(), Err(Error::Protocol(_))));

        let mut c = scripted(vec![
            ScriptedReply::data(INIT_ACK.to_vec()),
            ScriptedReply::data(firmware_reply(b"1.0\n\xff\xfe\nModel\n")),
        ]);
        assert!(matches!(c.initialize(), Err(Error::Protocol(_))));

        let mut c = scripted(vec![
            ScriptedReply::data(INIT_ACK.to_vec()),
            ScriptedReply::data(vec![0u8; 10]),
        ]);
        assert!(matches!(c.initialize(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_stat_kinds() {
        let phone = MockPhone::with_sample_data();
        let mut c = client(&phone);
        assert!(c.stat_entry("/c/readme.txt").unwrap().is_file());
        assert!(c.stat_entry("/c/Images").unwrap().is_directory());
        assert!(matches!(c.stat_entry("/c/missing"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_read_block_rejects_wrong_count() {
        let phone = MockPhone::with_sample_data();
        phone.set_faults(crate::mock::Faults {
            short_blocks: true,
            ..Default::default()
        });
        let mut c = client(&phone);
        let err = c.download_to_vec("/c/readme.txt").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err}");
        // The handle was still closed
        assert_eq!(phone.state().open_handles(), 0);
    }

    #[test]
    fn test_fill_block_collects_short_reads() {
        struct Trickle(Vec<u8>);
        impl Read for Trickle {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.0.is_empty() || buf.is_empty() {
                    return Ok(0);
                }
                buf[0] = self.0.remove(0);
                Ok(1)
            }
        }
        let mut r = Trickle(vec![7u8; 300]);
        let mut buf = [0u8; BLOCK_SIZE];
        assert_eq!(fill_block(&mut r, &mut buf).unwrap(), BLOCK_SIZE);
        assert_eq!(fill_block(&mut r, &mut buf).unwrap(), 44);
        assert_eq!(fill_block(&mut r, &mut buf).unwrap(), 0);
    }
}
