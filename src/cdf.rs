//! Certificate directory file (`ext_info.sys`) codec
//!
//! The file is a flat run of records, each starting with a two-byte size.
//! Some firmware writes the size little-endian, so the byte order is
//! detected from the first record and kept for the rest of the file and
//! for anything appended to it.
//!
//! ```text
//! size(2) 00 00 | 01 41 02 10 | 14 00 14 14
//! fingerprint(20) modulus_hash(20) unknown(20) subject_hash(20) issuer_hash(20)
//! n  name(n-1)  00 00
//! k  (06 len oid)*          key usage, k bytes
//! padding
//! ```

use std::fmt;

use bitflags::bitflags;

use crate::codec::{pack_u16, sub_slice, unpack_u16, Endianness};
use crate::error::{Error, Result};
use crate::x509::{Digest20, ParsedCertificate, DIGEST_LEN};

const RECORD_MAGIC: [u8; 4] = [0x01, 0x41, 0x02, 0x10];
const FIELD_LENGTHS: [u8; 4] = [0x14, 0x00, 0x14, 0x14];
const RESERVED_LEN: usize = 10;
const OID_TAG: u8 = 0x06;

pub const OID_APPS_SIGNING: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x03, 0x03];
pub const OID_CROSS_CERTIFICATION: &[u8] =
    &[0x2b, 0x06, 0x01, 0x04, 0x01, 0x5e, 0x01, 0x31, 0x04, 0x01];
pub const OID_SERVER_AUTHENTIC: &[u8] = &[0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x03, 0x01];

bitflags! {
    /// What the phone will trust a certificate for
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KeyUsage: u8 {
        const APPS_SIGNING = 0b001;
        const CROSS_CERTIFICATION = 0b010;
        const SERVER_AUTHENTIC = 0b100;
    }
}

// Write order of the usage OIDs
const USAGE_OIDS: [(KeyUsage, &[u8]); 3] = [
    (KeyUsage::APPS_SIGNING, OID_APPS_SIGNING),
    (KeyUsage::CROSS_CERTIFICATION, OID_CROSS_CERTIFICATION),
    (KeyUsage::SERVER_AUTHENTIC, OID_SERVER_AUTHENTIC),
];

pub fn key_usage_from_oid(oid: &[u8]) -> KeyUsage {
    USAGE_OIDS
        .iter()
        .find(|(_, known)| *known == oid)
        .map(|(flag, _)| *flag)
        .unwrap_or_else(KeyUsage::empty)
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = self
            .iter_names()
            .map(|(name, _)| match name {
                "APPS_SIGNING" => "apps-signing",
                "CROSS_CERTIFICATION" => "cross-certification",
                _ => "server-authentic",
            })
            .collect();
        f.write_str(&names.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertListItem {
    pub file_name: String,
    pub fingerprint: Digest20,
    pub modulus_hash: Digest20,
    /// Opaque on read, zero on write
    pub unknown_field: Digest20,
    pub subject_hash: Digest20,
    pub issuer_hash: Digest20,
    pub key_usage: KeyUsage,
}

impl fmt::Display for CertListItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.file_name)?;
        writeln!(f, "  fingerprint:  {}", hex::encode(self.fingerprint))?;
        writeln!(f, "  modulus hash: {}", hex::encode(self.modulus_hash))?;
        writeln!(f, "  subject hash: {}", hex::encode(self.subject_hash))?;
        writeln!(f, "  issuer hash:  {}", hex::encode(self.issuer_hash))?;
        write!(f, "  usage:        {}", self.key_usage)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertDirectory {
    pub endianness: Endianness,
    pub items: Vec<CertListItem>,
}

/// Walks the fields of one record body
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let out = sub_slice(self.data, self.pos, len)?;
        self.pos += len;
        Some(out)
    }

    fn byte(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn digest(&mut self) -> Option<Digest20> {
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(self.take(DIGEST_LEN)?);
        Some(out)
    }
}

fn detect_endianness(data: &[u8]) -> Endianness {
    let size = i16::from_be_bytes([data[0], data[1]]) as i32 - 2;
    if size < 0 || size as usize >= data.len() {
        Endianness::Little
    } else {
        Endianness::Big
    }
}

fn parse_key_usage(block: &[u8]) -> KeyUsage {
    let mut usage = KeyUsage::empty();
    let mut i = 0;
    while i < block.len() {
        // Tag byte is skipped, only the length is trusted
        let Some(&len) = block.get(i + 1) else {
            break;
        };
        let Some(oid) = sub_slice(block, i + 2, len as usize) else {
            break;
        };
        usage |= key_usage_from_oid(oid);
        i += 2 + len as usize;
    }
    usage
}

fn parse_record(body: &[u8]) -> Option<CertListItem> {
    let mut c = Cursor { data: body, pos: 0 };
    c.take(RESERVED_LEN)?;
    let fingerprint = c.digest()?;
    let modulus_hash = c.digest()?;
    let unknown_field = c.digest()?;
    let subject_hash = c.digest()?;
    let issuer_hash = c.digest()?;
    let name_len = c.byte()? as usize;
    let name = c.take(name_len.saturating_sub(1))?;
    c.take(2)?;
    let usage_len = c.byte()? as usize;
    let usage = c.take(usage_len)?;
    Some(CertListItem {
        file_name: String::from_utf8_lossy(name).into_owned(),
        fingerprint,
        modulus_hash,
        unknown_field,
        subject_hash,
        issuer_hash,
        key_usage: parse_key_usage(usage),
    })
}

/// Parse a certificate directory file. Damage never discards earlier records.
pub fn parse(data: &[u8]) -> CertDirectory {
    let mut dir = CertDirectory::default();
    if data.len() < 4 {
        return dir;
    }
    dir.endianness = detect_endianness(data);

    let mut pos = 0;
    while data.len() - pos >= 4 {
        let declared = unpack_u16([data[pos], data[pos + 1]], dir.endianness) as usize;
        if declared < 4 {
            break;
        }
        let next = pos + declared;
        if next > data.len() {
            break;
        }
        if let Some(item) = parse_record(&data[pos + 2..next]) {
            dir.items.push(item);
        }
        pos = next;
    }
    dir
}

fn key_usage_block(usage: KeyUsage) -> Vec<u8> {
    let mut entries = Vec::new();
    for (flag, oid) in USAGE_OIDS {
        if usage.contains(flag) {
            entries.push(OID_TAG);
            entries.push(oid.len() as u8);
            entries.extend_from_slice(oid);
        }
    }
    let mut block = Vec::with_capacity(entries.len() + 1);
    block.push(entries.len() as u8);
    block.extend(entries);
    block
}

/// Build one record for `cert`, ready to append to a file in `endianness`
pub fn build_entry(
    cert: &ParsedCertificate,
    endianness: Endianness,
    usage: KeyUsage,
) -> Result<Vec<u8>> {
    let name = cert.common_name()?.as_bytes();
    let name_len = u8::try_from(name.len() + 1).map_err(|_| {
        Error::CertificateFormat(format!(
            "common name is {} bytes; at most 254 fit a directory record",
            name.len()
        ))
    })?;

    let mut body = Vec::with_capacity(160);
    body.extend_from_slice(&RECORD_MAGIC);
    body.extend_from_slice(&FIELD_LENGTHS);
    body.extend_from_slice(&cert.fingerprint);
    body.extend_from_slice(&cert.modulus_hash);
    body.extend_from_slice(&[0u8; DIGEST_LEN]);
    body.extend_from_slice(&cert.subject_hash);
    body.extend_from_slice(&cert.issuer_hash);
    body.push(name_len);
    body.extend_from_slice(name);
    body.extend_from_slice(&[0x00, 0x00]);
    body.extend(key_usage_block(usage));

    // Firmware always pads with at least one extra word
    let pad = match body.len() % 4 {
        0 => 4,
        r => (4 - r) + 4,
    };
    body.resize(body.len() + pad, 0);

    let total = u16::try_from(body.len() + 4)
        .map_err(|_| Error::protocol("certificate record exceeds 65535 bytes"))?;
    let mut record = Vec::with_capacity(total as usize);
    record.extend_from_slice(&pack_u16(total, endianness));
    record.extend_from_slice(&[0x00, 0x00]);
    record.extend(body);
    Ok(record)
}
