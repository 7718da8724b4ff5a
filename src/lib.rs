//! phonelink library
//!
//! File system and certificate store access for Series 40 phones over a
//! Bluetooth serial link (RFCOMM) or a TCP connection to an emulator.

pub mod cdf;
pub mod certstore;
pub mod client;
pub mod codec;
pub mod config;
pub mod dirent;
pub mod error;
pub mod logger;
pub mod mock;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod transport;
pub mod x509;

pub use cdf::{CertDirectory, CertListItem, KeyUsage};
pub use certstore::CertificateStore;
pub use client::{DeviceInfo, DumpStats, FileHandle, PhoneClient};
pub use config::SessionConfig;
pub use dirent::{DirectoryEntry, EntryKind};
pub use error::{Error, Result};
pub use transport::{Framer, IdleClock, IdlePolicy, Transport};
pub use x509::{DistinguishedName, ParsedCertificate};
