//! Certificate workflows layered on the file client

use crate::cdf::{self, CertDirectory, KeyUsage};
use crate::client::PhoneClient;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::protocol_core::join_remote;
use crate::transport::Transport;
use crate::x509::ParsedCertificate;

pub struct CertificateStore<'c, T: Transport> {
    client: &'c mut PhoneClient<T>,
    cert_dir: String,
    cdf_name: String,
}

impl<'c, T: Transport> CertificateStore<'c, T> {
    pub fn new(client: &'c mut PhoneClient<T>, config: &SessionConfig) -> Self {
        Self {
            client,
            cert_dir: config.cert_dir.clone(),
            cdf_name: config.cdf_name.clone(),
        }
    }

    pub fn cdf_path(&self) -> String {
        join_remote(&self.cert_dir, &self.cdf_name)
    }

    // A phone that never stored a user certificate has no directory file yet
    fn read_cdf(&mut self) -> Result<Vec<u8>> {
        let path = self.cdf_path();
        match self.client.download_to_vec(&path) {
            Ok(bytes) => Ok(bytes),
            Err(Error::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub fn list_certificates(&mut self) -> Result<CertDirectory> {
        Ok(cdf::parse(&self.read_cdf()?))
    }

    /// Store a certificate on the phone and register it in the directory file
    pub fn install_certificate(
        &mut self,
        cert_bytes: &[u8],
        usage: KeyUsage,
    ) -> Result<ParsedCertificate> {
        let cert = ParsedCertificate::from_bytes(cert_bytes)?;
        let name = cert.common_name()?.to_string();
        if name.contains('/') || name.contains('\\') {
            return Err(Error::CertificateFormat(format!(
                "common name {:?} cannot be used as a file name",
                name
            )));
        }

        let mut cdf_bytes = self.read_cdf()?;
        let endianness = cdf::parse(&cdf_bytes).endianness;
        cdf_bytes.extend(cdf::build_entry(&cert, endianness, usage)?);

        let cert_path = join_remote(&self.cert_dir, &name);
        self.client
            .upload_from_reader(&cert_path, &mut cert.der.as_slice())?;
        let cdf_path = self.cdf_path();
        self.client
            .upload_from_reader(&cdf_path, &mut cdf_bytes.as_slice())?;
        Ok(cert)
    }
}

/// Parse a certificate without touching the phone
pub fn certificate_info(bytes: &[u8]) -> Result<ParsedCertificate> {
    ParsedCertificate::from_bytes(bytes)
}
