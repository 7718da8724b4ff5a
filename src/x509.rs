//! Certificate digests and names for certificate directory records

use std::fmt;

use sha1::{Digest, Sha1};
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

use crate::error::{Error, Result};

pub const DIGEST_LEN: usize = 20;

pub type Digest20 = [u8; DIGEST_LEN];

const PEM_MARKER: &[u8] = b"-----BEGIN CERTIFICATE-----";

pub fn sha1_digest(data: &[u8]) -> Digest20 {
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&Sha1::digest(data));
    out
}

/// Distinguished name components the phone displays
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistinguishedName {
    pub country: Option<String>,
    pub state: Option<String>,
    pub locality: Option<String>,
    pub organization: Option<String>,
    pub organizational_unit: Option<String>,
    pub common_name: Option<String>,
}

impl DistinguishedName {
    fn from_x509(name: &X509Name<'_>) -> Self {
        fn first<'a, 'b: 'a>(
            mut it: impl Iterator<Item = &'a AttributeTypeAndValue<'b>>,
        ) -> Option<String> {
            it.next()
                .and_then(|attr| attr.as_str().ok())
                .map(str::to_string)
        }
        Self {
            country: first(name.iter_country()),
            state: first(name.iter_state_or_province()),
            locality: first(name.iter_locality()),
            organization: first(name.iter_organization()),
            organizational_unit: first(name.iter_organizational_unit()),
            common_name: first(name.iter_common_name()),
        }
    }
}

/// `C=..;ST=..;L=..;O=..;OU=..;CN=..` with absent parts left out
impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = [
            ("C", &self.country),
            ("ST", &self.state),
            ("L", &self.locality),
            ("O", &self.organization),
            ("OU", &self.organizational_unit),
            ("CN", &self.common_name),
        ];
        let joined = parts
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| format!("{}={}", k, v)))
            .collect::<Vec<_>>()
            .join(";");
        f.write_str(&joined)
    }
}

/// Everything a certificate directory record needs from one certificate
#[derive(Debug, Clone)]
pub struct ParsedCertificate {
    pub der: Vec<u8>,
    pub fingerprint: Digest20,
    pub modulus_hash: Digest20,
    pub subject_hash: Digest20,
    pub issuer_hash: Digest20,
    pub subject: DistinguishedName,
    pub issuer: DistinguishedName,
    pub modulus_bits: usize,
}

impl ParsedCertificate {
    /// Parse a DER certificate, or the first certificate of a PEM bundle
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if contains(bytes, PEM_MARKER) {
            let der = pem_to_der(bytes)?;
            Self::from_der(&der)
        } else {
            Self::from_der(bytes)
        }
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = parse_x509_certificate(der)
            .map_err(|e| Error::CertificateFormat(format!("not an X.509 certificate: {}", e)))?;

        let key = cert.public_key().parsed().map_err(|e| {
            Error::CertificateFormat(format!("unreadable public key: {}", e))
        })?;
        let modulus = match key {
            PublicKey::RSA(rsa) => rsa.modulus,
            _ => {
                return Err(Error::CertificateFormat(
                    "public key is not RSA".to_string(),
                ))
            }
        };
        let modulus = match modulus.split_first() {
            Some((0, rest)) => rest,
            _ => modulus,
        };

        Ok(Self {
            der: der.to_vec(),
            fingerprint: sha1_digest(der),
            modulus_hash: sha1_digest(modulus),
            subject_hash: sha1_digest(cert.subject().as_raw()),
            issuer_hash: sha1_digest(cert.issuer().as_raw()),
            subject: DistinguishedName::from_x509(cert.subject()),
            issuer: DistinguishedName::from_x509(cert.issuer()),
            modulus_bits: modulus_bits(modulus),
        })
    }

    /// Subject common name; doubles as the file name on the phone
    pub fn common_name(&self) -> Result<&str> {
        self.subject
            .common_name
            .as_deref()
            .filter(|cn| !cn.is_empty())
            .ok_or_else(|| {
                Error::CertificateFormat("certificate subject has no common name".to_string())
            })
    }
}

fn modulus_bits(modulus: &[u8]) -> usize {
    match modulus.iter().position(|&b| b != 0) {
        Some(i) => (modulus.len() - i) * 8 - modulus[i].leading_zeros() as usize,
        None => 0,
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn pem_to_der(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut reader = bytes;
    let first = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| Error::CertificateFormat("PEM input holds no certificate".to_string()))?
        .map_err(|e| Error::CertificateFormat(format!("invalid PEM: {}", e)))?;
    Ok(first.as_ref().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DER: &[u8] = include_bytes!("../tests/data/test_cert.der");
    const PEM: &[u8] = include_bytes!("../tests/data/test_cert.pem");

    #[test]
    fn test_digests_match_reference_values() {
        let cert = ParsedCertificate::from_bytes(DER).unwrap();
        assert_eq!(
            hex::encode(cert.fingerprint),
            "1e3b7a03e72901168d4b641a2b2bf46f1fb38700"
        );
        assert_eq!(
            hex::encode(cert.modulus_hash),
            "a23e4206dbdcc7c4a73140c2c3650d93b4365ef0"
        );
        assert_eq!(
            hex::encode(cert.subject_hash),
            "4bfac9f48114d2588491dcdcf86e8f2a28a5c682"
        );
        assert_eq!(cert.issuer_hash, cert.subject_hash);
        assert_eq!(cert.modulus_bits, 1024);
    }

    #[test]
    fn test_pem_and_der_agree() {
        let from_pem = ParsedCertificate::from_bytes(PEM).unwrap();
        let from_der = ParsedCertificate::from_bytes(DER).unwrap();
        assert_eq!(from_pem.der, from_der.der);
        assert_eq!(from_pem.fingerprint, from_der.fingerprint);
    }

    #[test]
    fn test_distinguished_name_format() {
        let cert = ParsedCertificate::from_bytes(DER).unwrap();
        assert_eq!(
            cert.subject.to_string(),
            "C=NL;ST=Noord-Holland;L=Amsterdam;O=Example Org;OU=Mobile;CN=Test Signing CA"
        );
        assert_eq!(cert.common_name().unwrap(), "Test Signing CA");

        let partial = DistinguishedName {
            organization: Some("Acme".to_string()),
            common_name: Some("Root".to_string()),
            ..DistinguishedName::default()
        };
        assert_eq!(partial.to_string(), "O=Acme;CN=Root");
        assert_eq!(DistinguishedName::default().to_string(), "");
    }

    #[test]
    fn test_garbage_is_certificate_format_error() {
        assert!(matches!(
            ParsedCertificate::from_bytes(b"not a certificate"),
            Err(Error::CertificateFormat(_))
        ));
        assert!(matches!(
            ParsedCertificate::from_bytes(b"-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----\n"),
            Err(Error::CertificateFormat(_))
        ));
        assert!(matches!(
            ParsedCertificate::from_bytes(&DER[..DER.len() / 2]),
            Err(Error::CertificateFormat(_))
        ));
    }

    #[test]
    fn test_modulus_bits() {
        assert_eq!(modulus_bits(&[0x01, 0x00]), 9);
        assert_eq!(modulus_bits(&[0x00, 0x80]), 8);
        assert_eq!(modulus_bits(&[]), 0);
    }
}
