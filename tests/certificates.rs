use anyhow::Result;
use phonelink::cdf::{self, build_entry};
use phonelink::codec::Endianness;
use phonelink::mock::{InstantClock, MockPhone};
use phonelink::{CertificateStore, Framer, KeyUsage, ParsedCertificate, PhoneClient, SessionConfig};

const DER: &[u8] = include_bytes!("data/test_cert.der");
const PEM: &[u8] = include_bytes!("data/test_cert.pem");
const CDF_PATH: &str = "/predefhiddenfolder/certificates/auth/ext_info.sys";
const CERT_PATH: &str = "/predefhiddenfolder/certificates/auth/Test Signing CA";

fn connect(phone: &MockPhone) -> Result<PhoneClient<MockPhone>> {
    let framer = Framer::new(phone.clone()).with_clock(Box::new(InstantClock::default()));
    Ok(PhoneClient::connect(framer)?)
}

fn phone_with_cdf(endianness: Endianness) -> Result<MockPhone> {
    let phone = MockPhone::new();
    phone.add_dir("/predefhiddenfolder/certificates/auth");
    let cert = ParsedCertificate::from_bytes(DER)?;
    let existing = build_entry(&cert, endianness, KeyUsage::SERVER_AUTHENTIC)?;
    phone.add_file(CDF_PATH, existing);
    Ok(phone)
}

#[test]
fn install_appends_in_file_byte_order() -> Result<()> {
    let phone = phone_with_cdf(Endianness::Little)?;
    let mut client = connect(&phone)?;
    let config = SessionConfig::default();
    let mut store = CertificateStore::new(&mut client, &config);

    let cert = store.install_certificate(PEM, KeyUsage::APPS_SIGNING)?;
    assert_eq!(cert.common_name()?, "Test Signing CA");

    let state = phone.state();
    assert_eq!(state.file(CERT_PATH), Some(DER));
    let stored = cdf::parse(state.file(CDF_PATH).unwrap_or_default());
    assert_eq!(stored.endianness, Endianness::Little);
    assert_eq!(stored.items.len(), 2);
    assert_eq!(stored.items[0].key_usage, KeyUsage::SERVER_AUTHENTIC);
    assert_eq!(stored.items[1].key_usage, KeyUsage::APPS_SIGNING);
    assert_eq!(stored.items[1].fingerprint, cert.fingerprint);
    assert_eq!(stored.items[1].file_name, "Test Signing CA");
    Ok(())
}

#[test]
fn list_reads_directory_file() -> Result<()> {
    let phone = phone_with_cdf(Endianness::Big)?;
    let mut client = connect(&phone)?;
    let config = SessionConfig::default();
    let mut store = CertificateStore::new(&mut client, &config);

    let dir = store.list_certificates()?;
    assert_eq!(dir.endianness, Endianness::Big);
    assert_eq!(dir.items.len(), 1);
    assert_eq!(
        hex::encode(dir.items[0].subject_hash),
        "4bfac9f48114d2588491dcdcf86e8f2a28a5c682"
    );
    Ok(())
}

#[test]
fn install_creates_missing_directory_file() -> Result<()> {
    let phone = MockPhone::new();
    let mut client = connect(&phone)?;
    let config = SessionConfig::default();
    let mut store = CertificateStore::new(&mut client, &config);

    assert!(store.list_certificates()?.items.is_empty());
    store.install_certificate(DER, KeyUsage::APPS_SIGNING | KeyUsage::CROSS_CERTIFICATION)?;

    let dir = store.list_certificates()?;
    assert_eq!(dir.endianness, Endianness::Big);
    assert_eq!(dir.items.len(), 1);
    assert_eq!(
        dir.items[0].key_usage,
        KeyUsage::APPS_SIGNING | KeyUsage::CROSS_CERTIFICATION
    );
    Ok(())
}

#[test]
fn install_rejects_garbage_without_touching_phone() -> Result<()> {
    let phone = phone_with_cdf(Endianness::Big)?;
    let before = phone.state().file(CDF_PATH).map(<[u8]>::to_vec);
    let mut client = connect(&phone)?;
    let config = SessionConfig::default();
    let mut store = CertificateStore::new(&mut client, &config);

    assert!(matches!(
        store.install_certificate(b"garbage", KeyUsage::APPS_SIGNING),
        Err(phonelink::Error::CertificateFormat(_))
    ));
    assert_eq!(phone.state().file(CDF_PATH).map(<[u8]>::to_vec), before);
    assert!(phone.state().file(CERT_PATH).is_none());
    Ok(())
}

#[test]
fn custom_certificate_location() -> Result<()> {
    let phone = MockPhone::new();
    let mut client = connect(&phone)?;
    let config = SessionConfig {
        cert_dir: "/c/certs".to_string(),
        cdf_name: "index.sys".to_string(),
        ..SessionConfig::default()
    };
    let mut store = CertificateStore::new(&mut client, &config);
    assert_eq!(store.cdf_path(), "/c/certs/index.sys");
    store.install_certificate(DER, KeyUsage::SERVER_AUTHENTIC)?;
    assert!(phone.state().file("/c/certs/index.sys").is_some());
    assert!(phone.state().file("/c/certs/Test Signing CA").is_some());
    Ok(())
}
