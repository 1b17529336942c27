//! CA lifecycle tests across process boundaries: persist, reload, and keep
//! signing.

use gosniffer::{CertificateAuthority, KeyAlgorithm, RequestLog};
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

fn quiet_log() -> RequestLog {
    RequestLog::with_sink(Box::new(std::io::sink()))
}

#[test]
fn reloaded_ca_keeps_its_identity_and_signs_leaves() {
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("ca-cert.pem");
    let key_path = dir.path().join("ca-key.pem");

    let original = CertificateAuthority::generate(KeyAlgorithm::EcdsaP256).unwrap();
    original.save(&cert_path, &key_path).unwrap();

    let reloaded = CertificateAuthority::load(&cert_path, &key_path).unwrap();
    assert_eq!(reloaded.fingerprint(), original.fingerprint());

    // Leaves minted by the reloaded CA must chain to the original root.
    let leaf = reloaded.mint("example.com", &quiet_log()).unwrap();
    let (_, leaf_cert) = parse_x509_certificate(leaf.cert_der()).unwrap();
    let (_, root_cert) = parse_x509_certificate(original.cert_der()).unwrap();
    assert_eq!(
        leaf_cert.issuer().to_string(),
        root_cert.subject().to_string()
    );
    leaf_cert
        .verify_signature(Some(root_cert.public_key()))
        .expect("leaf must verify against the persisted root");
}

#[test]
fn rsa_ca_round_trips_through_pem_files() {
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("ca-cert.pem");
    let key_path = dir.path().join("ca-key.pem");

    let original = CertificateAuthority::generate(KeyAlgorithm::Rsa2048).unwrap();
    original.save(&cert_path, &key_path).unwrap();

    let reloaded = CertificateAuthority::load(&cert_path, &key_path).unwrap();
    assert_eq!(reloaded.fingerprint(), original.fingerprint());
    assert_eq!(reloaded.algorithm(), KeyAlgorithm::Rsa2048);

    let leaf = reloaded.mint("rsa.example.com", &quiet_log()).unwrap();
    let (_, cert) = parse_x509_certificate(leaf.cert_der()).unwrap();
    assert!(matches!(
        cert.public_key().parsed().unwrap(),
        PublicKey::RSA(_)
    ));
}

#[test]
fn corrupted_cert_file_fails_to_load() {
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("ca-cert.pem");
    let key_path = dir.path().join("ca-key.pem");

    let ca = CertificateAuthority::generate(KeyAlgorithm::EcdsaP256).unwrap();
    ca.save(&cert_path, &key_path).unwrap();
    std::fs::write(&cert_path, "-----BEGIN CERTIFICATE-----\nnot base64\n").unwrap();

    assert!(CertificateAuthority::load(&cert_path, &key_path).is_err());
}

#[test]
fn mint_emits_a_cert_log_record() {
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let buf = Arc::new(Mutex::new(Vec::new()));
    let log = RequestLog::with_sink(Box::new(SharedBuf(Arc::clone(&buf))));

    let ca = CertificateAuthority::generate(KeyAlgorithm::EcdsaP256).unwrap();
    let leaf = ca.mint("logged.example", &log).unwrap();

    let out = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
    assert!(out.contains("[CERT] Generated leaf certificate for logged.example"));
    assert!(out.contains(leaf.fingerprint()));
}
