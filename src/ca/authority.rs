//! Root certificate authority: generation, persistence, loading.
//!
//! The CA is created once (or loaded from its PEM files) at startup and is
//! read-only afterwards; it signs the per-hostname leaf certificates served
//! to intercepted clients.

use crate::ca::keys::{self, KeyAlgorithm};
use crate::error::{ProxyError, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;
use time::{Duration, OffsetDateTime};
use tracing::debug;

const CA_COMMON_NAME: &str = "GoSniffer Root CA";
const CA_VALIDITY_DAYS: i64 = 10 * 365;

/// Root CA keypair and self-signed certificate.
pub struct CertificateAuthority {
    key_pair: KeyPair,
    issuer: Certificate,
    algorithm: KeyAlgorithm,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    key_pem: String,
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("algorithm", &self.algorithm)
            .field("cert_der", &self.cert_der)
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"[redacted]")
            .finish()
    }
}

impl CertificateAuthority {
    /// Generate a new self-signed root CA.
    pub fn generate(algorithm: KeyAlgorithm) -> Result<Self> {
        let key_pair = algorithm
            .generate_key_pair()
            .map_err(|e| ProxyError::ca_generation(format!("key generation failed: {e}")))?;

        let mut params = CertificateParams::default();
        params.serial_number = Some(random_serial());

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, CA_COMMON_NAME);
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        params.key_usages = vec![
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| ProxyError::ca_generation(format!("self-signing failed: {e}")))?;

        let cert_der = cert.der().clone();
        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();

        debug!(
            algorithm = %algorithm,
            fingerprint = %sha256_hex(&cert_der),
            "generated root CA certificate"
        );

        Ok(Self {
            key_pair,
            issuer: cert,
            algorithm,
            cert_der,
            cert_pem,
            key_pem,
        })
    }

    /// Load a CA from PEM-encoded certificate and private key files.
    ///
    /// Accepts PKCS#1, SEC1 and PKCS#8 key encodings; validates key strength
    /// and that the key actually pairs with the certificate.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = fs::read_to_string(cert_path)
            .map_err(|e| ProxyError::ca_load(cert_path.display().to_string(), e.to_string()))?;
        let key_pem = fs::read_to_string(key_path)
            .map_err(|e| ProxyError::ca_load(key_path.display().to_string(), e.to_string()))?;

        let decoded = keys::decode_private_key_pem(&key_pem)?;

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .transpose()
            .map_err(|e| ProxyError::ca_load(cert_path.display().to_string(), e.to_string()))?
            .ok_or_else(|| {
                ProxyError::ca_load(
                    cert_path.display().to_string(),
                    "no CERTIFICATE PEM block found",
                )
            })?;

        if !keys::public_keys_match(&cert_der, &decoded.public_key_der)? {
            return Err(ProxyError::ca_load(
                cert_path.display().to_string(),
                "private key does not match certificate",
            ));
        }

        let issuer_params = CertificateParams::from_ca_cert_der(&cert_der)
            .map_err(|e| ProxyError::ca_load(cert_path.display().to_string(), e.to_string()))?;
        let issuer = issuer_params
            .self_signed(&decoded.key_pair)
            .map_err(|e| ProxyError::ca_load(cert_path.display().to_string(), e.to_string()))?;

        debug!(
            algorithm = %decoded.algorithm,
            fingerprint = %sha256_hex(&cert_der),
            "loaded root CA certificate"
        );

        Ok(Self {
            key_pair: decoded.key_pair,
            issuer,
            algorithm: decoded.algorithm,
            cert_der,
            cert_pem,
            key_pem,
        })
    }

    /// Persist the certificate (0644) and private key (0600) as PEM files,
    /// creating parent directories as needed.
    pub fn save(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        for path in [cert_path, key_path] {
            if let Some(dir) = path.parent() {
                if !dir.as_os_str().is_empty() {
                    fs::create_dir_all(dir).map_err(|e| ProxyError::CaSave {
                        path: dir.display().to_string(),
                        source: e,
                    })?;
                }
            }
        }

        write_with_mode(cert_path, self.cert_pem.as_bytes(), 0o644)?;
        write_with_mode(key_path, self.key_pem.as_bytes(), 0o600)?;
        Ok(())
    }

    /// Hex-encoded SHA-256 fingerprint over the certificate DER.
    pub fn fingerprint(&self) -> String {
        sha256_hex(&self.cert_der)
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub(super) fn issuer(&self) -> &Certificate {
        &self.issuer
    }

    pub(super) fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }
}

fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path)
            .map_err(|e| ProxyError::CaSave {
                path: path.display().to_string(),
                source: e,
            })?;
        file.write_all(contents).map_err(|e| ProxyError::CaSave {
            path: path.display().to_string(),
            source: e,
        })?;
        // The mode on open only applies to newly created files.
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
            ProxyError::CaSave {
                path: path.display().to_string(),
                source: e,
            }
        })?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
        fs::write(path, contents).map_err(|e| ProxyError::CaSave {
            path: path.display().to_string(),
            source: e,
        })
    }
}

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Cryptographically random 128-bit serial number.
pub(super) fn random_serial() -> SerialNumber {
    use rand::RngCore;

    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    SerialNumber::from_slice(&bytes)
}

pub(super) fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::*;
    use x509_parser::public_key::PublicKey;

    #[test]
    fn generated_ca_is_a_ca_with_cert_sign_usage() {
        let ca = CertificateAuthority::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let (_, cert) = parse_x509_certificate(ca.cert_der()).unwrap();

        let bc = cert.basic_constraints().unwrap().unwrap();
        assert!(bc.value.ca);

        let ku = cert.key_usage().unwrap().unwrap();
        assert!(ku.value.key_cert_sign());
        assert!(ku.value.digital_signature());

        let validity = cert.validity();
        let lifetime_secs = validity.not_after.timestamp() - validity.not_before.timestamp();
        assert!(lifetime_secs >= (CA_VALIDITY_DAYS - 1) * 86_400);
    }

    #[test]
    fn generated_rsa_ca_parses() {
        let ca = CertificateAuthority::generate(KeyAlgorithm::Rsa2048).unwrap();
        assert_eq!(ca.algorithm(), KeyAlgorithm::Rsa2048);
        assert_eq!(ca.fingerprint().len(), 64);
        let (_, cert) = parse_x509_certificate(ca.cert_der()).unwrap();
        match cert.public_key().parsed().unwrap() {
            // 2048-bit modulus is 256 octets, sometimes with a leading zero.
            PublicKey::RSA(rsa) => assert!(rsa.modulus.len() >= 256),
            other => panic!("expected RSA public key, got {other:?}"),
        }
    }

    #[test]
    fn serials_are_unique() {
        let a = CertificateAuthority::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let b = CertificateAuthority::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let (_, cert_a) = parse_x509_certificate(a.cert_der()).unwrap();
        let (_, cert_b) = parse_x509_certificate(b.cert_der()).unwrap();
        assert_ne!(cert_a.raw_serial(), cert_b.raw_serial());
    }

    #[test]
    fn save_and_load_round_trip_preserves_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca-cert.pem");
        let key_path = dir.path().join("ca-key.pem");

        let ca = CertificateAuthority::generate(KeyAlgorithm::EcdsaP256).unwrap();
        ca.save(&cert_path, &key_path).unwrap();

        let loaded = CertificateAuthority::load(&cert_path, &key_path).unwrap();
        assert_eq!(loaded.fingerprint(), ca.fingerprint());
        assert_eq!(loaded.algorithm(), KeyAlgorithm::EcdsaP256);
    }

    #[cfg(unix)]
    #[test]
    fn saved_key_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca-cert.pem");
        let key_path = dir.path().join("ca-key.pem");

        let ca = CertificateAuthority::generate(KeyAlgorithm::EcdsaP256).unwrap();
        ca.save(&cert_path, &key_path).unwrap();

        let cert_mode = fs::metadata(&cert_path).unwrap().permissions().mode() & 0o777;
        let key_mode = fs::metadata(&key_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(cert_mode, 0o644);
        assert_eq!(key_mode, 0o600);
    }

    #[test]
    fn save_creates_missing_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("deep").join("nested");
        let ca = CertificateAuthority::generate(KeyAlgorithm::EcdsaP256).unwrap();
        ca.save(&nested.join("ca-cert.pem"), &nested.join("ca-key.pem"))
            .unwrap();
        assert!(nested.join("ca-cert.pem").exists());
    }

    #[test]
    fn load_rejects_mismatched_key() {
        let dir = tempfile::tempdir().unwrap();
        let a = CertificateAuthority::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let b = CertificateAuthority::generate(KeyAlgorithm::EcdsaP256).unwrap();

        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        fs::write(&cert_path, a.cert_pem()).unwrap();
        fs::write(&key_path, b.key_pem()).unwrap();

        let err = CertificateAuthority::load(&cert_path, &key_path).unwrap_err();
        assert!(matches!(err, ProxyError::CaLoad { .. }), "got {err:?}");
    }

    #[test]
    fn load_missing_files_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = CertificateAuthority::load(
            &dir.path().join("absent-cert.pem"),
            &dir.path().join("absent-key.pem"),
        )
        .unwrap_err();
        assert!(matches!(err, ProxyError::CaLoad { .. }));
    }
}
