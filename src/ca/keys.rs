//! Key algorithm selection and private-key material handling.
//!
//! The CA supports two key flavors: 2048-bit RSA and ECDSA P-256. Keys are
//! persisted as PEM and may come back in any of the three common encodings
//! (PKCS#1, SEC1, PKCS#8); everything is normalized to PKCS#8 before being
//! handed to rcgen, and strength is validated along the way.

use crate::error::{ProxyError, Result};
use p256::pkcs8::DecodePrivateKey as _;
use rcgen::KeyPair;
use rsa::pkcs1::DecodeRsaPrivateKey as _;
use rsa::pkcs8::{EncodePrivateKey as _, EncodePublicKey as _};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fmt;
use std::str::FromStr;

const MIN_RSA_BITS: usize = 2048;

/// Supported CA key algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// 2048-bit RSA with SHA-256 signatures
    Rsa2048,
    /// ECDSA over P-256 with SHA-256 signatures
    EcdsaP256,
}

impl KeyAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rsa2048 => "rsa",
            Self::EcdsaP256 => "ecdsa",
        }
    }

    pub(crate) fn signature_algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            Self::Rsa2048 => &rcgen::PKCS_RSA_SHA256,
            Self::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
        }
    }

    /// Generate a fresh keypair of this flavor from the OS CSPRNG.
    pub(crate) fn generate_key_pair(&self) -> std::result::Result<KeyPair, rcgen::Error> {
        KeyPair::generate_for(self.signature_algorithm())
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rsa" => Ok(Self::Rsa2048),
            "ecdsa" => Ok(Self::EcdsaP256),
            other => Err(ProxyError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// A private key parsed from PEM, normalized to an rcgen keypair.
#[derive(Debug)]
pub struct DecodedKey {
    pub key_pair: KeyPair,
    pub algorithm: KeyAlgorithm,
    /// SubjectPublicKeyInfo DER of the matching public key.
    pub public_key_der: Vec<u8>,
}

/// Parse a PEM private key in PKCS#1, SEC1 or PKCS#8 encoding.
///
/// Fails on decode errors, unsupported key variants, and strength violations
/// (RSA below 2048 bits, ECDSA curves other than P-256).
pub fn decode_private_key_pem(pem: &str) -> Result<DecodedKey> {
    let der = rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| ProxyError::KeyDecode(e.to_string()))?
        .ok_or_else(|| ProxyError::KeyDecode("no private key PEM block found".into()))?;

    match der {
        PrivateKeyDer::Pkcs1(der) => {
            let key = RsaPrivateKey::from_pkcs1_der(der.secret_pkcs1_der())
                .map_err(|e| ProxyError::KeyDecode(format!("invalid PKCS#1 RSA key: {e}")))?;
            decoded_rsa(&key)
        }
        PrivateKeyDer::Sec1(der) => {
            let key = p256::SecretKey::from_sec1_der(der.secret_sec1_der())
                .map_err(|_| ProxyError::KeyStrength("ECDSA curve must be P-256".into()))?;
            decoded_p256(&key)
        }
        PrivateKeyDer::Pkcs8(der) => {
            let bytes = der.secret_pkcs8_der();
            if let Ok(key) = RsaPrivateKey::from_pkcs8_der(bytes) {
                decoded_rsa(&key)
            } else if let Ok(key) = p256::SecretKey::from_pkcs8_der(bytes) {
                decoded_p256(&key)
            } else {
                Err(ProxyError::KeyStrength(
                    "unsupported key variant (expected RSA >= 2048 bits or ECDSA P-256)".into(),
                ))
            }
        }
        _ => Err(ProxyError::KeyDecode(
            "unrecognized private key encoding".into(),
        )),
    }
}

/// Check that a certificate embeds exactly this public key.
pub(crate) fn public_keys_match(cert_der: &[u8], public_key_der: &[u8]) -> Result<bool> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| ProxyError::KeyDecode(format!("invalid certificate DER: {e}")))?;
    Ok(cert.tbs_certificate.subject_pki.raw == public_key_der)
}

fn decoded_rsa(key: &RsaPrivateKey) -> Result<DecodedKey> {
    validate_rsa_strength(key)?;
    let pkcs8 = key
        .to_pkcs8_der()
        .map_err(|e| ProxyError::KeyDecode(e.to_string()))?;
    let public_key_der = key
        .to_public_key()
        .to_public_key_der()
        .map_err(|e| ProxyError::KeyDecode(e.to_string()))?
        .into_vec();
    key_pair_from_pkcs8(pkcs8.as_bytes(), KeyAlgorithm::Rsa2048, public_key_der)
}

fn decoded_p256(key: &p256::SecretKey) -> Result<DecodedKey> {
    let pkcs8 = key
        .to_pkcs8_der()
        .map_err(|e| ProxyError::KeyDecode(e.to_string()))?;
    let public_key_der = key
        .public_key()
        .to_public_key_der()
        .map_err(|e| ProxyError::KeyDecode(e.to_string()))?
        .into_vec();
    key_pair_from_pkcs8(pkcs8.as_bytes(), KeyAlgorithm::EcdsaP256, public_key_der)
}

fn key_pair_from_pkcs8(
    der: &[u8],
    algorithm: KeyAlgorithm,
    public_key_der: Vec<u8>,
) -> Result<DecodedKey> {
    let pkcs8 = PrivatePkcs8KeyDer::from(der.to_vec());
    let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8, algorithm.signature_algorithm())
        .map_err(|e| ProxyError::KeyDecode(e.to_string()))?;
    Ok(DecodedKey {
        key_pair,
        algorithm,
        public_key_der,
    })
}

fn validate_rsa_strength(key: &RsaPrivateKey) -> Result<()> {
    let bits = key.size() * 8;
    if bits < MIN_RSA_BITS {
        return Err(ProxyError::KeyStrength(format!(
            "RSA key size {bits} bits is below minimum {MIN_RSA_BITS} bits"
        )));
    }
    Ok(())
}
