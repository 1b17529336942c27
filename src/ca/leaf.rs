//! Per-hostname leaf certificates minted by the root CA.

use crate::ca::authority::{random_serial, sha256_hex, CertificateAuthority};
use crate::error::{ProxyError, Result};
use crate::logger::RequestLog;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Ia5String, IsCa,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;

const LEAF_ORGANIZATION: &str = "GoSniffer Leaf Certificate";
const LEAF_VALIDITY_DAYS: i64 = 90;

/// A minted leaf certificate with its key, ready to serve as a TLS identity.
#[derive(Debug)]
pub struct LeafCertificate {
    hostname: String,
    cert_der: CertificateDer<'static>,
    fingerprint: String,
    server_config: Arc<ServerConfig>,
    created_at: Instant,
}

impl LeafCertificate {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Hex-encoded SHA-256 fingerprint over the certificate DER.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// rustls server configuration presenting this certificate.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl CertificateAuthority {
    /// Mint a leaf certificate for `hostname`, signed by this CA.
    ///
    /// The keypair uses the same algorithm family as the CA key. Emits a
    /// `cert` log record with the new certificate's fingerprint.
    pub fn mint(&self, hostname: &str, log: &RequestLog) -> Result<LeafCertificate> {
        let key_pair = self.algorithm().generate_key_pair().map_err(|e| {
            ProxyError::cert_generation(hostname, format!("key generation failed: {e}"))
        })?;

        let mut params = CertificateParams::default();
        params.serial_number = Some(random_serial());

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, LEAF_ORGANIZATION);
        dn.push(DnType::CommonName, hostname);
        params.distinguished_name = dn;

        let san = Ia5String::try_from(hostname.to_string())
            .map_err(|e| ProxyError::cert_generation(hostname, format!("invalid hostname: {e}")))?;
        params.subject_alt_names = vec![SanType::DnsName(san)];

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);

        params.key_usages = vec![
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.is_ca = IsCa::ExplicitNoCa;

        let cert = params
            .signed_by(&key_pair, self.issuer(), self.key_pair())
            .map_err(|e| ProxyError::cert_generation(hostname, format!("signing failed: {e}")))?;

        let cert_der = cert.der().clone();
        let fingerprint = sha256_hex(&cert_der);

        let key_der =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let server_config = crate::tls::client_facing_config(vec![cert_der.clone()], key_der)
            .map_err(|e| ProxyError::cert_generation(hostname, e.to_string()))?;

        log.cert(hostname, &fingerprint);

        Ok(LeafCertificate {
            hostname: hostname.to_string(),
            cert_der,
            fingerprint,
            server_config,
            created_at: Instant::now(),
        })
    }
}
