//! Certificate authority and leaf certificate issuance.
//!
//! Cluster CAs are generated once, when the cluster token secret is first
//! written, and are never regenerated afterwards. Everything else (admin
//! client certs, kubelet serving certs, webhook certs) is a leaf issued from
//! one of those two CAs on demand.

use std::net::IpAddr;
use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, string::Ia5String,
};
use tracing::warn;
use x509_parser::prelude::*;

use crate::error::{PkiError, Result};

/// Validity of generated CA certificates (10 years)
pub const CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Validity used when a leaf is requested with a zero expiry (1 year)
pub const DEFAULT_LEAF_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Extended key usage of an issued leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    /// TLS server authentication
    ServerAuth,
    /// TLS client authentication
    ClientAuth,
}

impl From<KeyUsage> for ExtendedKeyUsagePurpose {
    fn from(usage: KeyUsage) -> Self {
        match usage {
            KeyUsage::ServerAuth => ExtendedKeyUsagePurpose::ServerAuth,
            KeyUsage::ClientAuth => ExtendedKeyUsagePurpose::ClientAuth,
        }
    }
}

fn compute_validity(validity: Duration) -> Result<(::time::OffsetDateTime, ::time::OffsetDateTime)> {
    let secs = i64::try_from(validity.as_secs())
        .map_err(|e| PkiError::CertificateGeneration(format!("validity out of range: {e}")))?;
    let now = ::time::OffsetDateTime::now_utc();
    Ok((now, now + ::time::Duration::seconds(secs)))
}

fn subject(common_name: &str, organizations: &[String]) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    // rcgen keeps one value per attribute type
    if let Some(org) = organizations.first() {
        dn.push(DnType::OrganizationName, DnValue::Utf8String(org.clone()));
    }
    if organizations.len() > 1 {
        warn!(
            common_name = %common_name,
            dropped = ?&organizations[1..],
            "Only the first organization is encoded in the certificate subject"
        );
    }
    dn
}

fn subject_alt_names(alt_names: &[String]) -> Result<Vec<SanType>> {
    alt_names
        .iter()
        .filter(|san| !san.is_empty())
        .map(|san| {
            if let Ok(ip) = san.parse::<IpAddr>() {
                Ok(SanType::IpAddress(ip))
            } else {
                Ia5String::try_from(san.clone())
                    .map(SanType::DnsName)
                    .map_err(|e| {
                        PkiError::CertificateGeneration(format!("invalid DNS name '{san}': {e}"))
                    })
            }
        })
        .collect()
}

/// Issues a leaf certificate signed by the given issuer.
///
/// `expiry` of zero selects [`DEFAULT_LEAF_VALIDITY`]. SANs that parse as IP
/// addresses become IP SANs, everything else a DNS SAN.
///
/// Returns `(cert_pem, key_pem)`.
pub fn issue_leaf_cert(
    common_name: &str,
    organizations: &[String],
    alt_names: &[String],
    usages: &[KeyUsage],
    expiry: Duration,
    issuer_cert_pem: &str,
    issuer_key_pem: &str,
) -> Result<(String, String)> {
    let mut params = CertificateParams::default();
    params.distinguished_name = subject(common_name, organizations);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = usages.iter().copied().map(Into::into).collect();
    params.subject_alt_names = subject_alt_names(alt_names)?;
    params.use_authority_key_identifier_extension = true;

    let validity = if expiry.is_zero() {
        DEFAULT_LEAF_VALIDITY
    } else {
        expiry
    };
    let (not_before, not_after) = compute_validity(validity)?;
    params.not_before = not_before;
    params.not_after = not_after;

    let key = KeyPair::generate()
        .map_err(|e| PkiError::KeyGeneration(format!("failed to generate leaf key: {e}")))?;

    let issuer_key = KeyPair::from_pem(issuer_key_pem)
        .map_err(|e| PkiError::Parse(format!("failed to load issuer key: {e}")))?;
    let issuer = Issuer::from_ca_cert_pem(issuer_cert_pem, &issuer_key)
        .map_err(|e| PkiError::Parse(format!("failed to load issuer certificate: {e}")))?;

    let cert = params.signed_by(&key, &issuer).map_err(|e| {
        PkiError::CertificateGeneration(format!("failed to sign '{common_name}': {e}"))
    })?;

    Ok((cert.pem(), key.serialize_pem()))
}

/// Parse PEM-encoded data and return the DER bytes of the first block
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let block = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::Parse(format!("failed to parse PEM: {e}")))?;
    Ok(block.contents().to_vec())
}

/// CA certificate and key, both PEM encoded
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = subject(common_name, &[]);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = compute_validity(CA_VALIDITY)?;
        params.not_before = not_before;
        params.not_after = not_after;

        let key = KeyPair::generate()
            .map_err(|e| PkiError::KeyGeneration(format!("failed to generate CA key: {e}")))?;
        let cert = params.self_signed(&key).map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to create CA cert: {e}"))
        })?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    /// Load an existing CA, checking both halves parse
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to parse CA key: {e}")))?;
        parse_pem(cert_pem)?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
        })
    }

    #[must_use]
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    #[must_use]
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Issue a leaf signed by this CA, see [`issue_leaf_cert`]
    pub fn issue(
        &self,
        common_name: &str,
        organizations: &[String],
        alt_names: &[String],
        usages: &[KeyUsage],
        expiry: Duration,
    ) -> Result<(String, String)> {
        issue_leaf_cert(
            common_name,
            organizations,
            alt_names,
            usages,
            expiry,
            &self.cert_pem,
            &self.key_pem,
        )
    }
}

/// Subject and validity of a certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// Subject common name
    pub common_name: String,
    /// Subject organizations
    pub organizations: Vec<String>,
    /// DNS and IP SANs rendered as strings
    pub alt_names: Vec<String>,
    /// Unix timestamp the certificate becomes valid
    pub not_before: i64,
    /// Unix timestamp the certificate expires
    pub not_after: i64,
    /// Whether the certificate is a CA
    pub is_ca: bool,
}

impl CertificateInfo {
    /// Parse certificate info from a PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {e}")))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();
        let organizations = cert
            .subject()
            .iter_organization()
            .filter_map(|o| o.as_str().ok())
            .map(str::to_string)
            .collect();

        let mut alt_names = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => alt_names.push((*dns).to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Ok(octets) = <[u8; 4]>::try_from(*bytes) {
                            alt_names.push(IpAddr::from(octets).to_string());
                        } else if let Ok(octets) = <[u8; 16]>::try_from(*bytes) {
                            alt_names.push(IpAddr::from(octets).to_string());
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(Self {
            common_name,
            organizations,
            alt_names,
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            is_ca: cert.is_ca(),
        })
    }

    /// Total lifetime in seconds
    #[must_use]
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 24 * 60 * 60;

    fn verify_signed_by(leaf_pem: &str, ca_pem: &str) -> bool {
        let leaf_der = parse_pem(leaf_pem).unwrap();
        let ca_der = parse_pem(ca_pem).unwrap();
        let (_, leaf) = X509Certificate::from_der(&leaf_der).unwrap();
        let (_, ca) = X509Certificate::from_der(&ca_der).unwrap();
        leaf.verify_signature(Some(ca.public_key())).is_ok()
    }

    #[test]
    fn test_ca_can_be_created() {
        let ca = CertificateAuthority::new("k3s-server-ca").unwrap();
        assert!(ca.cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem().contains("PRIVATE KEY"));

        let info = CertificateInfo::from_pem(ca.cert_pem()).unwrap();
        assert!(info.is_ca);
        assert_eq!(info.common_name, "k3s-server-ca");
        assert!(info.lifetime_secs() >= 3649 * DAY);
    }

    #[test]
    fn test_ca_round_trips_through_pem() {
        let ca = CertificateAuthority::new("k3s-client-ca").unwrap();
        let loaded = CertificateAuthority::from_pem(ca.cert_pem(), ca.key_pem()).unwrap();
        assert_eq!(ca, loaded);
    }

    #[test]
    fn test_from_pem_rejects_garbage() {
        assert!(CertificateAuthority::from_pem("not a cert", "not a key").is_err());
    }

    #[test]
    fn test_zero_expiry_uses_default_validity() {
        let ca = CertificateAuthority::new("ca").unwrap();
        let (cert, _) = ca
            .issue("node-1", &[], &[], &[KeyUsage::ServerAuth], Duration::ZERO)
            .unwrap();

        let info = CertificateInfo::from_pem(&cert).unwrap();
        // Not already expired, and roughly one year long
        assert!(info.lifetime_secs() >= 364 * DAY);
        assert!(info.lifetime_secs() <= 366 * DAY);
    }

    #[test]
    fn test_explicit_expiry_is_honoured() {
        let ca = CertificateAuthority::new("ca").unwrap();
        let (cert, _) = ca
            .issue(
                "system:admin",
                &["system:masters".to_string()],
                &[],
                &[KeyUsage::ClientAuth],
                Duration::from_secs(356 * 24 * 60 * 60),
            )
            .unwrap();

        let info = CertificateInfo::from_pem(&cert).unwrap();
        assert_eq!(info.lifetime_secs(), 356 * DAY);
        assert_eq!(info.common_name, "system:admin");
        assert_eq!(info.organizations, vec!["system:masters".to_string()]);
        assert!(!info.is_ca);
    }

    #[test]
    fn test_leaf_is_signed_by_issuer() {
        let ca = CertificateAuthority::new("ca").unwrap();
        let other = CertificateAuthority::new("other").unwrap();
        let (cert, key) = issue_leaf_cert(
            "node-1",
            &[],
            &["node-1".to_string(), "10.0.0.5".to_string()],
            &[KeyUsage::ServerAuth],
            Duration::ZERO,
            ca.cert_pem(),
            ca.key_pem(),
        )
        .unwrap();

        assert!(key.contains("PRIVATE KEY"));
        assert!(verify_signed_by(&cert, ca.cert_pem()));
        assert!(!verify_signed_by(&cert, other.cert_pem()));
    }

    #[test]
    fn test_alt_names_split_between_dns_and_ip() {
        let ca = CertificateAuthority::new("ca").unwrap();
        let (cert, _) = ca
            .issue(
                "node-1",
                &[],
                &[
                    "node-1".to_string(),
                    "10.43.0.12".to_string(),
                    String::new(),
                    "k3k-c-service.ns".to_string(),
                ],
                &[KeyUsage::ServerAuth],
                Duration::ZERO,
            )
            .unwrap();

        let info = CertificateInfo::from_pem(&cert).unwrap();
        assert_eq!(
            info.alt_names,
            vec![
                "node-1".to_string(),
                "10.43.0.12".to_string(),
                "k3k-c-service.ns".to_string()
            ]
        );
    }

    #[test]
    fn test_extended_key_usage_is_set() {
        let ca = CertificateAuthority::new("ca").unwrap();
        let (cert, _) = ca
            .issue("admin", &[], &[], &[KeyUsage::ClientAuth], Duration::ZERO)
            .unwrap();
        let der = parse_pem(&cert).unwrap();
        let (_, parsed) = X509Certificate::from_der(&der).unwrap();
        let eku = parsed.extended_key_usage().unwrap().unwrap();
        assert!(eku.value.client_auth);
        assert!(!eku.value.server_auth);
    }

    #[test]
    fn test_wrong_issuer_key_is_rejected() {
        assert!(matches!(
            issue_leaf_cert("x", &[], &[], &[], Duration::ZERO, "bad", "bad"),
            Err(PkiError::Parse(_))
        ));
    }
}
