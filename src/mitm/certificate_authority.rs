//! Certificate Authority - root lifecycle and leaf issuance for interception
//!
//! The root identity is created once (generated fresh or restored from a
//! [`CertificateStore`]) and stays immutable for the lifetime of the authority.
//! Leaf certificates are issued on demand, signed by the root, and cached per
//! primary hostname so repeat connections skip RSA key generation.
//!
//! Key generation and signing are CPU-bound; the async entry points run them
//! on tokio's blocking pool.

use crate::mitm::cert_cache::LeafCache;
use crate::mitm::cert_store::{CertificateStore, StoredRoot};
use crate::mitm::error::{MitmError, Result};
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CustomExtension, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use secrecy::{ExposeSecret, SecretString};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

const ORGANISATION_NAME: &str = "Tapwire Proxy CA";
const CA_COMMON_NAME: &str = "ProxyCA";
const PLACEHOLDER: &str = "N/A";

/// Random bytes in a serial number; a leading zero byte keeps the ASN.1 INTEGER positive
const SERIAL_RANDOM_BYTES: usize = 18;

const ROOT_VALIDITY_YEARS: i32 = 10;
const LEAF_VALIDITY_YEARS: i32 = 2;

/// Netscape certificate type (legacy cert-type flags)
const OID_NETSCAPE_CERT_TYPE: &[u64] = &[2, 16, 840, 1, 113730, 1, 1];

/// BIT STRING: client, server, email, objsign, sslCA, emailCA, objCA
const CA_NS_CERT_TYPE: &[u8] = &[0x03, 0x02, 0x00, 0xf7];

/// BIT STRING: client, server (six unused trailing bits)
const LEAF_NS_CERT_TYPE: &[u8] = &[0x03, 0x02, 0x06, 0xc0];

/// Root key pair and self-signed certificate
pub struct RootIdentity {
    key_pair: KeyPair,
    certificate: Certificate,
    certificate_pem: String,
    subject: DistinguishedName,
}

impl RootIdentity {
    /// Generate a fresh 2048-bit RSA root valid for ten years
    pub fn generate() -> Result<Self> {
        let key_pair = generate_key_pair()
            .map_err(|e| MitmError::ca_generation(format!("Failed to generate key pair: {}", e)))?;

        let now = OffsetDateTime::now_utc();
        let subject = ca_subject();

        let mut params = CertificateParams::default();
        params.distinguished_name = subject.clone();
        params.serial_number = Some(SerialNumber::from(random_serial_number()));
        params.not_before = just_before(now);
        params.not_after = years_after(now, ROOT_VALIDITY_YEARS);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::ContentCommitment,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DataEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::CodeSigning,
            ExtendedKeyUsagePurpose::EmailProtection,
            ExtendedKeyUsagePurpose::TimeStamping,
        ];
        params.custom_extensions = vec![CustomExtension::from_oid_content(
            OID_NETSCAPE_CERT_TYPE,
            CA_NS_CERT_TYPE.to_vec(),
        )];

        let certificate = params
            .self_signed(&key_pair)
            .map_err(|e| MitmError::ca_generation(format!("Failed to self-sign root: {}", e)))?;
        let certificate_pem = certificate.pem();

        info!("Generated new root certificate");

        Ok(Self {
            key_pair,
            certificate,
            certificate_pem,
            subject,
        })
    }

    /// Restore a root from PEM-encoded certificate and private key
    pub fn from_pem(certificate_pem: &str, private_key_pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(private_key_pem)
            .map_err(|e| MitmError::ca_load(format!("Failed to parse private key: {}", e)))?;

        let params = CertificateParams::from_ca_cert_pem(certificate_pem)
            .map_err(|e| MitmError::ca_load(format!("Failed to parse certificate: {}", e)))?;
        if !matches!(params.is_ca, IsCa::Ca(_)) {
            return Err(MitmError::ca_load("Persisted certificate is not a CA"));
        }
        let subject = params.distinguished_name.clone();

        // Re-signing only rebuilds rcgen's issuer handle; the persisted PEM is what clients trust.
        let certificate = params
            .self_signed(&key_pair)
            .map_err(|e| MitmError::ca_load(format!("Failed to rebuild root: {}", e)))?;

        Ok(Self {
            key_pair,
            certificate,
            certificate_pem: certificate_pem.to_string(),
            subject,
        })
    }

    /// Root certificate in PEM form, for installation as a trusted CA
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// Subject attributes, copied verbatim into every leaf's issuer
    pub fn subject(&self) -> &DistinguishedName {
        &self.subject
    }

    fn to_stored(&self) -> StoredRoot {
        StoredRoot {
            certificate_pem: self.certificate_pem.clone(),
            private_key_pem: SecretString::new(self.key_pair.serialize_pem()),
        }
    }
}

/// Certificate issued for a set of hosts
#[derive(Clone)]
pub struct LeafCertificateRecord {
    pub hostnames: Vec<String>,
    pub certificate_pem: String,
    pub certificate_der: Vec<u8>,
    pub private_key_pem: String,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    /// Lowercase hex, including the leading `00` byte
    pub serial_number: String,
}

impl std::fmt::Debug for LeafCertificateRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertificateRecord")
            .field("hostnames", &self.hostnames)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("serial_number", &self.serial_number)
            .finish_non_exhaustive()
    }
}

/// Cache and issuance counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub issued: u64,
}

/// Certificate Authority - issues and caches leaf certificates
pub struct CertificateAuthority {
    root: Arc<RootIdentity>,
    cache: LeafCache,
    issued: Arc<AtomicU64>,
}

impl CertificateAuthority {
    /// Wrap an existing root
    pub fn new(root: RootIdentity) -> Self {
        Self {
            root: Arc::new(root),
            cache: LeafCache::new(),
            issued: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create an authority with a freshly generated root
    pub async fn initialize() -> Result<Self> {
        let root = tokio::task::spawn_blocking(RootIdentity::generate)
            .await
            .map_err(|e| MitmError::TaskFailed(e.to_string()))??;
        Ok(Self::new(root))
    }

    /// Restore the root from `store`, or generate and persist a new one
    ///
    /// Store failures are logged and never fatal: an unreadable or invalid
    /// persisted root is replaced, and a failed save leaves the authority
    /// running with an unpersisted root.
    pub async fn load_or_initialize(store: &dyn CertificateStore) -> Result<Self> {
        match store.load().await {
            Ok(Some(stored)) => {
                match RootIdentity::from_pem(
                    &stored.certificate_pem,
                    stored.private_key_pem.expose_secret(),
                ) {
                    Ok(root) => {
                        info!("Certificate Authority restored from store");
                        return Ok(Self::new(root));
                    }
                    Err(e) => warn!(error = %e, "Persisted root unusable, generating a new one"),
                }
            }
            Ok(None) => debug!("No persisted root, generating a new one"),
            Err(e) => warn!(error = %e, "Certificate store unavailable, generating a new root"),
        }

        let authority = Self::initialize().await?;
        if let Err(e) = store.save(&authority.root.to_stored()).await {
            warn!(error = %e, "Failed to persist root, continuing without persistence");
        }
        Ok(authority)
    }

    pub fn root(&self) -> &RootIdentity {
        &self.root
    }

    pub fn root_certificate_pem(&self) -> &str {
        self.root.certificate_pem()
    }

    /// Issue a leaf for `hosts` on the calling thread (not cached)
    pub fn certificate_for_hosts(&self, hosts: &[String]) -> Result<LeafCertificateRecord> {
        let record = issue_leaf(&self.root, hosts)?;
        self.issued.fetch_add(1, Ordering::Relaxed);
        Ok(record)
    }

    /// Issue a leaf for `hosts` on the blocking pool (not cached)
    pub async fn issue_for_hosts(&self, hosts: Vec<String>) -> Result<LeafCertificateRecord> {
        let root = Arc::clone(&self.root);
        let issued = Arc::clone(&self.issued);
        tokio::task::spawn_blocking(move || {
            let record = issue_leaf(&root, &hosts)?;
            issued.fetch_add(1, Ordering::Relaxed);
            Ok(record)
        })
        .await
        .map_err(|e| MitmError::TaskFailed(e.to_string()))?
    }

    /// Cached leaf for a single hostname, issued on first contact
    pub async fn leaf_for_host(&self, hostname: &str) -> Result<Arc<LeafCertificateRecord>> {
        self.cache
            .get_or_issue(hostname, || self.issue_for_hosts(vec![hostname.to_string()]))
            .await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        CacheStats {
            entries: self.cache.len().await,
            hits: self.cache.hits(),
            misses: self.cache.misses(),
            issued: self.issued.load(Ordering::Relaxed),
        }
    }
}

fn issue_leaf(root: &RootIdentity, hosts: &[String]) -> Result<LeafCertificateRecord> {
    let primary = hosts.first().ok_or(MitmError::NoHosts)?;
    debug!(hosts = ?hosts, "Issuing leaf certificate");

    let key_pair = generate_key_pair()
        .map_err(|e| MitmError::cert_generation(primary, format!("Key generation: {}", e)))?;

    let now = OffsetDateTime::now_utc();
    let serial = random_serial_number();
    let not_before = just_before(now);
    let not_after = years_after(now, LEAF_VALIDITY_YEARS);

    let mut params = CertificateParams::default();
    params.distinguished_name = leaf_subject(primary);
    params.serial_number = Some(SerialNumber::from(serial.clone()));
    params.not_before = not_before;
    params.not_after = not_after;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DataEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.custom_extensions = vec![CustomExtension::from_oid_content(
        OID_NETSCAPE_CERT_TYPE,
        LEAF_NS_CERT_TYPE.to_vec(),
    )];
    params.use_authority_key_identifier_extension = true;
    params.subject_alt_names = hosts
        .iter()
        .map(|host| san_for_host(host))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| MitmError::cert_generation(primary, format!("Invalid host: {}", e)))?;

    let certificate = params
        .signed_by(&key_pair, &root.certificate, &root.key_pair)
        .map_err(|e| MitmError::cert_generation(primary, format!("Signing: {}", e)))?;

    Ok(LeafCertificateRecord {
        hostnames: hosts.to_vec(),
        certificate_pem: certificate.pem(),
        certificate_der: certificate.der().to_vec(),
        private_key_pem: key_pair.serialize_pem(),
        not_before: truncate_to_second(not_before),
        not_after: truncate_to_second(not_after),
        serial_number: to_hex(&serial),
    })
}

fn generate_key_pair() -> std::result::Result<KeyPair, rcgen::Error> {
    KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
}

/// IP literals get an `iPAddress` SAN, everything else a `dNSName`
fn san_for_host(host: &str) -> std::result::Result<SanType, rcgen::Error> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    match bare.parse::<IpAddr>() {
        Ok(ip) => Ok(SanType::IpAddress(ip)),
        Err(_) => Ok(SanType::DnsName(host.try_into()?)),
    }
}

fn ca_subject() -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::CountryName, PLACEHOLDER);
    dn.push(DnType::StateOrProvinceName, PLACEHOLDER);
    dn.push(DnType::LocalityName, PLACEHOLDER);
    dn.push(DnType::OrganizationName, ORGANISATION_NAME);
    dn.push(DnType::OrganizationalUnitName, PLACEHOLDER);
    dn
}

fn leaf_subject(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::CountryName, PLACEHOLDER);
    dn.push(DnType::StateOrProvinceName, PLACEHOLDER);
    dn.push(DnType::LocalityName, PLACEHOLDER);
    dn.push(DnType::OrganizationName, ORGANISATION_NAME);
    dn.push(
        DnType::OrganizationalUnitName,
        format!("{} Server Certificate", ORGANISATION_NAME),
    );
    dn
}

fn random_serial_number() -> Vec<u8> {
    let mut serial = vec![0u8; SERIAL_RANDOM_BYTES + 1];
    rand::thread_rng().fill_bytes(&mut serial[1..]);
    serial
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Backdated by a millisecond so a certificate is never rejected at the exact issuance instant
fn just_before(now: OffsetDateTime) -> OffsetDateTime {
    now - Duration::milliseconds(1)
}

fn years_after(now: OffsetDateTime, years: i32) -> OffsetDateTime {
    now.replace_year(now.year() + years)
        .unwrap_or_else(|_| now + Duration::days(365 * i64::from(years)))
}

/// X.509 validity has second precision
fn truncate_to_second(dt: OffsetDateTime) -> OffsetDateTime {
    dt - Duration::nanoseconds(i64::from(dt.nanosecond()))
}
