//! Certificate signing for joining nodes
//!
//! Joining nodes generate their own key pairs and submit CSRs; the cluster CA
//! on this node signs them. The agent never sees a node's private key.
//!
//! # Signing policy
//!
//! - Subject and SANs are taken from the CSR as submitted
//! - SHA-256 signature by the cluster CA key
//! - Validity runs from the start of today for [`VALIDITY_DAYS`]
//! - Serial numbers come from `certs/ca.srl`, incremented on every signature

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, DnValue, IsCa, Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::StatePaths;
use crate::lock::ResourceLocks;

/// Validity of signed certificates, in days
pub const VALIDITY_DAYS: i64 = 3650;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// CA certificate or key missing from disk
    #[error("CA not initialized: {0}")]
    CaNotInitialized(String),

    /// Invalid CSR
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CA material or serial could not be parsed
    #[error("parse error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Signs node CSRs with the cluster CA
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertificateSigner: Send + Sync {
    /// Sign a PEM-encoded CSR, returning the PEM certificate
    async fn sign(&self, csr_pem: &str) -> Result<String>;
}

/// Cluster CA loaded from PEM
pub struct CertificateAuthority {
    ca_key_pem: String,
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Generate a fresh self-signed CA
    pub fn generate(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        apply_validity(&mut params, chrono::Utc::now().date_naive());

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to generate CA key: {e}"))
        })?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {e}"))
        })?;

        Ok(Self {
            ca_key_pem: key_pair.serialize_pem(),
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load a CA from PEM-encoded certificate and key.
    ///
    /// The certificate must decode as an X.509 `CERTIFICATE` block usable as
    /// an issuer with the given key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {e}")))?;
        parse_pem(cert_pem, "CERTIFICATE")?;
        Issuer::from_ca_cert_pem(cert_pem, &key)
            .map_err(|e| PkiError::ParseError(format!("invalid CA certificate: {e}")))?;

        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// CA private key in PEM format
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Sign a CSR with the given big-endian serial, keeping the subject it
    /// requests
    pub fn sign_csr(&self, csr_pem: &str, serial: &[u8]) -> Result<String> {
        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {e}")))?;

        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.serial_number = Some(SerialNumber::from_slice(serial));
        apply_validity(&mut csr_params.params, chrono::Utc::now().date_naive());

        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {e}")))?;

        let signed = csr_params.signed_by(&issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {e}"))
        })?;

        Ok(signed.pem())
    }
}

/// Set a validity window starting at `today`
fn apply_validity(params: &mut CertificateParams, today: chrono::NaiveDate) {
    use chrono::Datelike;

    let end = today + chrono::Duration::days(VALIDITY_DAYS);
    params.not_before = rcgen::date_time_ymd(today.year(), today.month() as u8, today.day() as u8);
    params.not_after = rcgen::date_time_ymd(end.year(), end.month() as u8, end.day() as u8);
}

/// Parse PEM-encoded data with the expected block tag, returning the DER
/// bytes
pub fn parse_pem(pem_data: &str, tag: &str) -> Result<Vec<u8>> {
    let block = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {e}")))?;
    if block.tag() != tag {
        return Err(PkiError::ParseError(format!(
            "expected PEM block {tag}, found {}",
            block.tag()
        )));
    }
    Ok(block.contents().to_vec())
}

/// Length of a freshly drawn serial, matching OpenSSL's 159-bit serials
const RANDOM_SERIAL_BYTES: usize = 20;

/// Next serial after the hex-encoded `previous`, as written by OpenSSL.
///
/// Serials are arbitrary-length big-endian integers. Incrementing keeps the
/// width unless the value overflows it.
pub fn next_serial(previous: Option<&str>) -> Result<Vec<u8>> {
    let Some(hex) = previous.map(str::trim).filter(|s| !s.is_empty()) else {
        let mut serial: [u8; RANDOM_SERIAL_BYTES] = rand::random();
        serial[0] &= 0x7F;
        serial[RANDOM_SERIAL_BYTES - 1] |= 0x01;
        return Ok(serial.to_vec());
    };

    let padded = if hex.len() % 2 == 1 {
        format!("0{hex}")
    } else {
        hex.to_string()
    };
    let mut serial = padded
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 16).ok())
        })
        .collect::<Option<Vec<u8>>>()
        .ok_or_else(|| PkiError::ParseError(format!("invalid CA serial {hex:?}")))?;

    for byte in serial.iter_mut().rev() {
        let (sum, carry) = byte.overflowing_add(1);
        *byte = sum;
        if !carry {
            return Ok(serial);
        }
    }
    serial.insert(0, 1);
    Ok(serial)
}

/// Uppercase hex rendering of a serial, two digits per byte
pub fn encode_serial(serial: &[u8]) -> String {
    serial.iter().map(|b| format!("{b:02X}")).collect()
}

/// Signs with the CA stored in the node's certificate directory
#[derive(Clone, Debug)]
pub struct FileCaSigner {
    paths: StatePaths,
    locks: ResourceLocks,
}

impl FileCaSigner {
    /// Create a signer over `certs/ca.crt` and `certs/ca.key`
    pub fn new(paths: StatePaths, locks: ResourceLocks) -> Self {
        Self { paths, locks }
    }

    async fn load_ca(&self) -> Result<CertificateAuthority> {
        let cert = read_ca_file(&self.paths.ca_cert()).await?;
        let key = read_ca_file(&self.paths.ca_key()).await?;
        CertificateAuthority::from_pem(&cert, &key)
    }
}

async fn read_ca_file(path: &std::path::Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(PkiError::CaNotInitialized(path.display().to_string()))
        }
        Err(e) => Err(PkiError::Io(e)),
    }
}

#[async_trait]
impl CertificateSigner for FileCaSigner {
    async fn sign(&self, csr_pem: &str) -> Result<String> {
        let ca = self.load_ca().await?;

        let serial_path = self.paths.ca_serial();
        let _guard = self.locks.lock(&serial_path).await;

        let previous = match tokio::fs::read_to_string(&serial_path).await {
            Ok(s) => Some(s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(PkiError::Io(e)),
        };
        let serial = next_serial(previous.as_deref())?;

        let cert = ca.sign_csr(csr_pem, &serial)?;
        let encoded = encode_serial(&serial);
        tokio::fs::write(&serial_path, format!("{encoded}\n")).await?;

        info!(serial = %encoded, "Signed node certificate");
        debug!(bytes = cert.len(), "Certificate issued");
        Ok(cert)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! CSR fixtures shared by signing tests

    use rcgen::{CertificateParams, KeyPair};

    /// PEM CSR for `common_name`
    pub fn csr_for(common_name: &str) -> String {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![common_name.to_string()]).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, common_name);
        params.serialize_request(&key).unwrap().pem().unwrap()
    }
}
