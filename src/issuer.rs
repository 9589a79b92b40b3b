//! Credential disclosure and the signing gate
//!
//! What a joining node receives depends on its role. Control-plane joiners get
//! the cluster's trust material; workers get single-use certificate-request
//! tokens instead and obtain their certificates through [`CredentialIssuer::sign`].

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::StatePaths;
use crate::error::io_state;
use crate::membership::MembershipList;
use crate::pki::CertificateSigner;
use crate::token::known::ADMIN_IDENTITY;
use crate::token::{KnownTokens, TokenCategory, TokenStore};
use crate::{Error, Result};

/// Trust material disclosed to a control-plane joiner
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlPlaneBundle {
    /// CA private key
    pub ca_key: String,
    /// Service account token signing key
    pub service_account_key: String,
    /// Static admin bearer token
    pub admin_token: String,
    /// Consensus store client certificate
    pub cluster_cert: String,
    /// Consensus store client key
    pub cluster_key: String,
    /// Addresses of the voting consensus members
    pub voters: Vec<String>,
}

/// Issues credentials to joining nodes
#[derive(Clone)]
pub struct CredentialIssuer {
    paths: StatePaths,
    tokens: TokenStore,
    known: KnownTokens,
    signer: Arc<dyn CertificateSigner>,
}

async fn read_credential(path: &Path, what: &str) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| io_state(format!("read {what}"), e))
}

impl CredentialIssuer {
    /// Create an issuer
    pub fn new(
        paths: StatePaths,
        tokens: TokenStore,
        known: KnownTokens,
        signer: Arc<dyn CertificateSigner>,
    ) -> Self {
        Self {
            paths,
            tokens,
            known,
            signer,
        }
    }

    /// Cluster CA certificate, disclosed to every joiner
    pub async fn ca_certificate(&self) -> Result<String> {
        read_credential(&self.paths.ca_cert(), "cluster CA").await
    }

    /// Mint a certificate-request token
    pub async fn mint_certificate_request(&self, token: &str) -> Result<()> {
        self.tokens
            .append(token, TokenCategory::CertificateRequest)
            .await
            .map_err(|e| e.within("add certificate request token"))
    }

    /// Mint the kubelet and proxy certificate-request tokens of a worker
    pub async fn worker_bundle(&self, admission_token: &str) -> Result<()> {
        for identity in ["kubelet", "proxy"] {
            self.mint_certificate_request(&format!("{admission_token}-{identity}"))
                .await?;
        }
        Ok(())
    }

    /// Assemble the trust material of a control-plane joiner
    pub async fn control_plane_bundle(
        &self,
        membership: &MembershipList,
    ) -> Result<ControlPlaneBundle> {
        let bundle = ControlPlaneBundle {
            ca_key: read_credential(&self.paths.ca_key(), "CA key").await?,
            service_account_key: read_credential(
                &self.paths.service_account_key(),
                "service account key",
            )
            .await?,
            admin_token: self.known.get(ADMIN_IDENTITY).await?,
            cluster_cert: read_credential(&self.paths.datastore_cert(), "consensus store certificate")
                .await?,
            cluster_key: read_credential(&self.paths.datastore_key(), "consensus store key").await?,
            voters: membership.voters(),
        };
        Ok(bundle)
    }

    /// Sign a CSR, spending a certificate-request token first.
    ///
    /// The token is consumed before signing is attempted and stays consumed
    /// whatever the signer returns.
    pub async fn sign(&self, token: &str, csr_pem: &str) -> Result<String> {
        self.tokens
            .consume_valid(token, TokenCategory::CertificateRequest)
            .await?;

        let cert = self
            .signer
            .sign(csr_pem)
            .await
            .map_err(|e| Error::signing("sign certificate", e))?;

        info!("Issued certificate for node");
        Ok(cert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::ResourceLocks;
    use crate::pki::{MockCertificateSigner, PkiError};

    struct Fixture {
        dir: tempfile::TempDir,
        paths: StatePaths,
        tokens: TokenStore,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path(), dir.path());
        for sub in ["credentials", "certs", "var/kubernetes/backend"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        std::fs::write(paths.ca_cert(), "CA CERT").unwrap();
        std::fs::write(paths.ca_key(), "CA KEY").unwrap();
        std::fs::write(paths.service_account_key(), "SA KEY").unwrap();
        std::fs::write(paths.datastore_cert(), "DQLITE CERT").unwrap();
        std::fs::write(paths.datastore_key(), "DQLITE KEY").unwrap();
        std::fs::write(paths.known_tokens(), "admin-token,admin,admin,\"system:masters\"\n")
            .unwrap();

        let tokens = TokenStore::new(paths.clone(), ResourceLocks::new());
        Fixture { dir, paths, tokens }
    }

    fn issuer(f: &Fixture, signer: MockCertificateSigner) -> CredentialIssuer {
        CredentialIssuer::new(
            f.paths.clone(),
            f.tokens.clone(),
            KnownTokens::new(f.paths.clone(), ResourceLocks::new()),
            Arc::new(signer),
        )
    }

    #[tokio::test]
    async fn control_plane_bundle_discloses_trust_material() {
        let f = fixture();
        let membership = MembershipList::parse(
            "- Address: 10.0.0.1:19001\n  Role: 0\n- Address: 10.0.0.2:19001\n  Role: 2\n",
        )
        .unwrap();

        let bundle = issuer(&f, MockCertificateSigner::new())
            .control_plane_bundle(&membership)
            .await
            .unwrap();

        assert_eq!(bundle.ca_key, "CA KEY");
        assert_eq!(bundle.service_account_key, "SA KEY");
        assert_eq!(bundle.admin_token, "admin-token");
        assert_eq!(bundle.cluster_cert, "DQLITE CERT");
        assert_eq!(bundle.cluster_key, "DQLITE KEY");
        assert_eq!(bundle.voters, vec!["10.0.0.1:19001"]);
    }

    #[tokio::test]
    async fn control_plane_bundle_names_missing_file() {
        let f = fixture();
        std::fs::remove_file(f.paths.service_account_key()).unwrap();

        let err = issuer(&f, MockCertificateSigner::new())
            .control_plane_bundle(&MembershipList::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::State { .. }));
        assert!(err.to_string().contains("service account key"));
    }

    #[tokio::test]
    async fn worker_bundle_mints_two_request_tokens() {
        let f = fixture();
        issuer(&f, MockCertificateSigner::new())
            .worker_bundle("abc")
            .await
            .unwrap();

        let minted =
            std::fs::read_to_string(f.dir.path().join("credentials/certs-request-tokens.txt"))
                .unwrap();
        assert_eq!(minted, "abc-kubelet\nabc-proxy\n");
    }

    #[tokio::test]
    async fn sign_spends_token_then_signs() {
        let f = fixture();
        let mut signer = MockCertificateSigner::new();
        signer
            .expect_sign()
            .withf(|csr| csr.to_string() == "CSR")
            .times(1)
            .returning(|_| Ok("CERT".to_string()));
        let issuer = issuer(&f, signer);
        issuer.mint_certificate_request("req").await.unwrap();

        assert_eq!(issuer.sign("req", "CSR").await.unwrap(), "CERT");
        assert!(!f.tokens.is_valid("req", TokenCategory::CertificateRequest).await);
    }

    #[tokio::test]
    async fn sign_without_token_never_reaches_signer() {
        let f = fixture();
        let mut signer = MockCertificateSigner::new();
        signer.expect_sign().times(0);

        let err = issuer(&f, signer).sign("nope", "CSR").await.unwrap_err();
        assert!(matches!(err, Error::Auth { .. }));
    }

    #[tokio::test]
    async fn failed_signing_still_spends_token() {
        let f = fixture();
        let mut signer = MockCertificateSigner::new();
        signer
            .expect_sign()
            .returning(|_| Err(PkiError::InvalidCsr("garbage".into())));
        let issuer = issuer(&f, signer);
        issuer.mint_certificate_request("req").await.unwrap();

        let err = issuer.sign("req", "junk").await.unwrap_err();
        assert!(matches!(err, Error::Signing { .. }));
        assert!(!f.tokens.is_valid("req", TokenCategory::CertificateRequest).await);
    }
}
