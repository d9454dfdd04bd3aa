//! Root CA holder and certificate issuance
//!
//! The [`RootCa`] is the in-memory form of the cluster trust anchor: the PEM
//! root certificate bundle, a verifier pool derived from it, and (on
//! CA-capable nodes only) the signing key. A `RootCa` either can sign or can
//! only verify; which one is fixed at construction. Its content digest is
//! the identity that join tokens pin.
//!
//! # Security model
//!
//! - Nodes generate their own key pairs locally; only CSRs travel.
//! - The signer trusts nothing from a CSR except the key material. Subject,
//!   validity, and extensions all come from the signing policy and the
//!   issuance call parameters.
//! - A signed chain is verified against the local pool before any file on
//!   disk is overwritten.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, PublicKeyData, SanType,
};
use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use ::time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use crate::credentials::{self, NodeTlsKeyPair};
use crate::error::{Result, SecurityError};
use crate::paths::CertPaths;
use crate::proto::{IssueNodeCertificateRequest, IssueNodeCertificateResponse};
use crate::remote::{CaTransport, ClientIdentityPem, IssuanceTls, Remotes};
use crate::role::{RoleAuthorizations, CA_ROLE};
use crate::tls::{self, MutableTlsCredentials, TlsConfig};

/// Validity of node certificates when the caller does not specify one
pub const DEFAULT_NODE_CERT_EXPIRATION: Duration = Duration::from_secs(2160 * 60 * 60);
/// Smallest accepted node certificate validity; anything shorter falls back
/// to [`DEFAULT_NODE_CERT_EXPIRATION`]
pub const MIN_NODE_CERT_EXPIRATION: Duration = Duration::from_secs(15 * 60);
/// Fixed duration subtracted from NotBefore to tolerate clock skew between
/// issuer and verifier
pub const CERT_BACKDATE: Duration = Duration::from_secs(15 * 60);
/// Validity of a freshly minted cluster root certificate
pub const ROOT_CA_EXPIRATION: Duration = Duration::from_secs(20 * 365 * 24 * 60 * 60);

/// Lower bound of the renewal window, as a fraction of certificate validity
pub const CERT_LOWER_ROTATION_RANGE: f64 = 0.5;
/// Upper bound of the renewal window, as a fraction of certificate validity
pub const CERT_UPPER_ROTATION_RANGE: f64 = 0.8;

/// SHA-256 content digest of a root CA certificate bundle
///
/// Stable across restarts; the identity pinned inside join tokens.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Digest arbitrary bytes
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = aws_lc_rs::digest::digest(&aws_lc_rs::digest::SHA256, data);
        let mut out = [0u8; 32];
        out.copy_from_slice(hash.as_ref());
        Digest(out)
    }

    /// Wrap an already-computed 32-byte digest value
    pub fn from_raw(bytes: [u8; 32]) -> Self {
        Digest(bytes)
    }

    /// The raw 32-byte digest value
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:")?;
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self)
    }
}

/// Policy applied to every certificate the root CA signs
///
/// The only fields trusted from a remote CSR are the public key, the
/// public-key algorithm, and the signature algorithm; [`RootCa::sign_csr`]
/// enforces that by overriding everything else from call parameters.
#[derive(Clone, Copy, Debug)]
pub struct SigningPolicy {
    expiry: Duration,
    backdate: Duration,
}

impl SigningPolicy {
    /// Build a policy for the requested validity, clamping short values.
    pub fn new(expiry: Duration) -> Self {
        let expiry = if expiry < MIN_NODE_CERT_EXPIRATION {
            DEFAULT_NODE_CERT_EXPIRATION
        } else {
            expiry
        };
        SigningPolicy {
            expiry,
            backdate: CERT_BACKDATE,
        }
    }

    /// Effective certificate validity
    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Duration subtracted from NotBefore
    pub fn backdate(&self) -> Duration {
        self.backdate
    }
}

/// Verifier pool derived from the root certificate bundle
pub struct CertPool {
    ders: Vec<CertificateDer<'static>>,
    store: Arc<RootCertStore>,
}

impl CertPool {
    fn from_ders(ders: Vec<CertificateDer<'static>>) -> Result<Self> {
        let mut store = RootCertStore::empty();
        for der in &ders {
            store
                .add(der.clone())
                .map_err(|e| SecurityError::invalid_certificate(format!("unusable root: {}", e)))?;
        }
        Ok(CertPool {
            ders,
            store: Arc::new(store),
        })
    }

    /// The rustls trust store built from this pool
    pub fn root_store(&self) -> Arc<RootCertStore> {
        self.store.clone()
    }

    /// Verify a PEM chain (leaf first, intermediates after) against this
    /// pool: every certificate must be inside its validity window and each
    /// link's signature must check out, terminating at one of the roots.
    pub fn verify_chain(&self, chain_pem: &[u8]) -> Result<()> {
        let ders = pem_certificates(chain_pem)?;
        if ders.is_empty() {
            return Err(SecurityError::chain("chain contains no certificates"));
        }

        let now = unix_now();
        for (i, der) in ders.iter().enumerate() {
            let (_, cert) = X509Certificate::from_der(der)
                .map_err(|e| SecurityError::invalid_certificate(e.to_string()))?;

            if now < cert.validity().not_before.timestamp() {
                return Err(SecurityError::chain("certificate is not yet valid"));
            }
            if now > cert.validity().not_after.timestamp() {
                return Err(SecurityError::chain("certificate has expired"));
            }

            let verified = match ders.get(i + 1) {
                Some(issuer_der) => X509Certificate::from_der(issuer_der)
                    .map(|(_, issuer)| cert.verify_signature(Some(issuer.public_key())).is_ok())
                    .unwrap_or(false),
                None => self.ders.iter().any(|root_der| {
                    X509Certificate::from_der(root_der.as_ref())
                        .map(|(_, root)| cert.verify_signature(Some(root.public_key())).is_ok())
                        .unwrap_or(false)
                }),
            };
            if !verified {
                return Err(SecurityError::chain(
                    "signature does not verify under the trusted roots",
                ));
            }
        }
        Ok(())
    }
}

/// The cluster trust anchor, immutable once constructed
pub struct RootCa {
    /// Canonical PEM bytes of the root certificate bundle
    cert_pem: Vec<u8>,
    /// PEM of the first (signing) certificate alone
    signing_cert_pem: String,
    /// Signing key PEM; present only on CA-capable nodes
    signer: Option<Zeroizing<String>>,
    digest: Digest,
    policy: SigningPolicy,
    pool: CertPool,
    role_authorizations: RoleAuthorizations,
}

impl RootCa {
    /// Construct from PEM material.
    ///
    /// Validates that the certificate bundle parses and, when a key is
    /// given, that it matches the primary certificate's public key. The
    /// authorization map rides along for downstream authorization layers.
    pub fn new(
        cert_pem: &[u8],
        key_pem: Option<&[u8]>,
        cert_expiry: Duration,
        role_authorizations: RoleAuthorizations,
    ) -> Result<Self> {
        let blocks = ::pem::parse_many(cert_pem)
            .map_err(|e| SecurityError::invalid_certificate(format!("bad root CA PEM: {}", e)))?;
        let cert_blocks: Vec<&::pem::Pem> =
            blocks.iter().filter(|p| p.tag() == "CERTIFICATE").collect();
        if cert_blocks.is_empty() {
            return Err(SecurityError::invalid_certificate(
                "root CA PEM contains no certificates",
            ));
        }

        let ders: Vec<CertificateDer<'static>> = cert_blocks
            .iter()
            .map(|p| CertificateDer::from(p.contents().to_vec()))
            .collect();

        let signing_cert_pem = ::pem::encode(cert_blocks[0]);

        let signer = match key_pem {
            Some(raw) => {
                let key_str = std::str::from_utf8(raw)
                    .map_err(|_| SecurityError::invalid_key("root CA key is not valid UTF-8"))?;
                let key = KeyPair::from_pem(key_str)
                    .map_err(|e| SecurityError::invalid_key(format!("bad root CA key: {}", e)))?;

                let (_, cert) = X509Certificate::from_der(ders[0].as_ref())
                    .map_err(|e| SecurityError::invalid_certificate(e.to_string()))?;
                if key.subject_public_key_info() != cert.public_key().raw {
                    return Err(SecurityError::invalid_key(
                        "root CA key does not match the root certificate",
                    ));
                }
                Some(Zeroizing::new(key_str.to_string()))
            }
            None => None,
        };

        Ok(RootCa {
            cert_pem: cert_pem.to_vec(),
            signing_cert_pem,
            signer,
            digest: Digest::from_bytes(cert_pem),
            policy: SigningPolicy::new(cert_expiry),
            pool: CertPool::from_ders(ders)?,
            role_authorizations,
        })
    }

    /// Whether this root can sign certificates (key material present)
    pub fn can_sign(&self) -> bool {
        self.signer.is_some()
    }

    /// Content digest of the certificate bundle
    pub fn digest(&self) -> Digest {
        self.digest
    }

    /// The verifier pool derived from the bundle
    pub fn pool(&self) -> &CertPool {
        &self.pool
    }

    /// Canonical PEM bytes of the bundle
    pub fn cert_pem(&self) -> &[u8] {
        &self.cert_pem
    }

    /// Signing key PEM, when present
    pub(crate) fn key_pem(&self) -> Option<&str> {
        self.signer.as_deref().map(|s| s.as_str())
    }

    /// The signing policy applied to issued certificates
    pub fn signing_policy(&self) -> SigningPolicy {
        self.policy
    }

    /// Roles authorized per named permission, for downstream authorization
    pub fn role_authorizations(&self) -> &RoleAuthorizations {
        &self.role_authorizations
    }

    /// Verify a PEM chain against this root's pool
    pub fn verify_chain(&self, chain_pem: &[u8]) -> Result<()> {
        self.pool.verify_chain(chain_pem)
    }

    /// Sign a CSR under the signing policy.
    ///
    /// Only the key material is taken from the CSR. Subject (CN = node ID,
    /// OU = role, O = organization), SAN, key usages, and the validity
    /// window are all set here.
    pub fn sign_csr(&self, csr_pem: &str, cn: &str, ou: &str, org: &str) -> Result<String> {
        let key_pem = self
            .signer
            .as_ref()
            .ok_or_else(|| SecurityError::signing("root CA has no signing key"))?;
        let ca_key = KeyPair::from_pem(key_pem)
            .map_err(|e| SecurityError::invalid_key(format!("bad root CA key: {}", e)))?;

        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| SecurityError::invalid_certificate(format!("bad CSR: {}", e)))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(cn.to_string()));
        dn.push(
            DnType::OrganizationalUnitName,
            DnValue::Utf8String(ou.to_string()),
        );
        dn.push(DnType::OrganizationName, DnValue::Utf8String(org.to_string()));
        csr_params.params.distinguished_name = dn;

        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr_params.params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        // Dialers verify the peer by role name, so the role doubles as the
        // DNS SAN.
        csr_params.params.subject_alt_names = vec![SanType::DnsName(
            Ia5String::try_from(ou.to_string())
                .map_err(|e| SecurityError::signing(format!("role is not a valid SAN: {}", e)))?,
        )];

        let not_before = OffsetDateTime::now_utc() - to_time_duration(self.policy.backdate());
        csr_params.params.not_before = not_before;
        csr_params.params.not_after = not_before + to_time_duration(self.policy.expiry());

        let issuer = Issuer::from_ca_cert_pem(&self.signing_cert_pem, &ca_key)
            .map_err(|e| SecurityError::signing(format!("failed to build issuer: {}", e)))?;
        let signed = csr_params
            .signed_by(&issuer)
            .map_err(|e| SecurityError::signing(e.to_string()))?;

        Ok(signed.pem())
    }

    /// Generate a key pair, sign it locally, and persist both atomically.
    ///
    /// Available only when [`can_sign`](Self::can_sign) is true. Returns the
    /// resulting TLS key pair, already verified under this root.
    pub fn issue_and_save_new_certificates(
        &self,
        paths: &CertPaths,
        cn: &str,
        role: &str,
        org: &str,
    ) -> Result<NodeTlsKeyPair> {
        let key = KeyPair::generate()
            .map_err(|e| SecurityError::invalid_key(format!("key generation failed: {}", e)))?;
        let csr_pem = new_csr_pem(&key)?;

        let cert_pem = self.sign_csr(&csr_pem, cn, role, org)?;
        self.verify_chain(cert_pem.as_bytes())?;

        let key_pem = Zeroizing::new(key.serialize_pem());
        credentials::save_key_pair(paths, cert_pem.as_bytes(), &key_pem)?;

        debug!(node_id = %cn, node_role = %role, "issued new TLS certificate locally");
        NodeTlsKeyPair::from_pem(cert_pem.as_bytes(), key_pem)
    }

    /// Generate a key pair and CSR, have the remote CA sign it, and persist
    /// both atomically.
    ///
    /// Used when local signing is unavailable and for every renewal. During
    /// bootstrap `token` authenticates the request; during renewal the token
    /// is empty and `existing_creds` supplies client authentication instead.
    /// Nothing on disk is overwritten unless the returned chain verifies
    /// against this root's pool.
    #[allow(clippy::too_many_arguments)]
    pub async fn request_and_save_new_certificates(
        &self,
        cancel: &CancellationToken,
        paths: &CertPaths,
        token: &str,
        remotes: &dyn Remotes,
        transport: &dyn CaTransport,
        existing_creds: Option<&MutableTlsCredentials>,
        node_info: Option<&mpsc::Sender<IssueNodeCertificateResponse>>,
    ) -> Result<NodeTlsKeyPair> {
        let key = KeyPair::generate()
            .map_err(|e| SecurityError::invalid_key(format!("key generation failed: {}", e)))?;
        let csr_pem = new_csr_pem(&key)?;

        let peer = remotes.select()?;
        let request = IssueNodeCertificateRequest {
            csr: csr_pem.into_bytes(),
            token: token.to_string(),
        };
        let issuance_tls = IssuanceTls {
            root_ca_pem: self.cert_pem.clone(),
            identity: existing_creds.map(|creds| {
                let (cert_pem, key_pem) = creds.identity_pems();
                ClientIdentityPem { cert_pem, key_pem }
            }),
        };

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(SecurityError::Cancelled),
            res = transport.issue_node_certificate(&peer, request, issuance_tls) => res,
        };
        let response = match response {
            Ok(r) => {
                remotes.observe(&peer, true);
                r
            }
            Err(e) => {
                remotes.observe(&peer, false);
                return Err(e);
            }
        };

        if let Some(sink) = node_info {
            let _ = sink.send(response.clone()).await;
        }

        self.verify_chain(&response.certificate_chain)?;

        let key_pem = Zeroizing::new(key.serialize_pem());
        credentials::save_key_pair(paths, &response.certificate_chain, &key_pem)?;

        debug!(node_id = %response.node_id, "received and saved remotely signed certificate");
        NodeTlsKeyPair::from_pem(&response.certificate_chain, key_pem)
    }

    /// Wrap a key pair as mutable client credentials dialing `server_name`
    pub fn new_client_tls_credentials(
        &self,
        key_pair: &NodeTlsKeyPair,
        server_name: &str,
    ) -> Result<MutableTlsCredentials> {
        let config = tls::new_client_tls_config(key_pair, &self.pool, Some(server_name))?;
        MutableTlsCredentials::new(TlsConfig::Client(config))
    }

    /// Wrap a key pair as mutable server credentials
    pub fn new_server_tls_credentials(
        &self,
        key_pair: &NodeTlsKeyPair,
    ) -> Result<MutableTlsCredentials> {
        let config = tls::new_server_tls_config(key_pair, &self.pool)?;
        MutableTlsCredentials::new(TlsConfig::Server(config))
    }
}

/// Mint a brand-new self-signed cluster root, used when initializing the
/// first node of a new cluster. The result can sign; it starts with an
/// empty authorization map, which callers attach when the root is loaded
/// back from disk with their configuration.
pub fn create_root_ca(common_name: &str) -> Result<RootCa> {
    let key = KeyPair::generate()
        .map_err(|e| SecurityError::invalid_key(format!("key generation failed: {}", e)))?;

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

    let not_before = OffsetDateTime::now_utc() - to_time_duration(CERT_BACKDATE);
    params.not_before = not_before;
    params.not_after = not_before + to_time_duration(ROOT_CA_EXPIRATION);

    let cert = params
        .self_signed(&key)
        .map_err(|e| SecurityError::signing(format!("failed to self-sign root: {}", e)))?;

    RootCa::new(
        cert.pem().as_bytes(),
        Some(key.serialize_pem().as_bytes()),
        DEFAULT_NODE_CERT_EXPIRATION,
        RoleAuthorizations::default(),
    )
}

/// Default common name of a freshly created cluster root
pub fn root_common_name() -> &'static str {
    CA_ROLE
}

/// Load the root CA from disk.
///
/// Returns [`SecurityError::NoLocalRootCa`] when the certificate file does
/// not exist, which callers treat as "fetch from a peer". A present but
/// unusable certificate is a hard error, not a miss. The key file is
/// optional; only CA-capable nodes carry one.
pub fn get_local_root_ca(
    paths: &CertPaths,
    role_authorizations: RoleAuthorizations,
) -> Result<RootCa> {
    let cert = match std::fs::read(&paths.cert) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SecurityError::NoLocalRootCa)
        }
        Err(e) => return Err(e.into()),
    };
    let key = match std::fs::read(&paths.key) {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    RootCa::new(
        &cert,
        key.as_deref(),
        DEFAULT_NODE_CERT_EXPIRATION,
        role_authorizations,
    )
}

/// Persist the root CA to disk: the certificate world-readable, the key (on
/// signer nodes) owner-only. Both go through the sibling-and-rename
/// protocol.
pub fn save_root_ca(root: &RootCa, paths: &CertPaths) -> Result<()> {
    credentials::atomic_write(&paths.cert, root.cert_pem(), 0o644)?;
    if let Some(key_pem) = root.key_pem() {
        credentials::atomic_write(&paths.key, key_pem.as_bytes(), 0o600)?;
    }
    Ok(())
}

fn new_csr_pem(key: &KeyPair) -> Result<String> {
    // The signer discards everything but the key material, so the request
    // carries an empty subject.
    let params = CertificateParams::default();
    let csr = params
        .serialize_request(key)
        .map_err(|e| SecurityError::signing(format!("failed to build CSR: {}", e)))?;
    csr.pem()
        .map_err(|e| SecurityError::signing(format!("failed to serialize CSR: {}", e)))
}

fn pem_certificates(chain_pem: &[u8]) -> Result<Vec<Vec<u8>>> {
    let blocks = ::pem::parse_many(chain_pem)
        .map_err(|e| SecurityError::invalid_certificate(format!("bad PEM: {}", e)))?;
    Ok(blocks
        .iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .map(|p| p.contents().to_vec())
        .collect())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn to_time_duration(d: Duration) -> ::time::Duration {
    ::time::Duration::seconds(d.as_secs() as i64)
}
