//! Bootstrap coordinator
//!
//! [`load_or_create_security_config`] is the single entry point that turns
//! whatever is on disk (nothing, a root CA, or a full identity) plus an
//! optional join token into a validated [`SecurityConfig`]. Every node goes
//! through it exactly once per process start.
//!
//! ```text
//! start
//!   ├─ local root CA on disk ──────────────────────────────┐
//!   └─ absent: decode token into a digest pin,             │
//!      fetch the remote root (up to 5 attempts), persist ──┤
//!                                                          │
//!   (root known) ─ load node credentials ─ ok ─────────────┼─ done
//!                    └ failed: mint locally if the root    │
//!                      can sign, else request issuance ────┴─ done
//! ```

use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::ca::{self, RootCa};
use crate::credentials;
use crate::error::{Result, SecurityError};
use crate::identity;
use crate::paths::SecurityConfigPaths;
use crate::proto::IssueNodeCertificateResponse;
use crate::remote::{get_remote_ca, CaTransport, Remotes};
use crate::role::{parse_role, NodeRole, RoleAuthorizations, MANAGER_ROLE};
use crate::tls::{ClientTlsConfig, MutableTlsCredentials};
use crate::token;

/// How many times bootstrap retries the remote root CA fetch before giving
/// up. The first manager we pick may be mid-demotion; there is no backoff
/// between attempts.
const ROOT_CA_FETCH_ATTEMPTS: usize = 5;

/// Connector to an external certificate signer.
///
/// Shares the node's client TLS material but never pins a server name; the
/// external CA's endpoint is operator-supplied, not a cluster node.
pub struct ExternalCa {
    tls: Mutex<ClientTlsConfig>,
}

impl ExternalCa {
    /// Wrap a client configuration (server name already cleared)
    pub fn new(tls: ClientTlsConfig) -> Self {
        ExternalCa {
            tls: Mutex::new(tls),
        }
    }

    /// Install a new TLS configuration, in step with a client-credential swap
    pub fn update_tls_config(&self, new: ClientTlsConfig) {
        let mut guard = self.tls.lock().unwrap_or_else(|p| p.into_inner());
        *guard = new;
    }

    /// Snapshot of the current TLS configuration
    pub fn tls_config(&self) -> ClientTlsConfig {
        self.tls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

struct SecurityState {
    root_ca: Arc<RootCa>,
    external_ca: Arc<ExternalCa>,
}

/// A node's complete security configuration: the trusted root, the
/// external-CA connector, and the client/server TLS credentials used for
/// every mutually authenticated connection in the cluster.
///
/// The root-CA and external-CA slots are guarded by one mutex; the
/// credential handles carry their own synchronization and are shared with
/// listeners and dialers for the life of the process.
pub struct SecurityConfig {
    state: Mutex<SecurityState>,
    client_tls_creds: Arc<MutableTlsCredentials>,
    server_tls_creds: Arc<MutableTlsCredentials>,
}

impl SecurityConfig {
    /// Assemble the aggregate. The external-CA connector starts from the
    /// client credentials with the server name cleared.
    pub fn new(
        root_ca: Arc<RootCa>,
        client_tls_creds: MutableTlsCredentials,
        server_tls_creds: MutableTlsCredentials,
    ) -> Result<Self> {
        let external_tls = client_tls_creds
            .client_config()
            .ok_or_else(|| {
                SecurityError::tls_config("client credentials required to build a security config")
            })?
            .without_server_name();

        Ok(SecurityConfig {
            state: Mutex::new(SecurityState {
                root_ca,
                external_ca: Arc::new(ExternalCa::new(external_tls)),
            }),
            client_tls_creds: Arc::new(client_tls_creds),
            server_tls_creds: Arc::new(server_tls_creds),
        })
    }

    /// The current trusted root
    pub fn root_ca(&self) -> Arc<RootCa> {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .root_ca
            .clone()
    }

    /// Replace the trusted root with one built from the given material.
    /// The old root stays in place if the new material does not validate.
    pub fn update_root_ca(
        &self,
        cert_pem: &[u8],
        key_pem: Option<&[u8]>,
        cert_expiry: std::time::Duration,
        role_authorizations: RoleAuthorizations,
    ) -> Result<()> {
        let new_root = RootCa::new(cert_pem, key_pem, cert_expiry, role_authorizations)?;
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.root_ca = Arc::new(new_root);
        Ok(())
    }

    /// The external-CA connector
    pub fn external_ca(&self) -> Arc<ExternalCa> {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .external_ca
            .clone()
    }

    /// Credentials this node dials with
    pub fn client_tls_creds(&self) -> &Arc<MutableTlsCredentials> {
        &self.client_tls_creds
    }

    /// Credentials this node listens with
    pub fn server_tls_creds(&self) -> &Arc<MutableTlsCredentials> {
        &self.server_tls_creds
    }
}

/// Resolve the node's security configuration from disk, a join token, and
/// the remote CA.
///
/// See the module docs for the state machine. Edge cases: an empty token is
/// fine when the root is already on disk, and means trust-on-first-use when
/// it is not; a non-empty token whose digest does not match the fetched
/// root is fatal before anything is persisted; the remote fetch is tried
/// exactly five times and failure after the last attempt is fatal to
/// bootstrap. `role_authorizations` is attached to the locally loaded root
/// for downstream authorization; a freshly fetched root carries none.
#[allow(clippy::too_many_arguments)]
pub async fn load_or_create_security_config(
    cancel: &CancellationToken,
    base_dir: &Path,
    join_token: &str,
    proposed_role: NodeRole,
    remotes: &dyn Remotes,
    transport: &dyn CaTransport,
    role_authorizations: RoleAuthorizations,
    node_info: Option<&mpsc::Sender<IssueNodeCertificateResponse>>,
) -> Result<SecurityConfig> {
    if !base_dir.is_dir() {
        return Err(SecurityError::config(format!(
            "certificate directory {} does not exist",
            base_dir.display()
        )));
    }
    let paths = SecurityConfigPaths::new(base_dir);

    let root_ca = match ca::get_local_root_ca(&paths.root_ca, role_authorizations) {
        Ok(root) => {
            debug!("loaded CA certificate");
            root
        }
        Err(SecurityError::NoLocalRootCa) => {
            debug!("no local CA certificate found");

            let digest_pin = if join_token.is_empty() {
                // Trust on first use: no pin to check the fetch against.
                None
            } else {
                Some(token::ca_digest_from_token(join_token)?)
            };

            let mut fetched = Err(SecurityError::rpc("no fetch attempted"));
            for attempt in 1..=ROOT_CA_FETCH_ATTEMPTS {
                fetched = get_remote_ca(cancel, digest_pin, remotes, transport).await;
                match &fetched {
                    Ok(_) => break,
                    // Integrity failures and cancellation are not transient.
                    Err(SecurityError::DigestMismatch { .. }) | Err(SecurityError::Cancelled) => {
                        break
                    }
                    Err(e) => {
                        error!(attempt, error = %e, "failed to retrieve remote root CA certificate")
                    }
                }
            }
            let root = fetched?;

            ca::save_root_ca(&root, &paths.root_ca)?;
            debug!(path = %paths.root_ca.cert.display(), "retrieved remote CA certificate");
            root
        }
        Err(e) => return Err(e),
    };

    let key_pair = match credentials::load_tls_key_pair(&root_ca, &paths.node) {
        Ok(key_pair) => {
            if let Some(sink) = node_info {
                let _ = sink
                    .send(IssueNodeCertificateResponse {
                        node_id: key_pair.node_id().to_string(),
                        accepted: true,
                        certificate_chain: Vec::new(),
                    })
                    .await;
            }
            info!(
                node_id = %key_pair.node_id(),
                node_role = %key_pair.role(),
                "loaded node credentials"
            );
            key_pair
        }
        Err(e) => {
            debug!(error = %e, path = %paths.node.cert.display(), "no valid node credentials found");

            if root_ca.can_sign() {
                let node_id = identity::new_id();
                let org = identity::new_id();
                let role = parse_role(proposed_role);

                // Surface the generated identity promptly, before issuance.
                if let Some(sink) = node_info {
                    let _ = sink
                        .send(IssueNodeCertificateResponse {
                            node_id: node_id.clone(),
                            accepted: true,
                            certificate_chain: Vec::new(),
                        })
                        .await;
                }

                let key_pair = root_ca
                    .issue_and_save_new_certificates(&paths.node, &node_id, role, &org)
                    .map_err(|e| {
                        error!(
                            node_id = %node_id,
                            node_role = %role,
                            error = %e,
                            "failed to issue and save new certificate"
                        );
                        e
                    })?;
                info!(node_id = %node_id, node_role = %role, "issued new TLS certificate");
                key_pair
            } else {
                root_ca
                    .request_and_save_new_certificates(
                        cancel,
                        &paths.node,
                        join_token,
                        remotes,
                        transport,
                        None,
                        node_info,
                    )
                    .await
                    .map_err(|e| {
                        error!(error = %e, "failed to request and save new certificate");
                        e
                    })?
            }
        }
    };

    let server_tls_creds = root_ca.new_server_tls_credentials(&key_pair)?;
    // Every node dials managers, so the client side always expects the
    // manager role as the peer name.
    let client_tls_creds = root_ca.new_client_tls_credentials(&key_pair, MANAGER_ROLE)?;

    SecurityConfig::new(Arc::new(root_ca), client_tls_creds, server_tls_creds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::create_root_ca;
    use crate::proto::IssueNodeCertificateRequest;
    use crate::remote::{IssuanceTls, StaticRemotes};
    use crate::role::{CA_ROLE, WORKER_ROLE};
    use crate::token::generate_join_token;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tonic::transport::Uri;

    fn install_provider() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }

    /// In-memory stand-in for a manager's CA endpoints: serves its root and
    /// signs CSRs, optionally failing the first N fetches.
    struct TestCaServer {
        signer: RootCa,
        issue_role: &'static str,
        expected_token: String,
        fail_fetches: AtomicUsize,
        fetch_calls: AtomicUsize,
        issue_calls: AtomicUsize,
    }

    impl TestCaServer {
        fn new(signer: RootCa, issue_role: &'static str, expected_token: String) -> Self {
            TestCaServer {
                signer,
                issue_role,
                expected_token,
                fail_fetches: AtomicUsize::new(0),
                fetch_calls: AtomicUsize::new(0),
                issue_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CaTransport for TestCaServer {
        async fn fetch_root_ca(&self, _peer: &Uri) -> crate::error::Result<Vec<u8>> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_fetches.load(Ordering::SeqCst) > 0 {
                self.fail_fetches.fetch_sub(1, Ordering::SeqCst);
                return Err(SecurityError::rpc("manager unavailable"));
            }
            Ok(self.signer.cert_pem().to_vec())
        }

        async fn issue_node_certificate(
            &self,
            _peer: &Uri,
            request: IssueNodeCertificateRequest,
            _tls: IssuanceTls,
        ) -> crate::error::Result<IssueNodeCertificateResponse> {
            self.issue_calls.fetch_add(1, Ordering::SeqCst);
            if request.token != self.expected_token {
                return Err(SecurityError::rpc("join token rejected"));
            }
            let csr = String::from_utf8(request.csr)
                .map_err(|_| SecurityError::rpc("CSR is not UTF-8"))?;
            let node_id = identity::new_id();
            let chain = self
                .signer
                .sign_csr(&csr, &node_id, self.issue_role, &identity::new_id())
                .map_err(|e| SecurityError::rpc(e.to_string()))?;
            Ok(IssueNodeCertificateResponse {
                node_id,
                accepted: true,
                certificate_chain: chain.into_bytes(),
            })
        }
    }

    fn remotes() -> StaticRemotes {
        StaticRemotes::new(vec![Uri::from_static("https://manager-1:4242")])
    }

    /// Cold worker join: empty directory plus a join token. One pinned
    /// fetch, root persisted, CSR submitted, worker credentials on disk.
    #[tokio::test]
    async fn story_cold_worker_join() {
        install_provider();
        let dir = TempDir::new().unwrap();
        let signer = create_root_ca(CA_ROLE).unwrap();
        let join_token = generate_join_token(&signer);
        let server = TestCaServer::new(
            RootCa::new(
                signer.cert_pem(),
                signer.key_pem().map(str::as_bytes),
                crate::ca::DEFAULT_NODE_CERT_EXPIRATION,
                RoleAuthorizations::new(),
            )
            .unwrap(),
            WORKER_ROLE,
            join_token.clone(),
        );
        let (info_tx, mut info_rx) = mpsc::channel(4);

        let config = load_or_create_security_config(
            &CancellationToken::new(),
            dir.path(),
            &join_token,
            NodeRole::Worker,
            &remotes(),
            &server,
            RoleAuthorizations::new(),
            Some(&info_tx),
        )
        .await
        .unwrap();

        assert_eq!(server.fetch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(server.issue_calls.load(Ordering::SeqCst), 1);

        let paths = SecurityConfigPaths::new(dir.path());
        assert!(paths.root_ca.cert.exists());
        assert!(paths.node.cert.exists());
        assert!(paths.node.key.exists());
        // Workers never receive the signing key.
        assert!(!paths.root_ca.key.exists());

        assert_eq!(config.client_tls_creds().role(), WORKER_ROLE);
        assert_eq!(config.server_tls_creds().role(), WORKER_ROLE);
        assert!(!config.root_ca().can_sign());

        let notified = info_rx.try_recv().unwrap();
        assert!(notified.accepted);
        assert_eq!(notified.node_id, config.client_tls_creds().node_id());
    }

    /// Warm restart: root and node credentials already on disk. No network
    /// I/O at all; the stored identity is surfaced as accepted.
    #[tokio::test]
    async fn story_warm_restart_uses_disk_only() {
        install_provider();
        let dir = TempDir::new().unwrap();
        let paths = SecurityConfigPaths::new(dir.path());
        let signer = create_root_ca(CA_ROLE).unwrap();

        // A worker's disk state: verify-only root plus issued credentials.
        let verify_only = RootCa::new(
            signer.cert_pem(),
            None,
            crate::ca::DEFAULT_NODE_CERT_EXPIRATION,
            RoleAuthorizations::new(),
        )
        .unwrap();
        ca::save_root_ca(&verify_only, &paths.root_ca).unwrap();
        signer
            .issue_and_save_new_certificates(&paths.node, "node-warm", WORKER_ROLE, "org-1")
            .unwrap();

        let server = TestCaServer::new(signer, WORKER_ROLE, String::new());
        let (info_tx, mut info_rx) = mpsc::channel(4);

        let config = load_or_create_security_config(
            &CancellationToken::new(),
            dir.path(),
            "",
            NodeRole::Worker,
            &remotes(),
            &server,
            RoleAuthorizations::new(),
            Some(&info_tx),
        )
        .await
        .unwrap();

        assert_eq!(server.fetch_calls.load(Ordering::SeqCst), 0);
        assert_eq!(server.issue_calls.load(Ordering::SeqCst), 0);
        assert_eq!(config.client_tls_creds().node_id(), "node-warm");

        let notified = info_rx.try_recv().unwrap();
        assert!(notified.accepted);
        assert_eq!(notified.node_id, "node-warm");
    }

    /// A CA-capable node with no credentials mints its own identity with no
    /// remote traffic, announcing the generated node ID first.
    #[tokio::test]
    async fn story_local_ca_node_issues_its_own_identity() {
        install_provider();
        let dir = TempDir::new().unwrap();
        let paths = SecurityConfigPaths::new(dir.path());
        let signer = create_root_ca(CA_ROLE).unwrap();
        ca::save_root_ca(&signer, &paths.root_ca).unwrap();

        let server = TestCaServer::new(
            create_root_ca(CA_ROLE).unwrap(),
            WORKER_ROLE,
            String::new(),
        );
        let (info_tx, mut info_rx) = mpsc::channel(4);

        let config = load_or_create_security_config(
            &CancellationToken::new(),
            dir.path(),
            "",
            NodeRole::Manager,
            &remotes(),
            &server,
            RoleAuthorizations::new(),
            Some(&info_tx),
        )
        .await
        .unwrap();

        assert_eq!(server.fetch_calls.load(Ordering::SeqCst), 0);
        assert_eq!(server.issue_calls.load(Ordering::SeqCst), 0);
        assert!(config.root_ca().can_sign());
        assert_eq!(config.client_tls_creds().role(), MANAGER_ROLE);

        let notified = info_rx.try_recv().unwrap();
        assert!(notified.accepted);
        assert_eq!(notified.node_id, config.client_tls_creds().node_id());
    }

    /// A token pinning a different root is fatal before any persistence,
    /// with no retries.
    #[tokio::test]
    async fn bad_digest_pin_is_fatal_before_persistence() {
        install_provider();
        let dir = TempDir::new().unwrap();
        let signer = create_root_ca(CA_ROLE).unwrap();
        let other = create_root_ca(CA_ROLE).unwrap();
        let bad_token = generate_join_token(&other);
        let server = TestCaServer::new(signer, WORKER_ROLE, bad_token.clone());

        let result = load_or_create_security_config(
            &CancellationToken::new(),
            dir.path(),
            &bad_token,
            NodeRole::Worker,
            &remotes(),
            &server,
            RoleAuthorizations::new(),
            None,
        )
        .await;

        assert!(matches!(
            result,
            Err(SecurityError::DigestMismatch { .. })
        ));
        assert_eq!(server.fetch_calls.load(Ordering::SeqCst), 1);

        let paths = SecurityConfigPaths::new(dir.path());
        assert!(!paths.root_ca.cert.exists());
        assert!(!paths.node.cert.exists());
    }

    /// A malformed token is rejected before any network traffic.
    #[tokio::test]
    async fn malformed_token_fails_before_any_fetch() {
        install_provider();
        let dir = TempDir::new().unwrap();
        let signer = create_root_ca(CA_ROLE).unwrap();
        let server = TestCaServer::new(signer, WORKER_ROLE, String::new());

        let result = load_or_create_security_config(
            &CancellationToken::new(),
            dir.path(),
            "SWMTKN-not-a-token",
            NodeRole::Worker,
            &remotes(),
            &server,
            RoleAuthorizations::new(),
            None,
        )
        .await;

        assert!(matches!(result, Err(SecurityError::InvalidJoinToken)));
        assert_eq!(server.fetch_calls.load(Ordering::SeqCst), 0);
    }

    /// Empty token and empty disk means trust-on-first-use.
    #[tokio::test]
    async fn empty_token_trusts_on_first_use() {
        install_provider();
        let dir = TempDir::new().unwrap();
        let signer = create_root_ca(CA_ROLE).unwrap();
        let server = TestCaServer::new(signer, WORKER_ROLE, String::new());

        let config = load_or_create_security_config(
            &CancellationToken::new(),
            dir.path(),
            "",
            NodeRole::Worker,
            &remotes(),
            &server,
            RoleAuthorizations::new(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(config.client_tls_creds().role(), WORKER_ROLE);
    }

    /// Transient fetch failures are retried; the fifth consecutive failure
    /// is fatal.
    #[tokio::test]
    async fn fetch_retries_exactly_five_times() {
        install_provider();
        let dir = TempDir::new().unwrap();
        let signer = create_root_ca(CA_ROLE).unwrap();

        // Four failures then success: bootstrap survives.
        let server = TestCaServer::new(
            RootCa::new(
                signer.cert_pem(),
                signer.key_pem().map(str::as_bytes),
                crate::ca::DEFAULT_NODE_CERT_EXPIRATION,
                RoleAuthorizations::new(),
            )
            .unwrap(),
            WORKER_ROLE,
            String::new(),
        );
        server.fail_fetches.store(4, Ordering::SeqCst);

        load_or_create_security_config(
            &CancellationToken::new(),
            dir.path(),
            "",
            NodeRole::Worker,
            &remotes(),
            &server,
            RoleAuthorizations::new(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(server.fetch_calls.load(Ordering::SeqCst), 5);

        // Five failures: bootstrap is fatal.
        let dir2 = TempDir::new().unwrap();
        let server2 = TestCaServer::new(
            create_root_ca(CA_ROLE).unwrap(),
            WORKER_ROLE,
            String::new(),
        );
        server2.fail_fetches.store(5, Ordering::SeqCst);

        let result = load_or_create_security_config(
            &CancellationToken::new(),
            dir2.path(),
            "",
            NodeRole::Worker,
            &remotes(),
            &server2,
            RoleAuthorizations::new(),
            None,
        )
        .await;
        assert!(matches!(result, Err(SecurityError::Rpc(_))));
        assert_eq!(server2.fetch_calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn missing_base_directory_is_a_configuration_error() {
        install_provider();
        let signer = create_root_ca(CA_ROLE).unwrap();
        let server = TestCaServer::new(signer, WORKER_ROLE, String::new());

        let result = load_or_create_security_config(
            &CancellationToken::new(),
            Path::new("/nonexistent/certificates"),
            "",
            NodeRole::Worker,
            &remotes(),
            &server,
            RoleAuthorizations::new(),
            None,
        )
        .await;

        assert!(matches!(result, Err(SecurityError::Config(_))));
    }

    #[tokio::test]
    async fn update_root_ca_is_guarded() {
        install_provider();
        let dir = TempDir::new().unwrap();
        let signer = create_root_ca(CA_ROLE).unwrap();
        let server = TestCaServer::new(
            RootCa::new(
                signer.cert_pem(),
                signer.key_pem().map(str::as_bytes),
                crate::ca::DEFAULT_NODE_CERT_EXPIRATION,
                RoleAuthorizations::new(),
            )
            .unwrap(),
            WORKER_ROLE,
            String::new(),
        );

        let config = load_or_create_security_config(
            &CancellationToken::new(),
            dir.path(),
            "",
            NodeRole::Worker,
            &remotes(),
            &server,
            RoleAuthorizations::new(),
            None,
        )
        .await
        .unwrap();

        let old_digest = config.root_ca().digest();

        // Garbage does not replace the root.
        assert!(config
            .update_root_ca(
                b"not a certificate",
                None,
                crate::ca::DEFAULT_NODE_CERT_EXPIRATION,
                RoleAuthorizations::new(),
            )
            .is_err());
        assert_eq!(config.root_ca().digest(), old_digest);

        // A valid replacement does.
        let replacement = create_root_ca(CA_ROLE).unwrap();
        config
            .update_root_ca(
                replacement.cert_pem(),
                None,
                crate::ca::DEFAULT_NODE_CERT_EXPIRATION,
                RoleAuthorizations::new(),
            )
            .unwrap();
        assert_eq!(config.root_ca().digest(), replacement.digest());
    }
}
