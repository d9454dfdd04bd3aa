//! Mutable TLS credentials
//!
//! Listeners and dialers hold a [`MutableTlsCredentials`] for the life of
//! the process; the renewal loop swaps the underlying configuration in
//! place. Handshake code takes a snapshot per handshake (via
//! [`MutableTlsCredentials::acceptor`] / [`connector`](MutableTlsCredentials::connector)),
//! so an in-flight handshake always sees either fully the old or fully the
//! new configuration, never a mix.

use std::sync::{Arc, RwLock};

use rustls::pki_types::ServerName;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig as RustlsClientConfig, ServerConfig as RustlsServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use zeroize::Zeroizing;

use crate::ca::CertPool;
use crate::credentials::NodeTlsKeyPair;
use crate::error::{Result, SecurityError};

/// TLS versions this subsystem will speak; nothing below 1.2
static TLS_PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Client-side TLS configuration plus the identity it was built from
#[derive(Clone)]
pub struct ClientTlsConfig {
    config: Arc<RustlsClientConfig>,
    server_name: Option<ServerName<'static>>,
    node_id: String,
    role: String,
    cert_pem: Vec<u8>,
    key_pem: Zeroizing<String>,
}

impl ClientTlsConfig {
    /// The rustls configuration
    pub fn config(&self) -> Arc<RustlsClientConfig> {
        self.config.clone()
    }

    /// Expected peer name, if this configuration pins one
    pub fn server_name(&self) -> Option<&ServerName<'static>> {
        self.server_name.as_ref()
    }

    /// Copy of this configuration with the server name cleared, as used by
    /// the external-CA connector
    pub fn without_server_name(&self) -> ClientTlsConfig {
        ClientTlsConfig {
            server_name: None,
            ..self.clone()
        }
    }
}

/// Server-side TLS configuration plus the identity it was built from
#[derive(Clone)]
pub struct ServerTlsConfig {
    config: Arc<RustlsServerConfig>,
    node_id: String,
    role: String,
    cert_pem: Vec<u8>,
    key_pem: Zeroizing<String>,
}

impl ServerTlsConfig {
    /// The rustls configuration
    pub fn config(&self) -> Arc<RustlsServerConfig> {
        self.config.clone()
    }
}

/// Either side of a TLS configuration, as held by [`MutableTlsCredentials`]
pub enum TlsConfig {
    /// A dialer configuration
    Client(ClientTlsConfig),
    /// A listener configuration
    Server(ServerTlsConfig),
}

impl TlsConfig {
    fn node_id(&self) -> &str {
        match self {
            TlsConfig::Client(c) => &c.node_id,
            TlsConfig::Server(s) => &s.node_id,
        }
    }

    fn role(&self) -> &str {
        match self {
            TlsConfig::Client(c) => &c.role,
            TlsConfig::Server(s) => &s.role,
        }
    }

    fn cert_pem(&self) -> &[u8] {
        match self {
            TlsConfig::Client(c) => &c.cert_pem,
            TlsConfig::Server(s) => &s.cert_pem,
        }
    }
}

impl From<ClientTlsConfig> for TlsConfig {
    fn from(config: ClientTlsConfig) -> Self {
        TlsConfig::Client(config)
    }
}

impl From<ServerTlsConfig> for TlsConfig {
    fn from(config: ServerTlsConfig) -> Self {
        TlsConfig::Server(config)
    }
}

/// Build a client configuration for a node identity: the pool as trust
/// anchors, the node certificate for client auth, minimum TLS 1.2.
pub fn new_client_tls_config(
    key_pair: &NodeTlsKeyPair,
    pool: &CertPool,
    server_name: Option<&str>,
) -> Result<ClientTlsConfig> {
    let store = pool.root_store();
    if store.is_empty() {
        return Err(SecurityError::tls_config("valid root CA pool required"));
    }

    let config = RustlsClientConfig::builder_with_protocol_versions(TLS_PROTOCOL_VERSIONS)
        .with_root_certificates(store)
        .with_client_auth_cert(key_pair.certs(), key_pair.key())
        .map_err(|e| SecurityError::tls_config(format!("client config: {}", e)))?;

    let server_name = match server_name {
        Some(name) => Some(
            ServerName::try_from(name.to_string())
                .map_err(|e| SecurityError::tls_config(format!("bad server name: {}", e)))?,
        ),
        None => None,
    };

    let (cert_pem, key_pem) = key_pair.identity_pems();
    Ok(ClientTlsConfig {
        config: Arc::new(config),
        server_name,
        node_id: key_pair.node_id().to_string(),
        role: key_pair.role().to_string(),
        cert_pem,
        key_pem,
    })
}

/// Build a server configuration for a node identity.
///
/// Client certificates are verified when given but not required: the same
/// listener serves unauthenticated bootstrap traffic (nodes that do not
/// have a certificate yet) and authenticated node traffic.
pub fn new_server_tls_config(
    key_pair: &NodeTlsKeyPair,
    pool: &CertPool,
) -> Result<ServerTlsConfig> {
    let store = pool.root_store();
    if store.is_empty() {
        return Err(SecurityError::tls_config("valid root CA pool required"));
    }

    let verifier = WebPkiClientVerifier::builder(store)
        .allow_unauthenticated()
        .build()
        .map_err(|e| SecurityError::tls_config(format!("client verifier: {}", e)))?;

    let config = RustlsServerConfig::builder_with_protocol_versions(TLS_PROTOCOL_VERSIONS)
        .with_client_cert_verifier(verifier)
        .with_single_cert(key_pair.certs(), key_pair.key())
        .map_err(|e| SecurityError::tls_config(format!("server config: {}", e)))?;

    let (cert_pem, key_pem) = key_pair.identity_pems();
    Ok(ServerTlsConfig {
        config: Arc::new(config),
        node_id: key_pair.node_id().to_string(),
        role: key_pair.role().to_string(),
        cert_pem,
        key_pem,
    })
}

/// An ownership-stable handle over an atomically replaceable TLS
/// configuration
///
/// The lock is held only to copy the current snapshot or to install a new
/// one, never across a handshake or any other blocking operation.
pub struct MutableTlsCredentials {
    state: RwLock<TlsConfig>,
}

impl MutableTlsCredentials {
    /// Wrap an initial configuration
    pub fn new(config: TlsConfig) -> Result<Self> {
        validate(&config)?;
        Ok(MutableTlsCredentials {
            state: RwLock::new(config),
        })
    }

    /// Node ID from the current leaf certificate
    pub fn node_id(&self) -> String {
        self.read().node_id().to_string()
    }

    /// Role string from the current leaf certificate
    pub fn role(&self) -> String {
        self.read().role().to_string()
    }

    /// PEM copies of the current identity, for transport-level client auth
    pub fn identity_pems(&self) -> (Vec<u8>, Zeroizing<String>) {
        match &*self.read() {
            TlsConfig::Client(c) => (c.cert_pem.clone(), c.key_pem.clone()),
            TlsConfig::Server(s) => (s.cert_pem.clone(), s.key_pem.clone()),
        }
    }

    /// Validate and install a new configuration in one step.
    ///
    /// The new configuration must be of the same kind (client or server) as
    /// the one it replaces; handshake code relying on this handle keeps
    /// working across the swap.
    pub fn load_new_tls_config(&self, new: TlsConfig) -> Result<()> {
        validate(&new)?;
        let mut state = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match (&*state, &new) {
            (TlsConfig::Client(_), TlsConfig::Client(_))
            | (TlsConfig::Server(_), TlsConfig::Server(_)) => {
                *state = new;
                Ok(())
            }
            _ => Err(SecurityError::tls_config(
                "replacement TLS config is of the wrong kind",
            )),
        }
    }

    /// Snapshot of the current client configuration, if this is a client
    /// credential
    pub fn client_config(&self) -> Option<ClientTlsConfig> {
        match &*self.read() {
            TlsConfig::Client(c) => Some(c.clone()),
            TlsConfig::Server(_) => None,
        }
    }

    /// Snapshot of the current server configuration, if this is a server
    /// credential
    pub fn server_config(&self) -> Option<ServerTlsConfig> {
        match &*self.read() {
            TlsConfig::Server(s) => Some(s.clone()),
            TlsConfig::Client(_) => None,
        }
    }

    /// Acceptor over the current snapshot; one handshake, one snapshot
    pub fn acceptor(&self) -> Option<TlsAcceptor> {
        self.server_config().map(|s| TlsAcceptor::from(s.config()))
    }

    /// Connector over the current snapshot, with the pinned peer name
    pub fn connector(&self) -> Option<(TlsConnector, Option<ServerName<'static>>)> {
        self.client_config()
            .map(|c| (TlsConnector::from(c.config()), c.server_name.clone()))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TlsConfig> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn validate(config: &TlsConfig) -> Result<()> {
    if config.cert_pem().is_empty() {
        return Err(SecurityError::tls_config(
            "TLS config carries no certificates",
        ));
    }
    if config.node_id().is_empty() {
        return Err(SecurityError::tls_config("TLS config has no node identity"));
    }
    Ok(())
}
