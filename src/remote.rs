//! Remote-CA client
//!
//! Two concerns live here: picking a peer to talk to (the [`Remotes`]
//! collaborator, fed by cluster discovery) and carrying the two issuance
//! RPCs to that peer. The wire itself sits behind [`CaTransport`] so the
//! bootstrap and renewal logic never depend on a concrete transport; the
//! production implementation is [`GrpcCaTransport`].

use async_trait::async_trait;
use rand::Rng;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Certificate, ClientTlsConfig as TonicClientTlsConfig, Endpoint, Identity, Uri};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use zeroize::Zeroizing;

use crate::ca::{Digest, RootCa, DEFAULT_NODE_CERT_EXPIRATION};
use crate::error::{Result, SecurityError};
use crate::proto::{
    GetRootCaCertificateRequest, GetRootCaCertificateResponse, IssueNodeCertificateRequest,
    IssueNodeCertificateResponse,
};
use crate::role::{RoleAuthorizations, MANAGER_ROLE};

/// Cluster discovery collaborator: yields manager endpoints to talk to and
/// accepts observations about how each conversation went.
pub trait Remotes: Send + Sync {
    /// Pick a peer for the next request
    fn select(&self) -> Result<Uri>;

    /// Report the outcome of a conversation with `peer`
    fn observe(&self, _peer: &Uri, _success: bool) {}
}

/// A fixed endpoint list; selection is uniformly random so a fleet of
/// bootstrapping nodes does not converge on one manager.
pub struct StaticRemotes {
    peers: Vec<Uri>,
}

impl StaticRemotes {
    /// Build from a non-empty peer list
    pub fn new(peers: Vec<Uri>) -> Self {
        StaticRemotes { peers }
    }
}

impl Remotes for StaticRemotes {
    fn select(&self) -> Result<Uri> {
        if self.peers.is_empty() {
            return Err(SecurityError::config("no remote peers available"));
        }
        let idx = rand::thread_rng().gen_range(0..self.peers.len());
        Ok(self.peers[idx].clone())
    }
}

/// PEM identity presented at the TLS layer during renewal issuance
pub struct ClientIdentityPem {
    /// Certificate chain PEM
    pub cert_pem: Vec<u8>,
    /// Private key PEM
    pub key_pem: Zeroizing<String>,
}

/// TLS material for one issuance call
pub struct IssuanceTls {
    /// Root bundle the server certificate must verify under
    pub root_ca_pem: Vec<u8>,
    /// Client identity for renewal calls; bootstrap calls carry none and
    /// authenticate with the join token inside the request instead
    pub identity: Option<ClientIdentityPem>,
}

/// The remote-CA wire, one method per RPC the core depends on.
///
/// Errors are transient from the caller's perspective: bootstrap retries
/// the fetch a fixed number of times, renewal retries on its next tick.
#[async_trait]
pub trait CaTransport: Send + Sync {
    /// Fetch the peer's advertised root certificate bundle
    async fn fetch_root_ca(&self, peer: &Uri) -> Result<Vec<u8>>;

    /// Submit a CSR and await the signed chain
    async fn issue_node_certificate(
        &self,
        peer: &Uri,
        request: IssueNodeCertificateRequest,
        tls: IssuanceTls,
    ) -> Result<IssueNodeCertificateResponse>;
}

/// Fetch the root CA from a peer and build a verify-only [`RootCa`] from it.
///
/// When `digest_pin` is given (decoded from a join token), the fetched
/// bytes must hash to it; a mismatch is fatal and never retried. With no
/// pin the caller has opted into trust-on-first-use.
pub async fn get_remote_ca(
    cancel: &CancellationToken,
    digest_pin: Option<Digest>,
    remotes: &dyn Remotes,
    transport: &dyn CaTransport,
) -> Result<RootCa> {
    let peer = remotes.select()?;

    let fetched = tokio::select! {
        _ = cancel.cancelled() => return Err(SecurityError::Cancelled),
        res = transport.fetch_root_ca(&peer) => res,
    };
    let bytes = match fetched {
        Ok(bytes) => {
            remotes.observe(&peer, true);
            bytes
        }
        Err(e) => {
            remotes.observe(&peer, false);
            return Err(e);
        }
    };

    if let Some(pin) = digest_pin {
        let actual = Digest::from_bytes(&bytes);
        if actual != pin {
            return Err(SecurityError::DigestMismatch {
                expected: pin.to_string(),
                actual: actual.to_string(),
            });
        }
    }

    debug!(peer = %peer, "retrieved remote root CA certificate");
    // Fetched roots are verify-only and carry no authorization map.
    RootCa::new(
        &bytes,
        None,
        DEFAULT_NODE_CERT_EXPIRATION,
        RoleAuthorizations::default(),
    )
}

/// gRPC transport for the remote-CA contract.
///
/// The root fetch rides the endpoint as advertised: its integrity comes
/// from the digest pin, not the channel. Issuance always goes over TLS
/// verified against the (just pinned or already trusted) root bundle, with
/// the manager role as the expected peer name.
pub struct GrpcCaTransport;

#[async_trait]
impl CaTransport for GrpcCaTransport {
    async fn fetch_root_ca(&self, peer: &Uri) -> Result<Vec<u8>> {
        let channel = Endpoint::from(peer.clone())
            .connect()
            .await
            .map_err(|e| SecurityError::rpc(e.to_string()))?;

        let mut grpc = Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| SecurityError::rpc(e.to_string()))?;

        let codec: ProstCodec<GetRootCaCertificateRequest, GetRootCaCertificateResponse> =
            ProstCodec::default();
        let response = grpc
            .unary(
                tonic::Request::new(GetRootCaCertificateRequest {}),
                PathAndQuery::from_static("/swarm.v1.CA/GetRootCACertificate"),
                codec,
            )
            .await
            .map_err(|status| SecurityError::rpc(status.to_string()))?;

        Ok(response.into_inner().certificate)
    }

    async fn issue_node_certificate(
        &self,
        peer: &Uri,
        request: IssueNodeCertificateRequest,
        tls: IssuanceTls,
    ) -> Result<IssueNodeCertificateResponse> {
        let mut tls_config = TonicClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(&tls.root_ca_pem))
            .domain_name(MANAGER_ROLE);
        if let Some(identity) = &tls.identity {
            tls_config = tls_config.identity(Identity::from_pem(
                &identity.cert_pem,
                identity.key_pem.as_bytes(),
            ));
        }

        let channel = Endpoint::from(peer.clone())
            .tls_config(tls_config)
            .map_err(|e| SecurityError::rpc(e.to_string()))?
            .connect()
            .await
            .map_err(|e| SecurityError::rpc(e.to_string()))?;

        let mut grpc = Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| SecurityError::rpc(e.to_string()))?;

        let codec: ProstCodec<IssueNodeCertificateRequest, IssueNodeCertificateResponse> =
            ProstCodec::default();
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static("/swarm.v1.NodeCA/IssueNodeCertificate"),
                codec,
            )
            .await
            .map_err(|status| SecurityError::rpc(status.to_string()))?;

        Ok(response.into_inner())
    }
}
