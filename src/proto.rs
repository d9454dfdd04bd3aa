//! Wire contract for the remote-CA RPC
//!
//! The security core depends on exactly two remote operations: fetching the
//! cluster root certificate from a peer, and submitting a CSR for signing.
//! The messages below are the protobuf contract for those operations
//! (`/swarm.v1.CA/GetRootCACertificate` and
//! `/swarm.v1.NodeCA/IssueNodeCertificate`); the transport that carries
//! them lives behind [`crate::remote::CaTransport`].

#![allow(missing_docs)] // prost derives its own accessors on these

/// Request for the cluster root certificate bundle. Served to
/// unauthenticated peers; integrity comes from the join-token digest pin,
/// not the transport.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetRootCaCertificateRequest {}

/// The advertised root certificate bundle, PEM
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetRootCaCertificateResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub certificate: ::prost::alloc::vec::Vec<u8>,
}

/// A certificate signing request plus its authentication material.
///
/// During bootstrap the join token authenticates the caller; during renewal
/// the token is empty and the caller authenticates with its existing client
/// certificate at the TLS layer instead.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IssueNodeCertificateRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub csr: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, tag = "2")]
    pub token: ::prost::alloc::string::String,
}

/// The signed chain for an accepted issuance request.
///
/// Also doubles as the node-info notification payload handed to bootstrap
/// callers: `node_id` plus whether the cluster accepted the node.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IssueNodeCertificateResponse {
    #[prost(string, tag = "1")]
    pub node_id: ::prost::alloc::string::String,
    #[prost(bool, tag = "2")]
    pub accepted: bool,
    /// PEM chain, leaf first
    #[prost(bytes = "vec", tag = "3")]
    pub certificate_chain: ::prost::alloc::vec::Vec<u8>,
}
