//! swarm-security - node security core for the swarm cluster agent
//!
//! Every node in the cluster presents an X.509 certificate signed by the
//! cluster root CA; the certificate encodes the node's identity (Common
//! Name) and role (Organizational Unit), which downstream authorization
//! layers consume. This crate owns the lifecycle of that credential:
//!
//! - [`bootstrap::load_or_create_security_config`] reconciles on-disk
//!   material with a remote issuer into a validated client+server TLS
//!   identity, using a join token to pin the root on first contact.
//! - [`renewal::renew_tls_config`] runs for the life of the process,
//!   re-issuing the certificate at a jittered point inside its validity
//!   window and swapping the live TLS configurations in place.
//! - [`tls::MutableTlsCredentials`] is the handle listeners and dialers
//!   hold across those swaps.
//!
//! # Modules
//!
//! - [`paths`] - fixed filesystem layout under the certificate directory
//! - [`ca`] - root CA holder, signing policy, and issuance
//! - [`credentials`] - on-disk PEM files and the crash-safe rotation protocol
//! - [`tls`] - rustls client/server configs and the mutable credential
//! - [`bootstrap`] - the bootstrap coordinator and [`bootstrap::SecurityConfig`]
//! - [`remote`] - remote-CA client and its transport seam
//! - [`renewal`] - the certificate renewal loop
//! - [`token`] - join-token codec
//! - [`role`] - role string/enum codec
//! - [`identity`] - random node and organization identifiers
//! - [`proto`] - wire contract of the remote-CA RPC
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod bootstrap;
pub mod ca;
pub mod credentials;
pub mod error;
pub mod identity;
pub mod paths;
pub mod proto;
pub mod remote;
pub mod renewal;
pub mod role;
pub mod tls;
pub mod token;

pub use bootstrap::{load_or_create_security_config, SecurityConfig};
pub use error::{Result, SecurityError};
pub use renewal::{renew_tls_config, CertificateUpdate};
