//! On-disk credential files: read, verify, and atomically rotate
//!
//! # Rotation protocol
//!
//! 1. Write the new certificate and key to the hidden sibling paths, fsync.
//! 2. Rename the sibling certificate over the primary certificate.
//! 3. Rename the sibling key over the primary key.
//!
//! A crash between steps 2 and 3 leaves a new certificate paired with the
//! old key on the primary paths, while the sibling still holds the new key.
//! [`load_tls_key_pair`] recovers by trying the sibling key whenever the
//! primary key does not pair with the primary certificate.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rcgen::PublicKeyData;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::debug;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use crate::ca::RootCa;
use crate::error::{Result, SecurityError};
use crate::paths::{hidden_sibling, CertPaths};

/// A validated node TLS identity: parsed certificate chain, private key,
/// and the node metadata read out of the leaf
pub struct NodeTlsKeyPair {
    cert_pem: Vec<u8>,
    key_pem: Zeroizing<String>,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    node_id: String,
    role: String,
    not_before: SystemTime,
    not_after: SystemTime,
}

impl NodeTlsKeyPair {
    /// Parse and pair a PEM certificate chain with a PEM private key.
    ///
    /// Fails if either side does not parse or if the key's public half does
    /// not match the leaf certificate, which is the signal the
    /// crash-recovery path keys off of.
    pub fn from_pem(cert_pem: &[u8], key_pem: Zeroizing<String>) -> Result<Self> {
        let certs = certificates_from_pem(cert_pem)?;
        if certs.is_empty() {
            return Err(SecurityError::invalid_certificate(
                "no certificates in PEM",
            ));
        }
        let meta = leaf_metadata(certs[0].as_ref())?;

        let key = private_key_from_pem(&key_pem)?;

        let key_pair = rcgen::KeyPair::from_pem(&key_pem)
            .map_err(|e| SecurityError::invalid_key(format!("bad private key: {}", e)))?;
        let (_, leaf) = X509Certificate::from_der(certs[0].as_ref())
            .map_err(|e| SecurityError::invalid_certificate(e.to_string()))?;
        if key_pair.subject_public_key_info() != leaf.public_key().raw {
            return Err(SecurityError::invalid_key(
                "private key does not pair with the certificate",
            ));
        }

        Ok(NodeTlsKeyPair {
            cert_pem: cert_pem.to_vec(),
            key_pem,
            certs,
            key,
            node_id: meta.node_id,
            role: meta.role,
            not_before: meta.not_before,
            not_after: meta.not_after,
        })
    }

    /// Node ID from the leaf Common Name
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Role string from the leaf Organizational Unit
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Leaf validity window
    pub fn validity(&self) -> (SystemTime, SystemTime) {
        (self.not_before, self.not_after)
    }

    /// The PEM chain as stored on disk
    pub fn cert_pem(&self) -> &[u8] {
        &self.cert_pem
    }

    /// Owned copies of the PEM material, for transport-level client auth
    pub fn identity_pems(&self) -> (Vec<u8>, Zeroizing<String>) {
        (self.cert_pem.clone(), self.key_pem.clone())
    }

    /// Owned copy of the parsed certificate chain
    pub fn certs(&self) -> Vec<CertificateDer<'static>> {
        self.certs.clone()
    }

    /// Owned copy of the private key
    pub fn key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }
}

/// Load node credentials from disk and verify them against the root pool.
///
/// If the primary key is corrupt, absent, or does not pair with the primary
/// certificate, the hidden sibling key is tried before giving up: the
/// previous rotation may have crashed after renaming the certificate but
/// before renaming the key. The first failure is reported if the sibling
/// does not work either.
pub fn load_tls_key_pair(root: &RootCa, paths: &CertPaths) -> Result<NodeTlsKeyPair> {
    let cert = fs::read(&paths.cert)?;
    root.verify_chain(&cert)?;

    let primary = fs::read_to_string(&paths.key)
        .map_err(SecurityError::from)
        .and_then(|key| NodeTlsKeyPair::from_pem(&cert, Zeroizing::new(key)));

    match primary {
        Ok(key_pair) => Ok(key_pair),
        Err(err) => {
            let temp = paths.temp_siblings();
            match fs::read_to_string(&temp.key) {
                Ok(key) => {
                    debug!(path = %temp.key.display(), "recovered key from rotation sibling");
                    NodeTlsKeyPair::from_pem(&cert, Zeroizing::new(key)).map_err(|_| err)
                }
                Err(_) => Err(err),
            }
        }
    }
}

/// Persist a certificate/key pair through the rotation protocol.
///
/// The key file is never world-readable.
pub fn save_key_pair(paths: &CertPaths, cert_pem: &[u8], key_pem: &str) -> Result<()> {
    let temp = paths.temp_siblings();

    write_file(&temp.cert, cert_pem, 0o644)?;
    write_file(&temp.key, key_pem.as_bytes(), 0o600)?;

    fs::rename(&temp.cert, &paths.cert)?;
    fs::rename(&temp.key, &paths.key)?;
    Ok(())
}

/// Atomically replace a single file via its hidden sibling.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    let sibling = hidden_sibling(path);
    write_file(&sibling, bytes, mode)?;
    fs::rename(&sibling, path)?;
    Ok(())
}

/// Read the validity window of the node certificate on disk.
pub fn read_cert_validity(paths: &CertPaths) -> Result<(SystemTime, SystemTime)> {
    let cert = fs::read(&paths.cert)?;
    let certs = certificates_from_pem(&cert)?;
    let leaf = certs
        .first()
        .ok_or_else(|| SecurityError::invalid_certificate("no certificates in PEM"))?;
    let meta = leaf_metadata(leaf.as_ref())?;
    Ok((meta.not_before, meta.not_after))
}

pub(crate) struct LeafMetadata {
    pub node_id: String,
    pub role: String,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
}

/// Extract node ID (CN), role (OU), and validity from a leaf certificate.
pub(crate) fn leaf_metadata(leaf_der: &[u8]) -> Result<LeafMetadata> {
    let (_, cert) = X509Certificate::from_der(leaf_der)
        .map_err(|e| SecurityError::invalid_certificate(e.to_string()))?;

    let node_id = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| SecurityError::invalid_certificate("certificate has no common name"))?
        .to_string();
    let role = cert
        .subject()
        .iter_organizational_unit()
        .next()
        .and_then(|ou| ou.as_str().ok())
        .ok_or_else(|| {
            SecurityError::invalid_certificate("certificate has no organizational unit")
        })?
        .to_string();

    Ok(LeafMetadata {
        node_id,
        role,
        not_before: unix_to_system_time(cert.validity().not_before.timestamp()),
        not_after: unix_to_system_time(cert.validity().not_after.timestamp()),
    })
}

pub(crate) fn certificates_from_pem(pem_bytes: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let blocks = ::pem::parse_many(pem_bytes)
        .map_err(|e| SecurityError::invalid_certificate(format!("bad PEM: {}", e)))?;
    Ok(blocks
        .iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .map(|p| CertificateDer::from(p.contents().to_vec()))
        .collect())
}

pub(crate) fn private_key_from_pem(key_pem: &str) -> Result<PrivateKeyDer<'static>> {
    let block = ::pem::parse(key_pem)
        .map_err(|e| SecurityError::invalid_key(format!("bad key PEM: {}", e)))?;
    let der = block.contents().to_vec();
    match block.tag() {
        "PRIVATE KEY" => Ok(PrivateKeyDer::Pkcs8(der.into())),
        "EC PRIVATE KEY" => Ok(PrivateKeyDer::Sec1(der.into())),
        "RSA PRIVATE KEY" => Ok(PrivateKeyDer::Pkcs1(der.into())),
        other => Err(SecurityError::invalid_key(format!(
            "unsupported private key type: {}",
            other
        ))),
    }
}

fn write_file(path: &Path, bytes: &[u8], _mode: u32) -> Result<()> {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(_mode);
    }
    let mut file = opts.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn unix_to_system_time(ts: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(ts.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::create_root_ca;
    use crate::paths::SecurityConfigPaths;
    use crate::role::WORKER_ROLE;
    use tempfile::TempDir;

    fn issued_pair(
        root: &crate::ca::RootCa,
        paths: &CertPaths,
        node_id: &str,
    ) -> NodeTlsKeyPair {
        root.issue_and_save_new_certificates(paths, node_id, WORKER_ROLE, "org-1")
            .unwrap()
    }

    #[test]
    fn write_then_read_verifies_under_the_root() {
        let dir = TempDir::new().unwrap();
        let paths = SecurityConfigPaths::new(dir.path());
        let root = create_root_ca("swarm-ca").unwrap();

        issued_pair(&root, &paths.node, "node-1");
        let loaded = load_tls_key_pair(&root, &paths.node).unwrap();

        assert_eq!(loaded.node_id(), "node-1");
        assert_eq!(loaded.role(), WORKER_ROLE);
        assert!(!loaded.certs().is_empty());
    }

    #[test]
    fn crash_between_cert_and_key_rename_recovers_via_sibling() {
        let dir = TempDir::new().unwrap();
        let paths = SecurityConfigPaths::new(dir.path());
        let root = create_root_ca("swarm-ca").unwrap();

        // First rotation completed normally.
        let old = issued_pair(&root, &paths.node, "node-old");
        let (_, old_key) = old.identity_pems();

        // Second rotation crashed between step 2 and step 3: the primary
        // cert is new, the primary key is still old, the sibling key is new.
        let scratch = TempDir::new().unwrap();
        let scratch_paths = SecurityConfigPaths::new(scratch.path());
        let new = issued_pair(&root, &scratch_paths.node, "node-new");
        let (new_cert, new_key) = new.identity_pems();

        fs::write(&paths.node.cert, &new_cert).unwrap();
        fs::write(&paths.node.key, old_key.as_bytes()).unwrap();
        let temp = paths.node.temp_siblings();
        fs::write(&temp.key, new_key.as_bytes()).unwrap();

        let loaded = load_tls_key_pair(&root, &paths.node).unwrap();
        assert_eq!(loaded.node_id(), "node-new");
    }

    #[test]
    fn missing_primary_key_recovers_via_sibling() {
        let dir = TempDir::new().unwrap();
        let paths = SecurityConfigPaths::new(dir.path());
        let root = create_root_ca("swarm-ca").unwrap();

        let pair = issued_pair(&root, &paths.node, "node-1");
        let (_, key) = pair.identity_pems();

        let temp = paths.node.temp_siblings();
        fs::write(&temp.key, key.as_bytes()).unwrap();
        fs::remove_file(&paths.node.key).unwrap();

        let loaded = load_tls_key_pair(&root, &paths.node).unwrap();
        assert_eq!(loaded.node_id(), "node-1");
    }

    #[test]
    fn unrecoverable_key_reports_the_original_failure() {
        let dir = TempDir::new().unwrap();
        let paths = SecurityConfigPaths::new(dir.path());
        let root = create_root_ca("swarm-ca").unwrap();

        issued_pair(&root, &paths.node, "node-1");
        fs::write(&paths.node.key, b"garbage").unwrap();
        // No sibling key either.

        assert!(load_tls_key_pair(&root, &paths.node).is_err());
    }

    #[test]
    fn certificates_from_a_foreign_root_fail_verification() {
        let dir = TempDir::new().unwrap();
        let paths = SecurityConfigPaths::new(dir.path());
        let root = create_root_ca("swarm-ca").unwrap();
        let foreign = create_root_ca("swarm-ca").unwrap();

        issued_pair(&root, &paths.node, "node-1");

        assert!(matches!(
            load_tls_key_pair(&foreign, &paths.node),
            Err(SecurityError::ChainVerification(_))
        ));
    }

    #[test]
    fn validity_window_matches_the_signing_policy() {
        let dir = TempDir::new().unwrap();
        let paths = SecurityConfigPaths::new(dir.path());
        let root = create_root_ca("swarm-ca").unwrap();

        issued_pair(&root, &paths.node, "node-1");
        let (not_before, not_after) = read_cert_validity(&paths.node).unwrap();

        let width = not_after.duration_since(not_before).unwrap();
        assert_eq!(width, root.signing_policy().expiry());
        assert!(not_before <= SystemTime::now());
    }

    #[cfg(unix)]
    #[test]
    fn key_files_are_not_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let paths = SecurityConfigPaths::new(dir.path());
        let root = create_root_ca("swarm-ca").unwrap();

        issued_pair(&root, &paths.node, "node-1");

        let mode = fs::metadata(&paths.node.key).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0, "key file must be owner-only");
    }

    #[test]
    fn rotation_leaves_no_stale_siblings() {
        let dir = TempDir::new().unwrap();
        let paths = SecurityConfigPaths::new(dir.path());
        let root = create_root_ca("swarm-ca").unwrap();

        issued_pair(&root, &paths.node, "node-1");

        let temp = paths.node.temp_siblings();
        assert!(!temp.cert.exists());
        assert!(!temp.key.exists());
    }
}
