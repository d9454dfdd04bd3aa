//! Canonical filesystem layout for security material
//!
//! All credential files live directly under a caller-supplied base directory
//! with fixed names, so that a restarted process always finds the previous
//! process's material. Hidden sibling paths are the staging slots for the
//! crash-safe rotation protocol in [`crate::credentials`].

use std::path::{Path, PathBuf};

/// Filename of the root CA certificate bundle
pub const ROOT_CA_CERT_FILENAME: &str = "swarm-root-ca.crt";
/// Filename of the root CA signing key (present only on CA-capable nodes)
pub const ROOT_CA_KEY_FILENAME: &str = "swarm-root-ca.key";
/// Filename of the node's leaf certificate (plus intermediates)
pub const NODE_TLS_CERT_FILENAME: &str = "swarm-node.crt";
/// Filename of the node's private key
pub const NODE_TLS_KEY_FILENAME: &str = "swarm-node.key";

/// Absolute paths of one certificate/key pair
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertPaths {
    /// Path of the PEM certificate file
    pub cert: PathBuf,
    /// Path of the PEM private key file
    pub key: PathBuf,
}

impl CertPaths {
    /// Derive the hidden sibling paths used as staging slots during rotation.
    ///
    /// `/d/f.ext` maps to `/d/.f.ext` for both members of the pair.
    pub fn temp_siblings(&self) -> CertPaths {
        CertPaths {
            cert: hidden_sibling(&self.cert),
            key: hidden_sibling(&self.key),
        }
    }
}

/// Paths of all security-relevant files for one node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityConfigPaths {
    /// The per-node TLS identity
    pub node: CertPaths,
    /// The cluster root CA
    pub root_ca: CertPaths,
}

impl SecurityConfigPaths {
    /// Resolve the fixed layout under `base_dir`. Pure; performs no I/O.
    pub fn new(base_dir: &Path) -> Self {
        SecurityConfigPaths {
            node: CertPaths {
                cert: base_dir.join(NODE_TLS_CERT_FILENAME),
                key: base_dir.join(NODE_TLS_KEY_FILENAME),
            },
            root_ca: CertPaths {
                cert: base_dir.join(ROOT_CA_CERT_FILENAME),
                key: base_dir.join(ROOT_CA_KEY_FILENAME),
            },
        }
    }
}

pub(crate) fn hidden_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match path.parent() {
        Some(dir) => dir.join(format!(".{}", name)),
        None => PathBuf::from(format!(".{}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_uses_fixed_filenames() {
        let paths = SecurityConfigPaths::new(Path::new("/var/lib/swarm/certificates"));

        assert_eq!(
            paths.node.cert,
            PathBuf::from("/var/lib/swarm/certificates/swarm-node.crt")
        );
        assert_eq!(
            paths.node.key,
            PathBuf::from("/var/lib/swarm/certificates/swarm-node.key")
        );
        assert_eq!(
            paths.root_ca.cert,
            PathBuf::from("/var/lib/swarm/certificates/swarm-root-ca.crt")
        );
        assert_eq!(
            paths.root_ca.key,
            PathBuf::from("/var/lib/swarm/certificates/swarm-root-ca.key")
        );
    }

    #[test]
    fn temp_siblings_are_hidden_files_in_the_same_directory() {
        let paths = SecurityConfigPaths::new(Path::new("/d"));
        let temp = paths.node.temp_siblings();

        assert_eq!(temp.cert, PathBuf::from("/d/.swarm-node.crt"));
        assert_eq!(temp.key, PathBuf::from("/d/.swarm-node.key"));
    }

    #[test]
    fn sibling_derivation_is_stable() {
        let paths = CertPaths {
            cert: PathBuf::from("/a/b/f.ext"),
            key: PathBuf::from("/a/b/g.ext"),
        };
        let temp = paths.temp_siblings();
        assert_eq!(temp.cert, PathBuf::from("/a/b/.f.ext"));
        assert_eq!(temp.key, PathBuf::from("/a/b/.g.ext"));
        // Deriving twice prepends another dot; callers only ever derive once.
        assert_eq!(
            temp.temp_siblings().cert,
            PathBuf::from("/a/b/..f.ext")
        );
    }
}
