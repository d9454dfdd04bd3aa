//! Node role encoding
//!
//! A node's role travels two ways: as a wire-level enumeration in the
//! remote-CA RPC contract, and as a string literal embedded in the
//! Organizational Unit of the node's certificate. Downstream authorization
//! reads the string form out of presented chains.

use crate::error::{Result, SecurityError};

/// Role string for manager nodes, used for authorization to endpoints
pub const MANAGER_ROLE: &str = "swarm-manager";
/// Role string for worker nodes, used for authorization to endpoints
pub const WORKER_ROLE: &str = "swarm-worker";
/// Role string for the CA itself, used by clients requesting issuance
pub const CA_ROLE: &str = "swarm-ca";

/// Permission name for access to the node-listing control API
pub const PERM_CONTROL_LIST_NODES: &str = "swarm-control-listnodes";

/// Roles authorized to exercise each named permission.
///
/// Carried on the root CA and read by downstream authorization layers; the
/// security core itself only transports it.
pub type RoleAuthorizations = std::collections::HashMap<String, Vec<NodeRole>>;

/// Wire-level node role, as carried in the remote-CA RPC contract
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum NodeRole {
    /// A worker node: runs tasks, never serves the control API
    Worker = 0,
    /// A manager node: serves the control API and may sign certificates
    Manager = 1,
}

/// Map a wire-level role to the string embedded in certificate OUs.
///
/// Total over `{Manager, Worker}`; the CA role exists only for the signer's
/// own certificate and is never produced here.
pub fn parse_role(role: NodeRole) -> &'static str {
    match role {
        NodeRole::Manager => MANAGER_ROLE,
        NodeRole::Worker => WORKER_ROLE,
    }
}

/// Map a role string back to the wire-level enumeration.
///
/// Matching is case-insensitive; any value other than the two node roles is
/// an error (in particular, the CA role string does not parse).
pub fn format_role(role: &str) -> Result<NodeRole> {
    if role.eq_ignore_ascii_case(MANAGER_ROLE) {
        Ok(NodeRole::Manager)
    } else if role.eq_ignore_ascii_case(WORKER_ROLE) {
        Ok(NodeRole::Worker)
    } else {
        Err(SecurityError::InvalidRole(role.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_round_trip() {
        for role in [NodeRole::Manager, NodeRole::Worker] {
            assert_eq!(format_role(parse_role(role)).unwrap(), role);
        }
        assert_eq!(parse_role(format_role(MANAGER_ROLE).unwrap()), MANAGER_ROLE);
        assert_eq!(parse_role(format_role(WORKER_ROLE).unwrap()), WORKER_ROLE);
    }

    #[test]
    fn parsing_is_case_insensitive() {
        assert_eq!(format_role("SWARM-MANAGER").unwrap(), NodeRole::Manager);
        assert_eq!(format_role("Swarm-Worker").unwrap(), NodeRole::Worker);
    }

    #[test]
    fn unknown_roles_are_rejected() {
        assert!(matches!(
            format_role("swarm-admin"),
            Err(SecurityError::InvalidRole(_))
        ));
        assert!(format_role("").is_err());
    }

    #[test]
    fn ca_role_never_parses_to_a_node_role() {
        assert!(format_role(CA_ROLE).is_err());
    }

    #[test]
    fn role_authorizations_map_by_permission_name() {
        let mut authz = RoleAuthorizations::new();
        authz.insert(
            PERM_CONTROL_LIST_NODES.to_string(),
            vec![NodeRole::Manager],
        );

        assert_eq!(
            authz.get(PERM_CONTROL_LIST_NODES),
            Some(&vec![NodeRole::Manager])
        );
        assert!(authz.get("swarm-control-other").is_none());
    }
}
