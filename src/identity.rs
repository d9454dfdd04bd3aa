//! Random node and organization identifiers
//!
//! Identifiers are embedded in certificate subjects (node ID as the Common
//! Name, organization ID as the Organization), so they must be globally
//! unique and unguessable. They come from the CSPRNG, never the ordinary
//! PRNG used for renewal jitter.

use crate::token::base36_encode;

/// Entropy behind a generated identifier
const ID_ENTROPY_BYTES: usize = 16;
/// ceil(log(2^128-1, 36))
const ID_LENGTH: usize = 25;

/// Generate a new random identifier: 25 lowercase base-36 characters.
pub fn new_id() -> String {
    let mut raw = [0u8; ID_ENTROPY_BYTES];
    aws_lc_rs::rand::fill(&mut raw).expect("system CSPRNG failure");

    let encoded = base36_encode(&raw);
    format!("{:0>width$}", encoded, width = ID_LENGTH)
}
