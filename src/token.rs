//! Join token generation and decoding
//!
//! A join token is the human-transmissible secret handed to a node joining
//! the cluster. It binds two things: the SHA-256 digest of the root CA the
//! node must end up trusting (so the first fetch can be integrity-checked
//! over an untrusted channel), and a random shared secret the remote CA uses
//! to authenticate the issuance request. The secret is opaque to this codec.

use crate::ca::{Digest, RootCa};
use crate::error::{Result, SecurityError};

/// Literal first segment of every join token
const TOKEN_PREFIX: &str = "SWMTKN";
/// Literal version segment
const TOKEN_VERSION: &str = "1";
/// Entropy behind the shared secret
const SECRET_ENTROPY_BYTES: usize = 16;
/// ceil(log(2^128-1, 36))
const SECRET_SEGMENT_LEN: usize = 25;
/// ceil(log(2^256-1, 36))
const DIGEST_SEGMENT_LEN: usize = 50;

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Create a new join token bound to the given root CA.
///
/// The secret comes from the CSPRNG. The result is always exactly 83
/// characters: `SWMTKN-1-<50 chars base36>-<25 chars base36>`.
pub fn generate_join_token(root_ca: &RootCa) -> String {
    let mut secret = [0u8; SECRET_ENTROPY_BYTES];
    aws_lc_rs::rand::fill(&mut secret).expect("system CSPRNG failure");

    encode_join_token(&root_ca.digest(), &secret)
}

fn encode_join_token(digest: &Digest, secret: &[u8; SECRET_ENTROPY_BYTES]) -> String {
    format!(
        "{}-{}-{:0>digest_len$}-{:0>secret_len$}",
        TOKEN_PREFIX,
        TOKEN_VERSION,
        base36_encode(digest.as_bytes()),
        base36_encode(secret),
        digest_len = DIGEST_SEGMENT_LEN,
        secret_len = SECRET_SEGMENT_LEN,
    )
}

/// Extract the pinned root CA digest from a join token.
///
/// Any deviation from the four-segment shape, the literal prefix segments,
/// or the fixed segment lengths is a fatal token error. The secret segment
/// is length-checked but otherwise opaque.
pub fn ca_digest_from_token(token: &str) -> Result<Digest> {
    let segments: Vec<&str> = token.split('-').collect();
    if segments.len() != 4 || segments[0] != TOKEN_PREFIX || segments[1] != TOKEN_VERSION {
        return Err(SecurityError::InvalidJoinToken);
    }
    if segments[2].len() != DIGEST_SEGMENT_LEN || segments[3].len() != SECRET_SEGMENT_LEN {
        return Err(SecurityError::InvalidJoinToken);
    }

    let raw = base36_decode(segments[2], 32)?;
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&raw);
    Ok(Digest::from_raw(bytes))
}

/// Encode bytes as a big-endian base-36 integer, lowercase, no padding.
pub(crate) fn base36_encode(bytes: &[u8]) -> String {
    // Long division over the big-endian base-256 representation.
    let mut digits = bytes.to_vec();
    let mut out: Vec<u8> = Vec::new();

    while digits.iter().any(|&b| b != 0) {
        let mut rem: u32 = 0;
        for b in digits.iter_mut() {
            let acc = (rem << 8) | u32::from(*b);
            *b = (acc / 36) as u8;
            rem = acc % 36;
        }
        out.push(BASE36_ALPHABET[rem as usize]);
    }
    if out.is_empty() {
        out.push(b'0');
    }

    out.iter().rev().map(|&b| b as char).collect()
}

/// Decode a base-36 string into a left-zero-padded `width`-byte value.
fn base36_decode(s: &str, width: usize) -> Result<Vec<u8>> {
    let mut value: Vec<u8> = vec![0];

    for c in s.chars() {
        let digit = c
            .to_ascii_lowercase()
            .to_digit(36)
            .ok_or(SecurityError::InvalidJoinToken)?;

        // value = value * 36 + digit, little-endian base-256
        let mut carry = digit;
        for b in value.iter_mut() {
            let acc = u32::from(*b) * 36 + carry;
            *b = (acc & 0xff) as u8;
            carry = acc >> 8;
        }
        while carry > 0 {
            value.push((carry & 0xff) as u8);
            carry >>= 8;
        }
    }

    if value.len() > width {
        return Err(SecurityError::InvalidJoinToken);
    }
    let mut out = vec![0u8; width];
    out[width - value.len()..].copy_from_slice(&value.iter().rev().copied().collect::<Vec<u8>>());
    Ok(out)
}
