use rand::Rng;
use sha2::{Digest, Sha256};

/// Length of the random part of a session token, in hex characters.
pub const TOKEN_HEX_LEN: usize = 64;

/// Mint a staged-session token: `<prefix>_` + 32 random bytes hex-encoded.
/// The prefix identifies the operation kind so a token can be format-checked
/// before any store lookup.
pub fn mint_session_token(prefix: &str) -> String {
    format!("{prefix}_{}", random_hex(32))
}

/// Strict format check: `<expected_prefix>_` followed by exactly
/// [`TOKEN_HEX_LEN`] lowercase hex characters. Cheap enough to run before
/// touching the session store.
pub fn is_well_formed(token: &str, expected_prefix: &str) -> bool {
    let Some(rest) = token.strip_prefix(expected_prefix) else {
        return false;
    };
    let Some(hex_part) = rest.strip_prefix('_') else {
        return false;
    };
    hex_part.len() == TOKEN_HEX_LEN
        && hex_part
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Extract the operation prefix from a session token, if any.
pub fn token_prefix(token: &str) -> Option<&str> {
    let (prefix, rest) = token.split_once('_')?;
    if prefix.is_empty() || rest.len() != TOKEN_HEX_LEN {
        return None;
    }
    Some(prefix)
}

/// SHA-256 hex digest of a token string. Used when a token must be logged
/// or compared without ever storing the raw value.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate `n` random bytes and return as hex string.
fn random_hex(n: usize) -> String {
    let bytes: Vec<u8> = (0..n).map(|_| rand::thread_rng().r#gen::<u8>()).collect();
    hex::encode(&bytes)
}
