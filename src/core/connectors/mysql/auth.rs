//! Password scrambles for the MySQL authentication plugins the proxy speaks.

use crate::core::connectors::ConnectorError;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use zeroize::Zeroizing;

pub const NATIVE_PASSWORD: &str = "mysql_native_password";
pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

/// caching_sha2_password status bytes carried in an AuthMoreData packet.
pub const FAST_AUTH_SUCCESS: u8 = 0x03;
pub const PERFORM_FULL_AUTHENTICATION: u8 = 0x04;

/// `SHA1(password) XOR SHA1(salt ++ SHA1(SHA1(password)))`.
///
/// An empty password yields an empty response, which is how clients log in
/// to accounts without a password.
pub fn native_password(password: &[u8], salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Zeroizing::new(Sha1::digest(password).to_vec());
    let stage2 = Sha1::digest(stage1.as_slice());

    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// `SHA256(password) XOR SHA256(SHA256(SHA256(password)) ++ salt)`.
pub fn caching_sha2_password(password: &[u8], salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Zeroizing::new(Sha256::digest(password).to_vec());
    let stage2 = Sha256::digest(stage1.as_slice());

    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(salt);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Scramble `password` for `plugin`.
pub fn auth_response(plugin: &str, password: &[u8], salt: &[u8]) -> Result<Vec<u8>, ConnectorError> {
    match plugin {
        NATIVE_PASSWORD => Ok(native_password(password, salt)),
        CACHING_SHA2_PASSWORD => Ok(caching_sha2_password(password, salt)),
        other => Err(ConnectorError::Auth(format!("Unknown auth plugin: {}", other))),
    }
}
