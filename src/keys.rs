use std::path::Path;

use eyre::{eyre, Result, WrapErr};
use russh_keys::{
    key::{KeyPair, PublicKey, SignatureHash},
    PublicKeyBase64,
};
use tracing::{debug, warn};

use crate::api;

/// Legacy MD5 fingerprint, colon-separated hex pairs. Registered public
/// keys and the magic key are both identified this way.
pub fn fingerprint(key: &PublicKey) -> String {
    let digest = md5::compute(key.public_key_bytes());

    digest
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// The gateway's SSH host key. Not having one is a configuration error, not
/// something to paper over.
pub fn host_key(path: &Path) -> Result<KeyPair> {
    russh_keys::load_secret_key(path, None)
        .wrap_err_with(|| format!("failed to load the host key at {}", path.display()))
}

/// The magic key: the gateway's identity when connecting to a device on
/// behalf of a public-key-authenticated user. Deployments that manage key
/// material centrally serve it from the API; otherwise one is minted per
/// process.
pub async fn magic_key(api: &api::Client) -> Result<KeyPair> {
    match api.key().await {
        Ok(data) => {
            debug!("using the managed gateway key");

            russh_keys::decode_secret_key(&data, None)
                .wrap_err("failed to decode the managed gateway key")
        }
        Err(error) => {
            warn!(?error, "no managed gateway key, generating one");

            generate()
        }
    }
}

pub fn generate() -> Result<KeyPair> {
    KeyPair::generate_rsa(2048, SignatureHash::SHA2_256)
        .ok_or_else(|| eyre!("failed to generate an RSA key"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprints_are_colon_separated_md5() {
        let key = KeyPair::generate_ed25519();

        let fingerprint = fingerprint(&key.clone_public_key().unwrap());

        let pairs: Vec<&str> = fingerprint.split(':').collect();
        assert_eq!(pairs.len(), 16);
        assert!(pairs
            .iter()
            .all(|pair| pair.len() == 2 && pair.chars().all(|c| c.is_ascii_hexdigit())));
    }

    #[test]
    fn fingerprints_are_stable() {
        let key = KeyPair::generate_ed25519();
        let public = key.clone_public_key().unwrap();

        assert_eq!(fingerprint(&public), fingerprint(&public));
    }
}
