//! WireGuard key handling for the router controller

use crate::{CoreError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ini::Ini;
use x25519_dalek::{PublicKey, StaticSecret};

/// Derive the base64 public key matching a base64 WireGuard private key
pub fn public_key_from_private(private_key: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(private_key.trim())
        .map_err(|e| CoreError::InvalidKey(format!("private key is not base64: {}", e)))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| CoreError::InvalidKey(format!("private key is {} bytes, expected 32", b.len())))?;

    let secret = StaticSecret::from(bytes);
    let public = PublicKey::from(&secret);
    Ok(STANDARD.encode(public.as_bytes()))
}

/// Read the `[Interface] PrivateKey` of a wg-quick config and derive its public key.
///
/// Only the part before the first `[Peer]` section is considered.
pub fn public_key_from_config(config_text: &str) -> Result<String> {
    let header = config_text.split("[Peer]").next().unwrap_or_default();
    let doc = Ini::load_from_str(header).map_err(|e| CoreError::InvalidKey(e.to_string()))?;
    let private_key = doc
        .section(Some("Interface"))
        .and_then(|section| section.get("PrivateKey"))
        .ok_or_else(|| CoreError::InvalidKey("no [Interface] PrivateKey in config".to_string()))?;
    public_key_from_private(private_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Key pair from the wg(8) documentation examples
    const PRIVATE: &str = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";
    const PUBLIC: &str = "HIgo9xNzJMWLKASShiTqIybxZ0U3wGLiUeJ1PKf8ykw=";

    #[test]
    fn test_public_key_from_private() {
        assert_eq!(public_key_from_private(PRIVATE).unwrap(), PUBLIC);
    }

    #[test]
    fn test_public_key_from_config() {
        let config = format!(
            "[Interface]\nPrivateKey = {}\nListenPort = 51820\n\n[Peer]\nPublicKey = abc\n",
            PRIVATE
        );
        assert_eq!(public_key_from_config(&config).unwrap(), PUBLIC);
    }

    #[test]
    fn test_rejects_bad_keys() {
        assert!(public_key_from_private("not base64!").is_err());
        assert!(public_key_from_private("AAAA").is_err());
        assert!(public_key_from_config("[Interface]\nListenPort = 1\n").is_err());
    }
}
