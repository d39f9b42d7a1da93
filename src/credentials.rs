//! Credential decryption seam
//!
//! Channel configs and per-type monitor configs store secrets encrypted at
//! rest. The primitives live outside the core; workers decrypt just-in-time
//! through this trait and never cache clear text beyond a job's lifetime.

use std::sync::Arc;

use tracing::error;

/// Keys treated as secrets inside config objects
const SECRET_KEYS: &[&str] = &[
    "password",
    "apiKey",
    "api_key",
    "token",
    "authToken",
    "auth_token",
    "privateKey",
    "private_key",
    "signingKey",
    "signing_key",
    "accessTokenSecret",
    "consumerSecret",
];

/// Decrypts values produced by the (external) credential subsystem
pub trait CredentialCipher: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> anyhow::Result<String>;
}

/// Pass-through cipher for deployments storing secrets in the clear
/// (development, tests)
pub struct PlainCipher;

impl CredentialCipher for PlainCipher {
    fn decrypt(&self, ciphertext: &str) -> anyhow::Result<String> {
        Ok(ciphertext.to_string())
    }
}

/// Return a copy of `config` with every secret field decrypted in place.
///
/// A field that fails to decrypt is removed rather than passed through,
/// which downgrades the specific BYO feature instead of leaking ciphertext
/// into a protocol client.
pub fn decrypt_config(
    cipher: &Arc<dyn CredentialCipher>,
    config: &serde_json::Value,
) -> serde_json::Value {
    let mut decrypted = config.clone();
    decrypt_in_place(cipher, &mut decrypted);
    decrypted
}

fn decrypt_in_place(cipher: &Arc<dyn CredentialCipher>, value: &mut serde_json::Value) {
    let Some(map) = value.as_object_mut() else {
        return;
    };

    let mut failed = Vec::new();
    for (key, field) in map.iter_mut() {
        if field.is_object() {
            decrypt_in_place(cipher, field);
            continue;
        }

        if !SECRET_KEYS.contains(&key.as_str()) {
            continue;
        }
        let Some(ciphertext) = field.as_str() else {
            continue;
        };

        match cipher.decrypt(ciphertext) {
            Ok(clear) => *field = serde_json::Value::String(clear),
            Err(e) => {
                error!("failed to decrypt credential field {key}: {e:#}");
                failed.push(key.clone());
            }
        }
    }

    for key in failed {
        map.remove(&key);
    }
}
