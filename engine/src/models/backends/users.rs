//! Per-user credential persistence (spec §3 `UserConfig`): Booru accounts and per-site
//! secrets, encrypted at rest with the engine's `encryption_key` and only ever decrypted
//! into memory for the lifetime of a single job.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use tracing::instrument;

use crate::client::BooruCreds;
use crate::models::{BooruCredentials, SiteCredentials, UserConfig};
use crate::utils::{ApiError, Shared};

const NONCE_LEN: usize = 12;

/// Derive the AES-256-GCM cipher from the engine's configured key. The key is expected to
/// be exactly 32 bytes once utf8-decoded; shorter/longer keys are a misconfiguration.
fn cipher(encryption_key: &str) -> Result<Aes256Gcm, ApiError> {
    let bytes = encryption_key.as_bytes();
    if bytes.len() != 32 {
        return Err(crate::bad_internal!(format!(
            "encryption_key must be exactly 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(Aes256Gcm::new_from_slice(bytes).expect("key length checked above"))
}

/// Encrypt a secret for storage: a random 12-byte nonce is prepended to the ciphertext
fn encrypt(plaintext: &str, encryption_key: &str) -> Result<Vec<u8>, ApiError> {
    let cipher = cipher(encryption_key)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let mut out = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| crate::bad_internal!("failed to encrypt credential".to_string()))?;
    let mut sealed = nonce_bytes.to_vec();
    sealed.append(&mut out);
    Ok(sealed)
}

/// Decrypt a secret previously sealed by [`encrypt`]
fn decrypt(sealed: &[u8], encryption_key: &str) -> Result<String, ApiError> {
    if sealed.len() < NONCE_LEN {
        return Err(crate::bad_internal!(
            "encrypted credential is truncated".to_string()
        ));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = cipher(encryption_key)?;
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| crate::bad_internal!("failed to decrypt credential".to_string()))?;
    String::from_utf8(plaintext)
        .map_err(|_| crate::bad_internal!("decrypted credential was not valid utf8".to_string()))
}

/// Store (or replace) a user's Booru credentials, encrypting the token at rest
#[instrument(name = "backends::users::upsert_booru_credentials", skip(token, shared), err(Debug))]
pub async fn upsert_booru_credentials(
    owner: &str,
    base_url: &str,
    username: &str,
    token: &str,
    shared: &Shared,
) -> Result<(), ApiError> {
    let encrypted = encrypt(token, &shared.config.encryption_key)?;
    sqlx::query(
        "INSERT INTO booru_credentials (owner, base_url, username, encrypted_token, updated_at)
         VALUES ($1, $2, $3, $4, now())
         ON CONFLICT (owner) DO UPDATE SET
            base_url = $2, username = $3, encrypted_token = $4, updated_at = now()",
    )
    .bind(owner)
    .bind(base_url)
    .bind(username)
    .bind(encrypted)
    .execute(&shared.db)
    .await?;
    Ok(())
}

/// Store (or replace) a user's credential for one site handler
#[instrument(name = "backends::users::upsert_site_credentials", skip(secret, shared), err(Debug))]
pub async fn upsert_site_credentials(
    owner: &str,
    site: &str,
    secret: &str,
    shared: &Shared,
) -> Result<(), ApiError> {
    let encrypted = encrypt(secret, &shared.config.encryption_key)?;
    sqlx::query(
        "INSERT INTO site_credentials (owner, site, encrypted_secret, updated_at)
         VALUES ($1, $2, $3, now())
         ON CONFLICT (owner, site) DO UPDATE SET
            encrypted_secret = $3, updated_at = now()",
    )
    .bind(owner)
    .bind(site)
    .bind(encrypted)
    .execute(&shared.db)
    .await?;
    Ok(())
}

/// Load and decrypt the full credential bundle a job needs: the owner's Booru account plus
/// every site secret they've configured (spec §3 `UserConfig`, loaded once at job start)
#[instrument(name = "backends::users::load", skip(shared), err(Debug))]
pub async fn load(owner: &str, shared: &Shared) -> Result<UserConfig, ApiError> {
    let booru_row = sqlx::query_as::<_, BooruCredentials>(
        "SELECT owner, base_url, username, encrypted_token, updated_at
         FROM booru_credentials WHERE owner = $1",
    )
    .bind(owner)
    .fetch_optional(&shared.db)
    .await?
    .ok_or_else(|| crate::bad_internal!(format!("no booru credentials configured for {owner}")))?;
    let token = decrypt(&booru_row.encrypted_token, &shared.config.encryption_key)?;
    let booru = BooruCreds {
        base_url: booru_row.base_url,
        username: booru_row.username,
        token,
    };
    let site_rows = sqlx::query_as::<_, SiteCredentials>(
        "SELECT owner, site, encrypted_secret, updated_at FROM site_credentials WHERE owner = $1",
    )
    .bind(owner)
    .fetch_all(&shared.db)
    .await?;
    let mut site_secrets = HashMap::with_capacity(site_rows.len());
    for row in site_rows {
        let secret = decrypt(&row.encrypted_secret, &shared.config.encryption_key)?;
        site_secrets.insert(row.site, secret);
    }
    Ok(UserConfig {
        owner: owner.to_string(),
        booru,
        site_secrets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_roundtrips() {
        let key = "01234567890123456789012345678901".chars().take(32).collect::<String>();
        let sealed = encrypt("super-secret-token", &key).unwrap();
        assert_eq!(decrypt(&sealed, &key).unwrap(), "super-secret-token");
    }

    #[test]
    fn decrypt_rejects_wrong_key() {
        let key_a = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string();
        let key_b = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".to_string();
        let sealed = encrypt("super-secret-token", &key_a).unwrap();
        assert!(decrypt(&sealed, &key_b).is_err());
    }
}
