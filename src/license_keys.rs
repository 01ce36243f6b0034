// src/license_keys.rs

use rand::Rng;
use rand::rngs::OsRng;
use sqlx::PgPool;
use std::fmt;

/// Key alphabet with visually ambiguous characters (0/O, 1/I/L) removed.
const KEY_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

const KEY_GROUPS: usize = 4;
const KEY_GROUP_LEN: usize = 4;

/// How many candidate keys to try against the store before giving up.
const MAX_GENERATION_ATTEMPTS: usize = 50;

/// No unique key found within the attempt budget. Indicates store
/// exhaustion rather than bad luck; callers fail fast instead of retrying.
#[derive(Debug)]
pub struct KeyGenerationExhausted;

impl fmt::Display for KeyGenerationExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no unique license key found within {MAX_GENERATION_ATTEMPTS} attempts"
        )
    }
}

impl std::error::Error for KeyGenerationExhausted {}

/// A single random candidate in `KEY-XXXX-XXXX-XXXX-XXXX` form.
pub fn random_license_key() -> String {
    let mut rng = OsRng;
    let mut key = String::with_capacity(4 + KEY_GROUPS * (KEY_GROUP_LEN + 1));
    key.push_str("KEY");
    for _ in 0..KEY_GROUPS {
        key.push('-');
        for _ in 0..KEY_GROUP_LEN {
            let idx = rng.gen_range(0..KEY_ALPHABET.len());
            key.push(KEY_ALPHABET[idx] as char);
        }
    }
    key
}

/// Generate a key that does not collide with any stored license.
///
/// If the license store is unavailable the candidate is returned unchecked:
/// issuing a key whose uniqueness was not verified beats refusing to
/// provision, and collisions are astronomically rare for this keyspace.
pub async fn generate_unique_license_key(
    pool: &PgPool,
) -> Result<String, KeyGenerationExhausted> {
    for _ in 0..MAX_GENERATION_ATTEMPTS {
        let candidate = random_license_key();
        match crate::db::license_key_exists(pool, &candidate).await {
            Ok(false) => return Ok(candidate),
            Ok(true) => continue,
            Err(e) => {
                log::warn!("license store unavailable, issuing unchecked key: {e}");
                return Ok(candidate);
            }
        }
    }
    Err(KeyGenerationExhausted)
}

/// Placeholder keys issued by the producer when the real key set is not yet
/// known: `L<n>` or `TEMP-<n>`. The processor swaps these for generated
/// keys before touching the payment provider.
pub fn is_temporary(key: &str) -> bool {
    if let Some(rest) = key.strip_prefix("TEMP-") {
        return !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit());
    }
    if let Some(rest) = key.strip_prefix('L') {
        return !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit());
    }
    false
}
