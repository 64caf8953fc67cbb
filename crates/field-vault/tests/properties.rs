//! Property tests for key derivation and the field cipher.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use field_vault::crypto::{self, CipherError, EncryptedToken};
use field_vault::derivation::{KeyDerivationService, TenantKey};
use field_vault::secret::StaticSecretSource;
use proptest::prelude::*;

fn deriver(root: &[u8]) -> KeyDerivationService {
    KeyDerivationService::new(
        Arc::new(StaticSecretSource::new(root.to_vec())),
        Duration::from_secs(2),
        1,
    )
}

fn key(tenant: &str) -> TenantKey {
    deriver(&[0x42; 32]).derive(tenant, 1).unwrap()
}

fn tenant_id() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_.-]{1,40}"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn derivation_is_deterministic(tenant in tenant_id(), version in 1u32..1_000) {
        let a = deriver(&[7; 32]).derive(&tenant, version).unwrap();
        let b = deriver(&[7; 32]).derive(&tenant, version).unwrap();
        prop_assert_eq!(a.key_id(), b.key_id());
    }

    #[test]
    fn tenants_are_isolated(a in tenant_id(), b in tenant_id(), text in ".{0,64}") {
        prop_assume!(a != b);
        let service = deriver(&[9; 32]);
        let key_a = service.derive(&a, 1).unwrap();
        let key_b = service.derive(&b, 1).unwrap();
        prop_assert_ne!(key_a.key_id(), key_b.key_id());

        let token = crypto::seal(&key_a, &text).unwrap();
        let stolen = EncryptedToken::parse(&token.to_token_string(), &b, 1).unwrap();
        prop_assert_eq!(crypto::open(&key_b, &stolen), Err(CipherError::DecryptionFailed));
        prop_assert_eq!(
            crypto::open_text(&key_b, &token.to_token_string()),
            Err(CipherError::DecryptionFailed)
        );
    }

    #[test]
    fn versions_are_isolated(tenant in tenant_id(), v in 1u32..100) {
        let service = deriver(&[3; 32]);
        let old = service.derive(&tenant, v).unwrap();
        let new = service.derive(&tenant, v + 1).unwrap();
        prop_assert_ne!(old.key_id(), new.key_id());
        let token = crypto::seal(&old, "value").unwrap();
        prop_assert_eq!(
            crypto::open_text(&new, &token.to_token_string()),
            Err(CipherError::DecryptionFailed)
        );
    }

    #[test]
    fn round_trip_any_text(text in any::<String>()) {
        let key = key("acme");
        let token = crypto::seal(&key, &text).unwrap();
        prop_assert_eq!(crypto::open_text(&key, &token.to_token_string()).unwrap(), text);
    }

    #[test]
    fn single_bit_tamper_is_detected(text in ".{0,32}", bit in 0usize..1_024, in_nonce in any::<bool>()) {
        let key = key("acme");
        let mut token = crypto::seal(&key, &text).unwrap();
        if in_nonce {
            let bit = bit % (token.nonce.len() * 8);
            token.nonce[bit / 8] ^= 1 << (bit % 8);
        } else {
            let bit = bit % (token.ciphertext.len() * 8);
            token.ciphertext[bit / 8] ^= 1 << (bit % 8);
        }
        prop_assert_eq!(crypto::open(&key, &token), Err(CipherError::DecryptionFailed));
    }
}

#[test]
fn edge_case_plaintexts_round_trip() {
    let key = key("acme");
    for text in ["", "Mario Rossi", "Zoë Ångström 日本語 🔐", "tab\tnul\0bell\u{7}", "a:b:c"] {
        let token = crypto::seal(&key, text).unwrap();
        assert_eq!(crypto::open_text(&key, &token.to_token_string()).unwrap(), text);
    }
}

#[test]
fn nonces_never_repeat() {
    let key = key("acme");
    let mut seen = HashSet::new();
    for _ in 0..10_000 {
        let token = crypto::seal(&key, "same plaintext").unwrap();
        assert!(seen.insert(token.nonce), "nonce reused");
    }
}

#[test]
fn same_plaintext_gives_different_tokens() {
    let key = key("acme");
    let a = crypto::seal(&key, "Mario Rossi").unwrap();
    let b = crypto::seal(&key, "Mario Rossi").unwrap();
    assert_ne!(a.to_token_string(), b.to_token_string());
}
