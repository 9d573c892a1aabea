// tests/property/signature_test.rs

//! Signature envelope properties: every correctly signed request verifies,
//! and mutating any single canonical field breaks verification.

use opalstore::core::OpalError;
use opalstore::core::cluster::rpc::{NonceCache, sign_request, verify_request};
use proptest::prelude::*;
use std::time::Duration;

const SKEW: Duration = Duration::from_secs(300);

fn token_strategy() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_-]{16,64}"
}

proptest! {
    #[test]
    fn signed_requests_always_verify(
        token in token_strategy(),
        node_id in "[a-z0-9-]{4,32}",
        path in "/[a-z0-9/_-]{0,40}",
        body in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let nonces = NonceCache::new(SKEW);
        let headers = sign_request(&token, &node_id, "POST", &path, &body).unwrap();
        verify_request(&token, &nonces, SKEW, true, "POST", &path, &body, &headers).unwrap();
    }

    #[test]
    fn any_field_mutation_breaks_verification(
        token in token_strategy(),
        node_id in "[a-z0-9-]{4,32}",
        path in "/[a-z0-9/_-]{0,40}",
        body in proptest::collection::vec(any::<u8>(), 1..256),
        mutation in 0usize..4,
    ) {
        let nonces = NonceCache::new(SKEW);
        let mut headers = sign_request(&token, &node_id, "POST", &path, &body).unwrap();

        let (method, path, body) = match mutation {
            // Different HTTP method.
            0 => ("GET", path.clone(), body.clone()),
            // Different path.
            1 => ("POST", format!("{path}/x"), body.clone()),
            // One flipped body byte.
            2 => {
                let mut mutated = body.clone();
                mutated[0] ^= 0xff;
                ("POST", path.clone(), mutated)
            }
            // Claimed node id changed.
            _ => {
                headers.node_id = format!("{node_id}-evil");
                ("POST", path.clone(), body.clone())
            }
        };

        let result = verify_request(&token, &nonces, SKEW, true, method, &path, &body, &headers);
        prop_assert!(matches!(result, Err(OpalError::Unauthorized(_))));
    }

    #[test]
    fn wrong_token_never_verifies(
        token in token_strategy(),
        other_token in token_strategy(),
        body in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        prop_assume!(token != other_token);
        let nonces = NonceCache::new(SKEW);
        let headers = sign_request(&token, "node-a", "POST", "/p", &body).unwrap();
        let result =
            verify_request(&other_token, &nonces, SKEW, true, "POST", "/p", &body, &headers);
        prop_assert!(matches!(result, Err(OpalError::Unauthorized(_))));
    }
}
