//! HMAC-SHA256 signatures used by the hosted gateway.
//!
//! Client confirmations are signed over `"{gateway_order_id}|{payment_id}"`
//! with the API key secret; webhook bodies are signed over the exact raw bytes
//! with the webhook secret. Both arrive hex encoded.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn keyed(secret: &str) -> HmacSha256 {
    HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size")
}

fn verify(mac: HmacSha256, supplied_hex: &str) -> bool {
    match hex::decode(supplied_hex.trim()) {
        Ok(bytes) => mac.verify_slice(&bytes).is_ok(),
        Err(_) => false,
    }
}

/// Hex signature the gateway hands the browser after a successful payment.
pub fn payment_signature(key_secret: &str, gateway_order_id: &str, payment_id: &str) -> String {
    let mut mac = keyed(key_secret);
    mac.update(gateway_order_id.as_bytes());
    mac.update(b"|");
    mac.update(payment_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify_payment_signature(
    key_secret: &str,
    gateway_order_id: &str,
    payment_id: &str,
    supplied_hex: &str,
) -> bool {
    let mut mac = keyed(key_secret);
    mac.update(gateway_order_id.as_bytes());
    mac.update(b"|");
    mac.update(payment_id.as_bytes());
    verify(mac, supplied_hex)
}

pub fn webhook_signature(webhook_secret: &str, raw_body: &[u8]) -> String {
    let mut mac = keyed(webhook_secret);
    mac.update(raw_body);
    hex::encode(mac.finalize().into_bytes())
}

/// Checks a webhook signature header against the raw request body.
pub fn verify_webhook_signature(webhook_secret: &str, raw_body: &[u8], header: &str) -> bool {
    let mut mac = keyed(webhook_secret);
    mac.update(raw_body);
    verify(mac, header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SECRET: &str = "key_secret_123";

    #[test]
    fn payment_signature_round_trips() {
        let sig = payment_signature(SECRET, "order_abc", "pay_xyz");
        assert_eq!(sig.len(), 64);
        assert!(verify_payment_signature(SECRET, "order_abc", "pay_xyz", &sig));
        assert!(!verify_payment_signature(SECRET, "order_abc", "pay_other", &sig));
        assert!(!verify_payment_signature("other_secret", "order_abc", "pay_xyz", &sig));
    }

    #[test]
    fn malformed_hex_is_a_mismatch() {
        assert!(!verify_payment_signature(SECRET, "order_abc", "pay_xyz", "not-hex"));
        assert!(!verify_webhook_signature(SECRET, b"{}", ""));
        assert!(!verify_webhook_signature(SECRET, b"{}", "abc"));
    }

    #[test]
    fn webhook_signature_covers_exact_bytes() {
        let body = br#"{"event":"payment.captured"}"#;
        let sig = webhook_signature(SECRET, body);
        assert!(verify_webhook_signature(SECRET, body, &sig));
        assert!(verify_webhook_signature(SECRET, body, &format!(" {sig}\n")));
        assert!(!verify_webhook_signature(
            SECRET,
            br#"{"event": "payment.captured"}"#,
            &sig
        ));
    }

    proptest! {
        #[test]
        fn any_single_byte_change_is_rejected(
            order in "order_[a-zA-Z0-9]{8,14}",
            payment in "pay_[a-zA-Z0-9]{8,14}",
            index in 0usize..64,
            replacement in "[0-9a-f]",
        ) {
            let sig = payment_signature(SECRET, &order, &payment);
            let mut tampered: Vec<char> = sig.chars().collect();
            let replacement = replacement.chars().next().unwrap();
            prop_assume!(tampered[index] != replacement);
            tampered[index] = replacement;
            let tampered: String = tampered.into_iter().collect();

            prop_assert!(!verify_payment_signature(SECRET, &order, &payment, &tampered));
        }

        #[test]
        fn webhook_body_tampering_is_rejected(body in proptest::collection::vec(any::<u8>(), 1..256), index in any::<prop::sample::Index>()) {
            let sig = webhook_signature(SECRET, &body);
            let mut tampered = body.clone();
            let i = index.index(tampered.len());
            tampered[i] ^= 0x01;
            prop_assert!(!verify_webhook_signature(SECRET, &tampered, &sig));
        }
    }
}
