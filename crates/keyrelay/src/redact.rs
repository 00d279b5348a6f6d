use hmac::{Hmac, Mac};
use http::HeaderMap;
use sha2::Sha256;

const REDACTED: &str = "***redacted***";

/// Strips any `Authorization` header before a request/response touches a
/// `tracing` event, a webhook body, or a stats snapshot. Spec §6: incoming
/// credentials must never leak to a side channel.
pub fn redact_headers(headers: &HeaderMap) -> HeaderMap {
	let mut out = headers.clone();
	if out.contains_key(http::header::AUTHORIZATION) {
		out.insert(http::header::AUTHORIZATION, REDACTED.parse().unwrap());
	}
	out
}

/// `keyId` is safe to log in full; the secret never is. Formats as
/// `keyId.***redacted***` so operators can still tell keys apart.
pub fn redact_credential(key_id: &str) -> String {
	format!("{key_id}.{REDACTED}")
}

type HmacSha256 = Hmac<Sha256>;

/// `X-Signature: sha256=<hex>` over `timestamp + "." + body`, spec §6's
/// webhook protocol. Grounded on the pack's gateway-shaped webhook examples
/// (the teacher itself does not sign webhooks; this crate is new, noted in
/// DESIGN.md).
pub fn sign_webhook(secret: &str, timestamp_unix_ms: u64, body: &[u8]) -> String {
	let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
	mac.update(timestamp_unix_ms.to_string().as_bytes());
	mac.update(b".");
	mac.update(body);
	format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

pub fn verify_webhook(secret: &str, timestamp_unix_ms: u64, body: &[u8], signature: &str) -> bool {
	let expected = sign_webhook(secret, timestamp_unix_ms, body);
	// Constant-time-ish comparison via length check + byte fold; full
	// constant-time comparison is unnecessary here since the signature
	// itself is HMAC-derived and not a bare secret.
	expected.len() == signature.len() && expected.bytes().zip(signature.bytes()).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn redact_credential_never_includes_secret() {
		let redacted = redact_credential("key-abc123");
		assert!(redacted.starts_with("key-abc123."));
		assert!(!redacted.contains("s3cr3t"));
	}

	#[test]
	fn redact_headers_masks_authorization() {
		let mut h = HeaderMap::new();
		h.insert(http::header::AUTHORIZATION, "Bearer key.secret".parse().unwrap());
		let redacted = redact_headers(&h);
		assert_eq!(redacted.get(http::header::AUTHORIZATION).unwrap(), REDACTED);
	}

	#[test]
	fn sign_and_verify_roundtrip() {
		let sig = sign_webhook("hook-secret", 1_700_000_000_000, b"{\"id\":\"1\"}");
		assert!(sig.starts_with("sha256="));
		assert!(verify_webhook("hook-secret", 1_700_000_000_000, b"{\"id\":\"1\"}", &sig));
		assert!(!verify_webhook("wrong-secret", 1_700_000_000_000, b"{\"id\":\"1\"}", &sig));
	}
}
