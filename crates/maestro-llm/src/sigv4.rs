//! Minimal AWS Signature Version 4 signing for the Bedrock runtime.
//!
//! Covers exactly what the Converse call needs: POST with a JSON body, the
//! `host` and `x-amz-date` signed headers, and an SHA-256 payload hash.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub struct SigningParams<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
    pub region: &'a str,
    pub service: &'a str,
    pub host: &'a str,
    /// Percent-encoded request path, exactly as sent on the wire.
    pub canonical_path: &'a str,
    pub body: &'a [u8],
    pub now: DateTime<Utc>,
}

pub struct SignedHeaders {
    pub amz_date: String,
    pub content_sha256: String,
    pub authorization: String,
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn sha256_hex(data: &[u8]) -> String {
    hex(&Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC-SHA256 accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Percent-encode one path segment per RFC 3986 (unreserved characters pass
/// through, everything else is `%XX`).
pub fn uri_encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

/// Produce the `x-amz-date`, `x-amz-content-sha256`, and `Authorization`
/// headers for a POST request.
pub fn sign(params: &SigningParams<'_>) -> SignedHeaders {
    let amz_date = params.now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = params.now.format("%Y%m%d").to_string();
    let content_sha256 = sha256_hex(params.body);

    let canonical_headers = format!("host:{}\nx-amz-date:{}\n", params.host, amz_date);
    let signed_headers = "host;x-amz-date";
    let canonical_request = format!(
        "POST\n{}\n\n{}\n{}\n{}",
        params.canonical_path, canonical_headers, signed_headers, content_sha256
    );

    let scope = format!(
        "{}/{}/{}/aws4_request",
        date_stamp, params.region, params.service
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let k_secret = format!("AWS4{}", params.secret_access_key);
    let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, params.region.as_bytes());
    let k_service = hmac_sha256(&k_region, params.service.as_bytes());
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    let signature = hex(&hmac_sha256(&k_signing, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        params.access_key_id, scope, signed_headers, signature
    );

    SignedHeaders {
        amz_date,
        content_sha256,
        authorization,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn params<'a>(secret: &'a str) -> SigningParams<'a> {
        SigningParams {
            access_key_id: "AKIDEXAMPLE",
            secret_access_key: secret,
            region: "us-east-1",
            service: "bedrock",
            host: "bedrock-runtime.us-east-1.amazonaws.com",
            canonical_path: "/model/anthropic.claude-3-haiku/converse",
            body: b"{\"messages\":[]}",
            now: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let secret = "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY";
        let a = sign(&params(secret));
        let b = sign(&params(secret));
        assert_eq!(a.authorization, b.authorization);
        assert_eq!(a.amz_date, "20250301T120000Z");
        assert_eq!(a.content_sha256.len(), 64);

        let signature = a
            .authorization
            .rsplit("Signature=")
            .next()
            .unwrap()
            .to_string();
        assert_eq!(signature.len(), 64);
        assert!(signature.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn different_secret_changes_signature() {
        let a = sign(&params("secret-one"));
        let b = sign(&params("secret-two"));
        assert_ne!(a.authorization, b.authorization);
    }

    #[test]
    fn authorization_carries_scope_and_headers() {
        let signed = sign(&params("s"));
        assert!(signed
            .authorization
            .contains("Credential=AKIDEXAMPLE/20250301/us-east-1/bedrock/aws4_request"));
        assert!(signed.authorization.contains("SignedHeaders=host;x-amz-date"));
    }

    #[test]
    fn segment_encoding() {
        assert_eq!(
            uri_encode_segment("anthropic.claude-3:0"),
            "anthropic.claude-3%3A0"
        );
        assert_eq!(uri_encode_segment("plain-id_1.x~y"), "plain-id_1.x~y");
    }
}
