//! Best-effort JWT payload inspection.
//!
//! The verifier never validates signatures; it only decodes the payload
//! segment of a token found in the cookie jar so the report can show which
//! identity the app stored. Informational only: a missing or undecodable
//! token never gates the run verdict.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;

use crate::http::cookies::CookieJar;

/// Whether a value is shaped like a signed JWT: three non-empty
/// base64url segments.
pub fn looks_like_jwt(value: &str) -> bool {
    let segments: Vec<&str> = value.split('.').collect();
    segments.len() == 3
        && segments.iter().all(|s| {
            !s.is_empty()
                && s.bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'=')
        })
}

/// Base64url-decode the payload segment, padding to a multiple of 4 with
/// `=`, and parse it as JSON claims.
pub fn decode_payload(token: &str) -> Option<serde_json::Value> {
    let payload = token.split('.').nth(1)?;
    let mut padded = payload.trim_end_matches('=').to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    let bytes = URL_SAFE.decode(padded).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// First JWT-shaped cookie value in the jar, with its cookie name.
pub fn find_jwt_cookie(jar: &CookieJar) -> Option<(String, String)> {
    jar.iter()
        .find(|c| looks_like_jwt(&c.value))
        .map(|c| (c.name.clone(), c.value.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn token_for(claims: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims);
        format!("{}.{}.signature", header, payload)
    }

    #[test]
    fn test_decode_round_trip() {
        let token = token_for(r#"{"sub":"x"}"#);
        let claims = decode_payload(&token).unwrap();
        assert_eq!(claims["sub"], "x");
    }

    #[test]
    fn test_decode_handles_all_padding_lengths() {
        // Claim bodies chosen so the encoded payload length mod 4 varies
        for claims in [
            r#"{"sub":"x"}"#,
            r#"{"sub":"xy"}"#,
            r#"{"sub":"xyz"}"#,
            r#"{"sub":"xyzw"}"#,
        ] {
            let token = token_for(claims);
            let decoded = decode_payload(&token).unwrap();
            let expected: serde_json::Value = serde_json::from_str(claims).unwrap();
            assert_eq!(decoded, expected);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_payload("not-a-token").is_none());
        assert!(decode_payload("a.!!!.c").is_none());
    }

    #[test]
    fn test_looks_like_jwt() {
        assert!(looks_like_jwt(&token_for(r#"{"sub":"x"}"#)));
        assert!(!looks_like_jwt("plain-session-id"));
        assert!(!looks_like_jwt("two.segments"));
        assert!(!looks_like_jwt("a..c"));
    }
}
