// ABOUTME: Continuation token codec: URL-safe base64 of a since-column timestamp
// ABOUTME: Tokens are parsed back into timestamps so they never reach SQL verbatim

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use chrono::NaiveDateTime;

use crate::error::{LayerError, Result};

/// Timestamp layout inside a token
pub const TOKEN_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

pub fn encode_token(since: &NaiveDateTime) -> String {
    URL_SAFE.encode(since.format(TOKEN_FORMAT).to_string())
}

/// Decode a token issued by `encode_token`.
///
/// Malformed base64, non-UTF-8 payloads and payloads that are not a
/// timestamp all fail with a decode error.
pub fn decode_token(token: &str) -> Result<NaiveDateTime> {
    let bytes = URL_SAFE
        .decode(token.trim())
        .map_err(|e| LayerError::decode(format!("invalid continuation token '{}'", token), e))?;
    let text = String::from_utf8(bytes)
        .map_err(|e| LayerError::decode("continuation token is not valid UTF-8", e))?;
    NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f")
        .map_err(|e| LayerError::decode(format!("continuation token holds '{}', not a timestamp", text), e))
}

/// Render a since-bound as a SQL literal, always with microseconds.
pub fn since_literal(since: &NaiveDateTime) -> String {
    format!("'{}'", since.format(TOKEN_FORMAT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::NaiveDate;

    fn ts(micro: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_micro_opt(12, 30, 5, micro)
            .unwrap()
    }

    #[test]
    fn test_token_round_trip_is_stable() {
        let token = encode_token(&ts(123_456));
        let decoded = decode_token(&token).unwrap();
        assert_eq!(decoded, ts(123_456));
        assert_eq!(encode_token(&decoded), token);
    }

    #[test]
    fn test_token_is_url_safe_base64_of_timestamp() {
        let token = encode_token(&ts(0));
        let raw = URL_SAFE.decode(&token).unwrap();
        assert_eq!(String::from_utf8(raw).unwrap(), "2024-03-01 12:30:05.000000");
    }

    #[test]
    fn test_malformed_tokens_are_decode_errors() {
        let bad_tokens = vec![
            "%%%not-base64".to_string(),
            URL_SAFE.encode("yesterday"),
            URL_SAFE.encode("1' OR '1'='1"),
        ];
        for bad in &bad_tokens {
            let err = decode_token(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Decode, "token {}", bad);
        }
    }

    #[test]
    fn test_since_literal() {
        assert_eq!(since_literal(&ts(42)), "'2024-03-01 12:30:05.000042'");
    }
}
