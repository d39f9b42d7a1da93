//! Twitter/X delivery
//!
//! REST calls signed with OAuth 1.0a (HMAC-SHA1). A tweet is capped at 280
//! characters; a direct message (when `dm_recipient_id` is configured) at
//! 10000.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Deserialize;
use sha1::Sha1;

use super::{AlertPayload, render_message};
use crate::notify::channels::truncate_chars;

const TWEET_MAX_CHARS: usize = 280;
const DM_MAX_CHARS: usize = 10_000;

/// RFC 5849 §3.6: everything but unreserved characters is encoded
const OAUTH_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Deserialize)]
struct TwitterConfig {
    consumer_key: String,
    #[serde(alias = "consumerSecret")]
    consumer_secret: String,
    access_token: String,
    #[serde(alias = "accessTokenSecret")]
    access_token_secret: String,
    #[serde(default)]
    dm_recipient_id: Option<String>,
}

pub async fn send(
    client: &reqwest::Client,
    config: &serde_json::Value,
    payload: &AlertPayload,
) -> anyhow::Result<u16> {
    let config: TwitterConfig = serde_json::from_value(config.clone())
        .map_err(|e| anyhow::anyhow!("incomplete twitter config: {e}"))?;

    let message = render_message(payload);

    let (url, body) = match &config.dm_recipient_id {
        Some(recipient) => (
            format!("https://api.twitter.com/2/dm_conversations/with/{recipient}/messages"),
            serde_json::json!({ "text": truncate_chars(&message, DM_MAX_CHARS) }),
        ),
        None => (
            "https://api.twitter.com/2/tweets".to_string(),
            serde_json::json!({ "text": truncate_chars(&message, TWEET_MAX_CHARS) }),
        ),
    };

    let authorization = authorization_header(
        "POST",
        &url,
        &config,
        chrono::Utc::now().timestamp(),
        &nonce(),
    );

    let response = client
        .post(&url)
        .header("Authorization", authorization)
        .json(&body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("twitter API returned {status}");
    }
    Ok(status.as_u16())
}

fn nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

fn encode(value: &str) -> String {
    utf8_percent_encode(value, OAUTH_ENCODE).to_string()
}

/// Build the `Authorization: OAuth ...` header for a JSON-body request.
/// JSON bodies are excluded from the signature base; only form-encoded
/// parameters would be signed.
fn authorization_header(
    method: &str,
    url: &str,
    config: &TwitterConfig,
    timestamp: i64,
    nonce: &str,
) -> String {
    let timestamp = timestamp.to_string();
    let mut params: Vec<(&str, &str)> = vec![
        ("oauth_consumer_key", &config.consumer_key),
        ("oauth_nonce", nonce),
        ("oauth_signature_method", "HMAC-SHA1"),
        ("oauth_timestamp", &timestamp),
        ("oauth_token", &config.access_token),
        ("oauth_version", "1.0"),
    ];
    params.sort();

    let parameter_string = params
        .iter()
        .map(|(key, value)| format!("{}={}", encode(key), encode(value)))
        .collect::<Vec<_>>()
        .join("&");

    let base_string = format!(
        "{}&{}&{}",
        method.to_uppercase(),
        encode(url),
        encode(&parameter_string)
    );
    let signing_key = format!(
        "{}&{}",
        encode(&config.consumer_secret),
        encode(&config.access_token_secret)
    );

    let mut mac = Hmac::<Sha1>::new_from_slice(signing_key.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(base_string.as_bytes());
    let signature = BASE64.encode(mac.finalize().into_bytes());

    let mut header_params: Vec<(String, String)> = params
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    header_params.push(("oauth_signature".to_string(), signature));
    header_params.sort();

    format!(
        "OAuth {}",
        header_params
            .iter()
            .map(|(key, value)| format!("{}=\"{}\"", encode(key), encode(value)))
            .collect::<Vec<_>>()
            .join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TwitterConfig {
        TwitterConfig {
            consumer_key: "ck".to_string(),
            consumer_secret: "cs".to_string(),
            access_token: "at".to_string(),
            access_token_secret: "ats".to_string(),
            dm_recipient_id: None,
        }
    }

    #[test]
    fn test_percent_encoding_is_oauth_safe() {
        assert_eq!(encode("a b+c"), "a%20b%2Bc");
        assert_eq!(encode("ok-._~"), "ok-._~");
    }

    #[test]
    fn test_header_is_deterministic_and_signed() {
        let a = authorization_header(
            "POST",
            "https://api.twitter.com/2/tweets",
            &config(),
            1_700_000_000,
            "fixednonce",
        );
        let b = authorization_header(
            "POST",
            "https://api.twitter.com/2/tweets",
            &config(),
            1_700_000_000,
            "fixednonce",
        );
        assert_eq!(a, b);
        assert!(a.starts_with("OAuth "));
        assert!(a.contains("oauth_signature=\""));
        assert!(a.contains("oauth_consumer_key=\"ck\""));
    }
}
