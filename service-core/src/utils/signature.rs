//! OAuth 1.0 request signing (RFC 5849, two-legged flow).
//!
//! Used to verify LTI launch requests, which are plain form posts signed with
//! the consumer's shared secret and no token secret.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use std::str::FromStr;
use subtle::ConstantTimeEq;
use thiserror::Error;
use url::Url;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// Name of the parameter carrying the signature. Never part of the base string.
pub const SIGNATURE_PARAM: &str = "oauth_signature";

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("invalid request url: {0}")]
    InvalidUrl(String),

    #[error("unsupported signature method: {0}")]
    UnsupportedMethod(String),

    #[error("invalid signing key: {0}")]
    InvalidKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureMethod {
    HmacSha1,
    HmacSha256,
}

impl SignatureMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureMethod::HmacSha1 => "HMAC-SHA1",
            SignatureMethod::HmacSha256 => "HMAC-SHA256",
        }
    }
}

impl FromStr for SignatureMethod {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HMAC-SHA1" => Ok(SignatureMethod::HmacSha1),
            "HMAC-SHA256" => Ok(SignatureMethod::HmacSha256),
            other => Err(SignatureError::UnsupportedMethod(other.to_string())),
        }
    }
}

/// RFC 3986 percent-encoding: only unreserved characters pass through.
pub fn percent_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Base string URI: lower-case scheme and host, default port dropped,
/// no query or fragment.
pub fn normalize_url(raw: &str) -> Result<String, SignatureError> {
    let url = Url::parse(raw).map_err(|e| SignatureError::InvalidUrl(e.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| SignatureError::InvalidUrl(format!("missing host in {}", raw)))?
        .to_ascii_lowercase();

    // `Url::port` is None when the port is the scheme default.
    let authority = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    };

    Ok(format!("{}://{}{}", url.scheme(), authority, url.path()))
}

/// Build the signature base string for a request.
///
/// Query parameters of `url` are merged with `params`. Every pair except
/// `oauth_signature` is encoded, then sorted by name and value.
pub fn base_string(
    method: &str,
    url: &str,
    params: &[(String, String)],
) -> Result<String, SignatureError> {
    let parsed = Url::parse(url).map_err(|e| SignatureError::InvalidUrl(e.to_string()))?;

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .chain(params.iter().cloned())
        .filter(|(k, _)| k != SIGNATURE_PARAM)
        .map(|(k, v)| (percent_encode(&k), percent_encode(&v)))
        .collect();
    pairs.sort();

    let normalized_params = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    Ok(format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        percent_encode(&normalize_url(url)?),
        percent_encode(&normalized_params)
    ))
}

/// Sign a base string. The key is `encode(consumer_secret)&encode(token_secret)`;
/// launches carry no token so the second half is usually empty.
pub fn sign(
    method: SignatureMethod,
    consumer_secret: &str,
    token_secret: Option<&str>,
    base: &str,
) -> Result<String, SignatureError> {
    let key = format!(
        "{}&{}",
        percent_encode(consumer_secret),
        percent_encode(token_secret.unwrap_or(""))
    );

    let digest = match method {
        SignatureMethod::HmacSha1 => {
            let mut mac = HmacSha1::new_from_slice(key.as_bytes())
                .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
            mac.update(base.as_bytes());
            mac.finalize().into_bytes().to_vec()
        }
        SignatureMethod::HmacSha256 => {
            let mut mac = HmacSha256::new_from_slice(key.as_bytes())
                .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
            mac.update(base.as_bytes());
            mac.finalize().into_bytes().to_vec()
        }
    };

    Ok(STANDARD.encode(digest))
}

/// Verify a signature using constant-time comparison
pub fn verify(
    method: SignatureMethod,
    consumer_secret: &str,
    token_secret: Option<&str>,
    base: &str,
    signature: &str,
) -> Result<bool, SignatureError> {
    let expected = sign(method, consumer_secret, token_secret, base)?;

    let expected_bytes = expected.as_bytes();
    let signature_bytes = signature.as_bytes();

    if expected_bytes.len() != signature_bytes.len() {
        return Ok(false);
    }

    Ok(expected_bytes.ct_eq(signature_bytes).into())
}

/// Compute the `oauth_signature` value for a complete request.
pub fn sign_request(
    method: SignatureMethod,
    http_method: &str,
    url: &str,
    params: &[(String, String)],
    consumer_secret: &str,
) -> Result<String, SignatureError> {
    let base = base_string(http_method, url, params)?;
    sign(method, consumer_secret, None, &base)
}
