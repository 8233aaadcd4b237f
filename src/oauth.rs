//! OAuth 1.0a request signing (RFC 5849 §3.4, HMAC-SHA1, two-legged).
//!
//! The same base-string construction serves both directions: signing outbound
//! launches and re-deriving signatures on inbound outcomes callbacks.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha1::{Digest, Sha1};
use uuid::Uuid;

use crate::error::{HarnessError, HarnessResult};
use crate::models::ParamMap;

type HmacSha1 = Hmac<Sha1>;

pub const SIGNATURE_METHOD: &str = "HMAC-SHA1";
pub const OAUTH_VERSION: &str = "1.0";
pub const OAUTH_CALLBACK: &str = "about:blank";

/// RFC 3986 unreserved characters stay literal; everything else is escaped.
const RFC3986: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Parameters the signer owns. Callers must not pre-populate them.
const GENERATED: &[&str] = &[
    "oauth_consumer_key",
    "oauth_signature_method",
    "oauth_timestamp",
    "oauth_nonce",
    "oauth_version",
    "oauth_callback",
    "oauth_signature",
];

pub fn encode(s: &str) -> String {
    utf8_percent_encode(s, RFC3986).to_string()
}

pub fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// Splits an endpoint into its base-string URI and any query parameters.
///
/// Scheme and host are lowercased, default ports dropped, query and fragment
/// removed from the URI. Query pairs are returned decoded so they can join the
/// normalized parameter set.
pub fn normalize_url(raw: &str) -> HarnessResult<(String, Vec<(String, String)>)> {
    let url = url::Url::parse(raw.trim())
        .map_err(|e| HarnessError::Signing(format!("invalid endpoint URL {raw}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(HarnessError::Signing(format!(
            "endpoint URL must be http(s): {raw}"
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| HarnessError::Signing(format!("endpoint URL has no host: {raw}")))?;

    // Url::port() is None when the port is the scheme default.
    let base = match url.port() {
        Some(port) => format!("{}://{}:{}{}", url.scheme(), host.to_ascii_lowercase(), port, url.path()),
        None => format!("{}://{}{}", url.scheme(), host.to_ascii_lowercase(), url.path()),
    };
    let query = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    Ok((base, query))
}

/// Encodes, sorts by name then value, and joins as `name=value&...`.
/// `oauth_signature` is always excluded.
pub fn normalized_params<'a, I>(params: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut encoded: Vec<(String, String)> = params
        .into_iter()
        .filter(|(k, _)| *k != "oauth_signature")
        .map(|(k, v)| (encode(k), encode(v)))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

pub fn signature_base_string(
    method: &str,
    url: &str,
    params: &[(String, String)],
) -> HarnessResult<String> {
    let (base_uri, query) = normalize_url(url)?;
    let normalized = normalized_params(
        params
            .iter()
            .chain(query.iter())
            .map(|(k, v)| (k.as_str(), v.as_str())),
    );
    Ok(format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        encode(&base_uri),
        encode(&normalized)
    ))
}

/// Token secret is empty for two-legged OAuth.
pub fn signing_key(consumer_secret: &str) -> String {
    format!("{}&", encode(consumer_secret))
}

fn mac_for(key: &str, base: &str) -> HarnessResult<HmacSha1> {
    let mut mac = HmacSha1::new_from_slice(key.as_bytes())
        .map_err(|e| HarnessError::Signing(format!("hmac key rejected: {e}")))?;
    mac.update(base.as_bytes());
    Ok(mac)
}

fn hmac_sha1_base64(key: &str, base: &str) -> HarnessResult<String> {
    let mac = mac_for(key, base)?;
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// `oauth_body_hash` value for a request body.
pub fn body_hash(body: &[u8]) -> String {
    BASE64.encode(Sha1::digest(body))
}

#[derive(Debug, Clone, Copy)]
pub struct Credentials<'a> {
    pub consumer_key: &'a str,
    pub consumer_secret: &'a str,
}

#[derive(Debug, Clone)]
pub struct SignedRequest {
    /// Input parameters plus every OAuth field, `oauth_signature` included.
    pub params: ParamMap,
    pub signature: String,
    pub nonce: String,
    pub timestamp: String,
}

pub fn fresh_nonce() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn current_timestamp() -> HarnessResult<String> {
    let now = Utc::now().timestamp();
    if now <= 0 {
        return Err(HarnessError::Signing(format!("system clock unavailable ({now})")));
    }
    Ok(now.to_string())
}

/// Signs with a freshly generated nonce and the current timestamp.
pub fn sign(
    method: &str,
    url: &str,
    params: &ParamMap,
    creds: Credentials<'_>,
) -> HarnessResult<SignedRequest> {
    let timestamp = current_timestamp()?;
    sign_with(method, url, params, creds, &fresh_nonce(), &timestamp)
}

/// Deterministic signing: identical inputs produce an identical signature.
pub fn sign_with(
    method: &str,
    url: &str,
    params: &ParamMap,
    creds: Credentials<'_>,
    nonce: &str,
    timestamp: &str,
) -> HarnessResult<SignedRequest> {
    if let Some(taken) = GENERATED.iter().find(|k| params.contains_key(**k)) {
        return Err(HarnessError::Signing(format!(
            "parameter set already contains {taken}"
        )));
    }
    if creds.consumer_key.is_empty() {
        return Err(HarnessError::Signing("empty consumer key".into()));
    }

    let mut full = params.clone();
    full.insert("oauth_consumer_key".into(), creds.consumer_key.to_string());
    full.insert("oauth_signature_method".into(), SIGNATURE_METHOD.into());
    full.insert("oauth_timestamp".into(), timestamp.to_string());
    full.insert("oauth_nonce".into(), nonce.to_string());
    full.insert("oauth_version".into(), OAUTH_VERSION.into());
    full.insert("oauth_callback".into(), OAUTH_CALLBACK.into());

    let pairs: Vec<(String, String)> = full.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    let base = signature_base_string(method, url, &pairs)?;
    tracing::debug!(
        consumer_key = creds.consumer_key,
        timestamp,
        nonce,
        url,
        "signing request"
    );
    tracing::trace!(base_string = %base, "signature base string");

    let signature = hmac_sha1_base64(&signing_key(creds.consumer_secret), &base)?;
    full.insert("oauth_signature".into(), signature.clone());

    Ok(SignedRequest {
        params: full,
        signature,
        nonce: nonce.to_string(),
        timestamp: timestamp.to_string(),
    })
}

fn single<'a>(params: &'a [(String, String)], name: &str) -> HarnessResult<&'a str> {
    let mut found = params.iter().filter(|(k, _)| k == name);
    match (found.next(), found.next()) {
        (Some((_, v)), None) => Ok(v.as_str()),
        (None, _) => Err(HarnessError::Authentication(format!("missing {name}"))),
        (Some(_), Some(_)) => Err(HarnessError::Authentication(format!("duplicate {name}"))),
    }
}

/// Re-derives the signature over `params` (which carry `oauth_signature`) and
/// compares it with the presented one in constant time.
pub fn verify(
    method: &str,
    url: &str,
    params: &[(String, String)],
    consumer_secret: &str,
) -> HarnessResult<()> {
    let presented = single(params, "oauth_signature")?;
    let method_param = single(params, "oauth_signature_method")?;
    if method_param != SIGNATURE_METHOD {
        return Err(HarnessError::Authentication(format!(
            "unsupported signature method {method_param}"
        )));
    }
    single(params, "oauth_consumer_key")?;
    single(params, "oauth_timestamp")?;
    single(params, "oauth_nonce")?;
    if let Some((_, version)) = params.iter().find(|(k, _)| k == "oauth_version") {
        if version != OAUTH_VERSION {
            return Err(HarnessError::Authentication(format!(
                "unsupported oauth_version {version}"
            )));
        }
    }

    let base = signature_base_string(method, url, params)?;
    tracing::trace!(base_string = %base, "verification base string");

    let presented = BASE64
        .decode(presented.as_bytes())
        .map_err(|_| HarnessError::Authentication("oauth_signature is not base64".into()))?;
    mac_for(&signing_key(consumer_secret), &base)?
        .verify_slice(&presented)
        .map_err(|_| HarnessError::Authentication("signature mismatch".into()))
}

/// Parses `Authorization: OAuth k="v", ...`. `realm` is dropped.
pub fn parse_authorization_header(value: &str) -> HarnessResult<Vec<(String, String)>> {
    let value = value.trim();
    let rest = match value.get(..5) {
        Some(scheme) if scheme.eq_ignore_ascii_case("oauth") => &value[5..],
        _ => {
            return Err(HarnessError::Authentication(
                "authorization scheme is not OAuth".into(),
            ))
        }
    };

    let mut out = Vec::new();
    for part in rest.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (k, v) = part.split_once('=').ok_or_else(|| {
            HarnessError::Authentication(format!("malformed authorization parameter: {part}"))
        })?;
        let k = decode(k.trim());
        let v = v.trim();
        let v = v
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(v);
        if k == "realm" {
            continue;
        }
        out.push((k, decode(v)));
    }
    Ok(out)
}

/// Renders the `oauth_*` entries of a signed parameter set as a header value.
pub fn authorization_header(params: &ParamMap) -> String {
    let fields: Vec<String> = params
        .iter()
        .filter(|(k, _)| k.starts_with("oauth_"))
        .map(|(k, v)| format!("{}=\"{}\"", encode(k), encode(v)))
        .collect();
    format!("OAuth {}", fields.join(", "))
}
