//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per:
//! https://docs.joinmastodon.org/spec/security/
//!
//! Verification runs a fallback ladder (RSA-SHA256 prefixed/unprefixed,
//! then RSA-SHA1 in both forms) to stay interoperable with less strict
//! implementations in the wild. The ladder is confined to this module;
//! signing always uses RSA-SHA256.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256 or hs2019)
    pub algorithm: String,
    /// Signed header names
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    // Split by comma and parse key=value pairs
    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            // Remove quotes from value
            let value = value.trim().trim_matches('"');

            match key {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {} // Ignore unknown fields
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| AppError::Signature("Missing keyId".to_string()))?,
        algorithm: algorithm
            .ok_or_else(|| AppError::Signature("Missing algorithm".to_string()))?,
        headers: headers.ok_or_else(|| AppError::Signature("Missing headers".to_string()))?,
        signature: signature
            .ok_or_else(|| AppError::Signature("Missing signature".to_string()))?,
    })
}

/// Extract keyId from the Signature header without full verification.
pub fn extract_signature_key_id(headers: &http::HeaderMap) -> Result<String, AppError> {
    let signature_header = headers
        .get("signature")
        .ok_or_else(|| AppError::Signature("Missing Signature header".to_string()))?
        .to_str()
        .map_err(|_| AppError::Signature("Invalid Signature header".to_string()))?;

    let parsed = parse_signature_header(signature_header)?;
    Ok(parsed.key_id)
}

/// Whether the signature keyId belongs to the given actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    key_actor == actor
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Headers to add for a signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

/// Sign an HTTP request
///
/// Creates HTTP Signature headers for outgoing requests. The signed
/// header set is `(request-target) host date digest content-type` when a
/// body is present, mirroring what verification reconstructs.
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `body` - Request body (for digest)
/// * `private_key_pem` - RSA private key in PEM format
/// * `key_id` - Full URL to the public key (actor#main-key)
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    // 1. Parse URL to get host and path
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host = parsed_url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;
    // Non-default ports appear in the Host header the peer reconstructs.
    let host = match parsed_url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let path = parsed_url.path();
    let query = parsed_url.query();
    let path_and_query = if let Some(q) = query {
        format!("{}?{}", path, q)
    } else {
        path.to_string()
    };

    // 2. Generate Date header (RFC 2822 format)
    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();

    // 3. Generate Digest if body present
    let digest = body.map(generate_digest);

    // 4. Build signing string
    let request_target = format!("{} {}", method.to_lowercase(), path_and_query);

    let mut signing_parts = vec![
        format!("(request-target): {}", request_target),
        format!("host: {}", host),
        format!("date: {}", date),
    ];

    let mut headers_list = vec!["(request-target)", "host", "date"];

    if let Some(ref digest_value) = digest {
        signing_parts.push(format!("digest: {}", digest_value));
        headers_list.push("digest");
        signing_parts.push("content-type: application/activity+json".to_string());
        headers_list.push("content-type");
    }

    let signing_string = signing_parts.join("\n");

    // 5. Sign with RSA-SHA256
    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| AppError::Validation(format!("Invalid private key: {}", e)))?;

    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    let signature_b64 = BASE64.encode(signature.to_bytes());

    // 6. Build Signature header
    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        headers_list.join(" "),
        signature_b64
    );

    Ok(SignatureHeaders {
        signature: signature_header,
        date,
        digest,
    })
}

/// Reconstruct the canonical signing string from the signed-header list.
fn build_signing_string(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    signed_headers: &[String],
) -> Result<String, AppError> {
    let mut signing_parts = Vec::new();

    for header_name in signed_headers {
        let value = if header_name == "(request-target)" {
            format!("{} {}", method.to_lowercase(), path)
        } else {
            headers
                .get(header_name.as_str())
                .ok_or_else(|| {
                    AppError::Signature(format!("Missing signed header: {}", header_name))
                })?
                .to_str()
                .map_err(|_| {
                    AppError::Signature(format!("Invalid signed header: {}", header_name))
                })?
                .to_string()
        };

        signing_parts.push(format!("{}: {}", header_name, value));
    }

    Ok(signing_parts.join("\n"))
}

/// Try the verification ladder against a reconstructed signing string.
///
/// Order is fixed: RSA-SHA256 with the standard ASN.1 prefix, then the
/// unprefixed form some implementations emit, then RSA-SHA1 in both
/// forms. First success wins.
pub fn verify_with_fallback(
    signing_string: &str,
    signature_bytes: &[u8],
    public_key_pem: &str,
) -> Result<(), AppError> {
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| AppError::Signature(format!("Invalid public key: {}", e)))?;

    let signature = Pkcs1v15Signature::try_from(signature_bytes)
        .map_err(|e| AppError::Signature(format!("Invalid signature format: {}", e)))?;

    let message = signing_string.as_bytes();

    let sha256 = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(public_key.clone());
    if sha256.verify(message, &signature).is_ok() {
        return Ok(());
    }

    let sha256_unprefixed =
        rsa::pkcs1v15::VerifyingKey::<Sha256>::new_unprefixed(public_key.clone());
    if sha256_unprefixed.verify(message, &signature).is_ok() {
        return Ok(());
    }

    let sha1 = rsa::pkcs1v15::VerifyingKey::<Sha1>::new(public_key.clone());
    if sha1.verify(message, &signature).is_ok() {
        tracing::debug!("signature verified via legacy rsa-sha1 fallback");
        return Ok(());
    }

    let sha1_unprefixed = rsa::pkcs1v15::VerifyingKey::<Sha1>::new_unprefixed(public_key);
    if sha1_unprefixed.verify(message, &signature).is_ok() {
        tracing::debug!("signature verified via legacy unprefixed rsa-sha1 fallback");
        return Ok(());
    }

    Err(AppError::Signature(
        "Signature verification failed".to_string(),
    ))
}

/// Verify an HTTP request signature against a known public key.
///
/// # Arguments
/// * `method` - HTTP method
/// * `path` - Request path
/// * `headers` - All request headers
/// * `body` - Request body (for digest verification)
/// * `public_key_pem` - RSA public key in PEM format
/// * `clock_skew_seconds` - Allowed drift for the signed Date header
///
/// # Errors
/// `AppError::Signature` when any required element is missing or the
/// full fallback ladder fails.
pub fn verify_request(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
    clock_skew_seconds: i64,
) -> Result<(), AppError> {
    // 1. Parse Signature header
    let signature_header = headers
        .get("signature")
        .ok_or_else(|| AppError::Signature("Missing Signature header".to_string()))?
        .to_str()
        .map_err(|_| AppError::Signature("Invalid Signature header".to_string()))?;

    let parsed = parse_signature_header(signature_header)?;

    // 2. Require the headers that make a signature meaningful.
    for required in ["(request-target)", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(AppError::Signature(format!(
                "Signed headers must include: {}",
                required
            )));
        }
    }

    if body.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(AppError::Signature(
            "Signed headers must include: digest".to_string(),
        ));
    }

    // 3. Verify Date is within the allowed skew (timestamp-replay mitigation).
    let date_header = headers
        .get("date")
        .ok_or_else(|| AppError::Signature("Missing Date header".to_string()))?;
    let date_str = date_header
        .to_str()
        .map_err(|_| AppError::Signature("Invalid Date header".to_string()))?;

    let date = DateTime::parse_from_rfc2822(date_str)
        .map_err(|_| AppError::Signature("Invalid Date format".to_string()))?;

    let now = Utc::now();
    let diff = (now.timestamp() - date.timestamp()).abs();

    if diff > clock_skew_seconds {
        return Err(AppError::Signature(
            "Date header too old or in future".to_string(),
        ));
    }

    // 4. If body present, verify Digest.
    if let Some(body_data) = body {
        let digest_header = headers
            .get("digest")
            .ok_or_else(|| AppError::Signature("Missing Digest header".to_string()))?;
        let digest_str = digest_header
            .to_str()
            .map_err(|_| AppError::Signature("Invalid Digest header".to_string()))?;

        let expected_digest = generate_digest(body_data);
        if !digest_str.eq_ignore_ascii_case(&expected_digest) {
            return Err(AppError::Signature("Digest mismatch".to_string()));
        }
    }

    // 5. Reconstruct signing string and run the ladder.
    let signing_string = build_signing_string(method, path, headers, &parsed.headers)?;

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| AppError::Signature("Invalid signature encoding".to_string()))?;

    verify_with_fallback(&signing_string, &signature_bytes, public_key_pem)
}
