//! HTTP Signatures for ActivityPub
//!
//! Implements the Cavage-draft signing scheme used across the
//! fediverse: outbound requests are signed over
//! `(request-target) host date [digest]`, inbound requests are
//! verified against the actor's published RSA public key.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{pkcs1v15::Signature as Pkcs1v15Signature, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::error::AppError;

/// Maximum allowed clock skew on the Date header, in seconds
const DATE_SKEW_TOLERANCE_SECS: i64 = 300;

/// Headers to add to a signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 1123, GMT)
    pub date: String,
    /// Host header value
    pub host: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

/// Sign an HTTP request
///
/// Creates HTTP Signature headers for outgoing requests. The signing
/// string covers `(request-target) host date` plus `digest` when a
/// body is present.
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
    let host = match parsed_url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let path = parsed_url.path();
    let path_and_query = match parsed_url.query() {
        Some(q) => format!("{}?{}", path, q),
        None => path.to_string(),
    };

    // 2. Generate Date header (RFC 1123, GMT)
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
    }

    let signing_string = signing_parts.join("\n");

    // 5. Sign with RSA-SHA256 (PKCS#1 v1.5)
    let private_key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
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
        host,
        digest,
    })
}

/// Verify an HTTP request signature
///
/// Reconstructs the signing string from the announced header list and
/// the request's actual header values, checks the Digest against the
/// exact received body bytes, then verifies the RSA signature.
///
/// # Arguments
/// * `method` - HTTP method
/// * `path` - Request path (with query, if any)
/// * `headers` - All request headers as received
/// * `body` - Request body bytes as received
/// * `public_key_pem` - RSA public key in PEM format
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
) -> Result<(), AppError> {
    // 1. Parse Signature header
    let signature_header = headers
        .get("signature")
        .ok_or_else(|| AppError::InvalidSignature("Missing Signature header".to_string()))?
        .to_str()
        .map_err(|_| AppError::InvalidSignature("Invalid Signature header".to_string()))?;

    let parsed = parse_signature_header(signature_header)?;

    if !parsed.algorithm.eq_ignore_ascii_case("rsa-sha256")
        && !parsed.algorithm.eq_ignore_ascii_case("hs2019")
    {
        return Err(AppError::InvalidSignature(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    // 2. Verify Date is recent
    if let Some(date_header) = headers.get("date") {
        let date_str = date_header
            .to_str()
            .map_err(|_| AppError::InvalidSignature("Invalid Date header".to_string()))?;

        let date = DateTime::parse_from_rfc2822(date_str)
            .map_err(|_| AppError::InvalidSignature("Invalid Date format".to_string()))?;

        let diff = (Utc::now().timestamp() - date.timestamp()).abs();
        if diff > DATE_SKEW_TOLERANCE_SECS {
            return Err(AppError::InvalidSignature(
                "Date header too old or in future".to_string(),
            ));
        }
    }

    // 3. If body present, verify Digest over the exact received bytes
    if let Some(body_data) = body {
        if let Some(digest_header) = headers.get("digest") {
            let digest_str = digest_header
                .to_str()
                .map_err(|_| AppError::InvalidSignature("Invalid Digest header".to_string()))?;

            let expected_digest = generate_digest(body_data);
            if digest_str != expected_digest {
                return Err(AppError::InvalidSignature("Digest mismatch".to_string()));
            }
        }
    }

    // 4. Reconstruct signing string per the announced header list
    let mut signing_parts = Vec::new();

    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            name => headers
                .get(name)
                .ok_or_else(|| {
                    AppError::InvalidSignature(format!("Missing signed header: {name}"))
                })?
                .to_str()
                .map_err(|_| AppError::InvalidSignature(format!("Invalid header: {name}")))?
                .to_string(),
        };

        signing_parts.push(format!("{}: {}", header_name, value));
    }

    let signing_string = signing_parts.join("\n");

    // 5. Verify RSA signature
    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| AppError::InvalidSignature("Invalid signature encoding".to_string()))?;

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| AppError::InvalidSignature(format!("Invalid public key: {}", e)))?;

    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(public_key);

    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| AppError::InvalidSignature(format!("Invalid signature format: {}", e)))?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| AppError::InvalidSignature("Signature verification failed".to_string()))?;

    Ok(())
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
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

    // Split by comma and parse key=value pairs.
    // Base64 signature values may themselves contain '=' so only the
    // first '=' separates key from value.
    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            match key {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(value.split_whitespace().map(|s| s.to_string()).collect())
                }
                "signature" => signature = Some(value.to_string()),
                _ => {} // Ignore unknown fields
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id
            .ok_or_else(|| AppError::InvalidSignature("Missing keyId".to_string()))?,
        algorithm: algorithm
            .ok_or_else(|| AppError::InvalidSignature("Missing algorithm".to_string()))?,
        headers: headers
            .ok_or_else(|| AppError::InvalidSignature("Missing headers".to_string()))?,
        signature: signature
            .ok_or_else(|| AppError::InvalidSignature("Missing signature".to_string()))?,
    })
}

/// Extract the signature keyId from request headers without verifying
pub fn extract_signature_key_id(headers: &http::HeaderMap) -> Result<String, AppError> {
    let signature_header = headers
        .get("signature")
        .ok_or_else(|| AppError::InvalidSignature("Missing Signature header".to_string()))?
        .to_str()
        .map_err(|_| AppError::InvalidSignature("Invalid Signature header".to_string()))?;

    Ok(parse_signature_header(signature_header)?.key_id)
}

/// Whether a signature keyId belongs to the claimed actor.
///
/// The keyId's owning document is the actor URL with an optional
/// fragment (`#main-key`).
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_owner = key_id.split('#').next().unwrap_or(key_id);
    key_owner == actor_id
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

/// Fetch a public key from its keyId URL.
///
/// The GET is itself signed by the given signer (the system actor) so
/// that peers requiring authorized fetch accept it.
///
/// # Arguments
/// * `key_id` - Full URL to the key (e.g., actor#main-key)
/// * `http_client` - HTTP client
/// * `signer_key_id` / `signer_private_key_pem` - System actor signing
///   material
/// * `timeout` - Sub-deadline for the fetch
///
/// # Returns
/// PEM-encoded public key
pub async fn fetch_public_key(
    key_id: &str,
    http_client: &reqwest::Client,
    signer_key_id: &str,
    signer_private_key_pem: &str,
    timeout: Duration,
) -> Result<String, AppError> {
    // The key lives in the owning actor document; drop the fragment
    let actor_url = key_id.split('#').next().unwrap_or(key_id);

    let sig_headers = sign_request("GET", actor_url, None, signer_private_key_pem, signer_key_id)?;

    let response = http_client
        .get(actor_url)
        .timeout(timeout)
        .header("Accept", "application/activity+json")
        .header("Date", sig_headers.date)
        .header("Host", sig_headers.host)
        .header("Signature", sig_headers.signature)
        .send()
        .await
        .map_err(|e| AppError::Federation(format!("Failed to fetch actor: {}", e)))?;

    if !response.status().is_success() {
        return Err(AppError::Federation(format!(
            "Failed to fetch actor: HTTP {}",
            response.status()
        )));
    }

    let actor: serde_json::Value = response
        .json()
        .await
        .map_err(|e| AppError::Federation(format!("Failed to parse actor: {}", e)))?;

    let public_key_pem = actor
        .get("publicKey")
        .and_then(|pk| pk.get("publicKeyPem"))
        .and_then(|pem| pem.as_str())
        .ok_or_else(|| AppError::Federation("Missing publicKeyPem in actor".to_string()))?;

    Ok(public_key_pem.to_string())
}
