//! WebFinger protocol implementation
//!
//! Used to discover ActivityPub actor URIs from addresses.

use serde::Deserialize;

use crate::error::AppError;

/// WebFinger result
#[derive(Debug, Clone)]
pub struct WebFingerResult {
    /// Subject (acct:user@domain)
    pub subject: String,
    /// ActivityPub actor URI
    pub actor_uri: String,
}

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize)]
pub struct WebFingerResponse {
    pub subject: String,
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    pub link_type: Option<String>,
    pub href: Option<String>,
}

/// Resolve an address to an ActivityPub actor
///
/// # Arguments
/// * `address` - Account address (user@domain)
/// * `http_client` - HTTP client
///
/// # Returns
/// WebFinger result with actor URI
pub async fn resolve_webfinger(
    address: &str,
    http_client: &reqwest::Client,
) -> Result<WebFingerResult, AppError> {
    let address = address.trim_start_matches('@');
    let (_, domain) = address
        .split_once('@')
        .ok_or_else(|| AppError::Validation(format!("Invalid account address: {address}")))?;

    let url = format!("https://{domain}/.well-known/webfinger");

    let response = http_client
        .get(&url)
        .query(&[("resource", format!("acct:{address}"))])
        .header("Accept", "application/jrd+json")
        .send()
        .await
        .map_err(|e| AppError::Federation(format!("WebFinger request failed: {e}")))?;

    if !response.status().is_success() {
        return Err(AppError::Federation(format!(
            "WebFinger lookup for {address} returned HTTP {}",
            response.status()
        )));
    }

    let jrd: WebFingerResponse = response
        .json()
        .await
        .map_err(|e| AppError::Federation(format!("Invalid WebFinger response: {e}")))?;

    let actor_uri = jrd
        .links
        .iter()
        .find(|link| {
            link.rel == "self"
                && link
                    .link_type
                    .as_deref()
                    .is_some_and(|t| t.contains("activity+json") || t.contains("ld+json"))
        })
        .and_then(|link| link.href.clone())
        .ok_or_else(|| {
            AppError::Federation(format!("WebFinger for {address} has no ActivityPub link"))
        })?;

    Ok(WebFingerResult {
        subject: jrd.subject,
        actor_uri,
    })
}
