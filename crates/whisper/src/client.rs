use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use whisper_server::envelope;
use whisper_server::link;
use whisper_server::store::{short_id, SecretPayload};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequest<'a> {
    ciphertext: &'a str,
    iv: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_views: Option<u32>,
}

#[derive(Deserialize)]
struct CreateResponse {
    id: String,
}

/// Encrypt `plaintext` locally, store the envelope, and return the share link.
/// The key only ever appears in the returned link's fragment.
pub async fn send_secret(
    server: &str,
    plaintext: &str,
    ttl_seconds: Option<u64>,
    max_views: Option<u32>,
) -> Result<String> {
    let key = envelope::generate_key();
    let sealed = envelope::encrypt(plaintext, &key)?;

    let body = CreateRequest {
        ciphertext: &sealed.ciphertext,
        iv: &sealed.iv,
        ttl_seconds,
        max_views,
    };

    let resp = Client::new()
        .post(format!("{}/secret", server.trim_end_matches('/')))
        .json(&body)
        .send()
        .await
        .context("HTTP request failed")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        anyhow::bail!("server returned {status}: {text}");
    }

    let created: CreateResponse = resp.json().await.context("parse response")?;
    debug!(id = %short_id(&created.id), "secret stored");
    Ok(link::build_link(server, &created.id, &envelope::export_key(&key)))
}

/// Fetch a secret through its link and decrypt it.
///
/// The fetch consumes a view, so it is made exactly once. A decryption
/// failure is final.
pub async fn open_secret(share_link: &str) -> Result<String> {
    let parsed = link::parse_link(share_link)?;
    let key = envelope::import_key(&parsed.key)?;

    let resp = Client::new()
        .get(format!("{}/secret/{}", parsed.origin, parsed.id))
        .send()
        .await
        .context("HTTP request failed")?;

    match resp.status() {
        StatusCode::OK => {}
        StatusCode::NOT_FOUND => anyhow::bail!("secret not found or expired"),
        status => anyhow::bail!("server returned {status}"),
    }

    let payload: SecretPayload = resp.json().await.context("parse response")?;
    let plaintext = envelope::decrypt(&payload.ciphertext, &payload.iv, &key)?;
    Ok(plaintext)
}
