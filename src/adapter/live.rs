//! Live adapters: thin upstream shims over `reqwest`.
//!
//! Each adapter issues exactly one HTTP call, injects the decrypted
//! credential, enforces the remaining deadline as the request timeout, and
//! classifies the outcome. Bodies pass through opaquely; no provider
//! payload semantics live here.

use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use super::ToolAdapter;
use crate::{Error, Result};

fn remaining(deadline: Instant) -> Result<std::time::Duration> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(Error::UpstreamTimeout("deadline already expired".into()));
    }
    Ok(remaining)
}

fn credential_str(credential: &[u8]) -> Result<&str> {
    std::str::from_utf8(credential)
        .map_err(|_| Error::Internal("credential is not valid UTF-8".into()))
}

fn classify_transport(tool: &str, e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::UpstreamTimeout(format!("{tool}: upstream timed out"))
    } else {
        Error::Upstream(format!("{tool}: transport error"))
    }
}

fn classify_status(tool: &str, status: StatusCode) -> Result<()> {
    if status.is_server_error() {
        Err(Error::Upstream(format!("{tool}: upstream {status}")))
    } else if status.is_client_error() {
        Err(Error::UpstreamTerminal(format!("{tool}: upstream {status}")))
    } else {
        Ok(())
    }
}

/// Search via SerpApi.
pub struct SerpApiAdapter {
    client: Client,
}

impl SerpApiAdapter {
    /// Create the adapter over a shared client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ToolAdapter for SerpApiAdapter {
    async fn invoke(
        &self,
        _action: &str,
        params: &Value,
        credential: &[u8],
        deadline: Instant,
    ) -> Result<Bytes> {
        let query = params
            .get("q")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("serpapi requires a string `q` parameter".into()))?;
        let api_key = credential_str(credential)?;

        let response = self
            .client
            .get("https://serpapi.com/search")
            .query(&[("q", query), ("api_key", api_key)])
            .timeout(remaining(deadline)?)
            .send()
            .await
            .map_err(|e| classify_transport("serpapi", &e))?;

        classify_status("serpapi", response.status())?;
        response
            .bytes()
            .await
            .map_err(|e| classify_transport("serpapi", &e))
    }
}

/// Fetch an allowlisted URL.
pub struct HttpFetchAdapter {
    client: Client,
    max_response_bytes: u64,
}

impl HttpFetchAdapter {
    /// Create the adapter with its response size ceiling.
    #[must_use]
    pub fn new(client: Client, max_response_bytes: u64) -> Self {
        Self {
            client,
            max_response_bytes,
        }
    }
}

#[async_trait]
impl ToolAdapter for HttpFetchAdapter {
    async fn invoke(
        &self,
        _action: &str,
        params: &Value,
        _credential: &[u8],
        deadline: Instant,
    ) -> Result<Bytes> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("http_fetch requires a string `url` parameter".into()))?;

        let response = self
            .client
            .get(url)
            .timeout(remaining(deadline)?)
            .send()
            .await
            .map_err(|e| classify_transport("http_fetch", &e))?;

        classify_status("http_fetch", response.status())?;
        let body = response
            .bytes()
            .await
            .map_err(|e| classify_transport("http_fetch", &e))?;
        if body.len() as u64 > self.max_response_bytes {
            return Err(Error::UpstreamTerminal(format!(
                "http_fetch: response exceeds {} byte limit",
                self.max_response_bytes
            )));
        }
        Ok(body)
    }
}

/// Chat completion via the OpenAI API.
pub struct OpenAiChatAdapter {
    client: Client,
}

impl OpenAiChatAdapter {
    /// Create the adapter over a shared client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ToolAdapter for OpenAiChatAdapter {
    async fn invoke(
        &self,
        _action: &str,
        params: &Value,
        credential: &[u8],
        deadline: Instant,
    ) -> Result<Bytes> {
        let api_key = credential_str(credential)?;

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(api_key)
            .json(params)
            .timeout(remaining(deadline)?)
            .send()
            .await
            .map_err(|e| classify_transport("openai", &e))?;

        classify_status("openai", response.status())?;
        response
            .bytes()
            .await
            .map_err(|e| classify_transport("openai", &e))
    }
}

/// Send mail via the Gmail API.
pub struct GmailSendAdapter {
    client: Client,
}

impl GmailSendAdapter {
    /// Create the adapter over a shared client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ToolAdapter for GmailSendAdapter {
    async fn invoke(
        &self,
        _action: &str,
        params: &Value,
        credential: &[u8],
        deadline: Instant,
    ) -> Result<Bytes> {
        let access_token = credential_str(credential)?;

        let response = self
            .client
            .post("https://gmail.googleapis.com/gmail/v1/users/me/messages/send")
            .bearer_auth(access_token)
            .json(params)
            .timeout(remaining(deadline)?)
            .send()
            .await
            .map_err(|e| classify_transport("gmail_send", &e))?;

        classify_status("gmail_send", response.status())?;
        response
            .bytes()
            .await
            .map_err(|e| classify_transport("gmail_send", &e))
    }
}
