//! Client for the upstream y2mate conversion API. A request either resolves
//! immediately to a direct download link or is deferred behind an encrypted
//! task token that the status endpoint resolves later.

use std::sync::Arc;

use reqwest::{StatusCode, header};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::encoder::{DecodeError, EncodeError, Encoder};

pub const DOMAINS: [&str; 2] = [
    "https://content-cdn.y2mate.app",
    "https://bzhve.y2mate.app",
];
pub const DEFAULT_QUALITY: &str = "480";

const TOKEN_METHOD: &str = "combined";
const ACCEPT_LANGUAGE: &str = "id-ID,id;q=0.9";
const USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 10; K) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/135.0.0.0 Mobile Safari/537.36";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Upstream(String),
    #[error("quality '{quality}' not available. Available formats: {available}")]
    QualityUnavailable { quality: String, available: String },
    #[error("upstream returned HTTP {0}")]
    UpstreamStatus(StatusCode),
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("analysis response did not contain a video id")]
    MissingVideoId,
    #[error("task_id payload is missing vid or b_id")]
    IncompleteTask,
    #[error(transparent)]
    Token(#[from] DecodeError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Picks the upstream base URL. An explicit domain is honored when it is in
/// the known list, anything unknown falls back to the first entry, and no
/// preference selects via `pick` (injected so tests stay deterministic).
pub fn resolve_base_url(preference: Option<&str>, pick: impl FnOnce(usize) -> usize) -> String {
    match preference {
        Some(domain) if DOMAINS.contains(&domain) => domain.to_string(),
        Some(other) => {
            warn!(domain = other, fallback = DOMAINS[0], "unknown upstream domain");
            DOMAINS[0].to_string()
        }
        None => {
            let chosen = DOMAINS[pick(DOMAINS.len()) % DOMAINS.len()];
            debug!(domain = chosen, "selected upstream domain");
            chosen.to_string()
        }
    }
}

fn random_index(len: usize) -> usize {
    let mut buffer = [0u8; 1];
    if getrandom::getrandom(&mut buffer).is_err() {
        return 0;
    }
    buffer[0] as usize % len
}

pub struct Y2MateClient {
    base_url: String,
    http: reqwest::Client,
    encoder: Arc<Encoder>,
}

impl Y2MateClient {
    pub fn new(http: reqwest::Client, encoder: Arc<Encoder>, domain: Option<&str>) -> Self {
        Self {
            base_url: resolve_base_url(domain, random_index),
            http,
            encoder,
        }
    }

    /// Resolves a download request into either a ready result or a deferred
    /// task token. Every failure is recovered into a `{status:false,message}`
    /// envelope; this method never surfaces a transport error.
    pub async fn download(&self, url: &str, quality: Option<&str>) -> Value {
        let quality = quality.unwrap_or(DEFAULT_QUALITY);
        match self.try_download(url, quality).await {
            Ok(result) => result,
            Err(error) => failure("download", error),
        }
    }

    /// Re-polls a deferred task. Same failure envelope contract as
    /// [`Y2MateClient::download`].
    pub async fn status(&self, task_id: &str) -> Value {
        match self.try_status(task_id).await {
            Ok(result) => result,
            Err(error) => failure("status", error),
        }
    }

    async fn try_download(&self, url: &str, quality: &str) -> Result<Value, ClientError> {
        let analyze = self
            .post_form(
                "mates/analyzeV2/ajax",
                &format!("{}/en102", self.base_url),
                &[
                    ("k_query", url),
                    ("k_page", "home"),
                    ("hl", "en"),
                    ("q_auto", "0"),
                ],
            )
            .await?;
        ensure_ok(&analyze, "analysis failed")?;

        let vid = field_str(&analyze, "vid")
            .ok_or(ClientError::MissingVideoId)?
            .to_string();
        let b_id = find_convert_key(&analyze, quality).ok_or_else(|| {
            ClientError::QualityUnavailable {
                quality: quality.to_string(),
                available: available_formats(&analyze),
            }
        })?;

        let convert = self.poll_convert(&vid, &b_id).await?;
        ensure_ok(&convert, "conversion failed")?;

        if let Some(dlink) = field_str(&convert, "dlink") {
            return Ok(json!({
                "status": true,
                "title": field_or_unknown(&analyze, "title"),
                "quality": quality,
                "size": field_or_unknown(&convert, "fsize"),
                "download_url": dlink,
                "vid": vid,
            }));
        }

        // Not ready yet: carry the whole analyze+convert state inside the
        // token so the status endpoint needs no server-side session.
        let payload = deferred_payload(&analyze, &convert, &vid, &b_id);
        let task_id = self.encoder.encode(&Value::Object(payload), TOKEN_METHOD)?;
        debug!(%vid, %task_id, "conversion deferred");
        Ok(json!({
            "status": true,
            "task_id": task_id,
            "message": "Processing... use status endpoint to check progress",
        }))
    }

    async fn try_status(&self, task_id: &str) -> Result<Value, ClientError> {
        let task = self.encoder.decode(task_id, TOKEN_METHOD)?.payload;
        let vid = field_str(&task, "vid")
            .ok_or(ClientError::IncompleteTask)?
            .to_string();
        let b_id = field_str(&task, "b_id")
            .ok_or(ClientError::IncompleteTask)?
            .to_string();

        let poll = self.poll_convert(&vid, &b_id).await?;
        ensure_ok(&poll, "status check failed")?;

        if let Some(dlink) = field_str(&poll, "dlink") {
            return Ok(json!({
                "status": true,
                "title": field_or_unknown(&task, "title"),
                "quality": field_or_unknown(&task, "quality"),
                "size": field_or_unknown(&poll, "fsize"),
                "download_url": dlink,
                "vid": vid,
            }));
        }

        // Still pending: pass the decoded task and the poll response through,
        // later fields overriding earlier ones.
        let mut merged = Map::new();
        merged.insert("status".to_string(), Value::Bool(true));
        if let Some(fields) = task.as_object() {
            merged.extend(fields.clone());
        }
        if let Some(fields) = poll.as_object() {
            merged.extend(fields.clone());
        }
        Ok(Value::Object(merged))
    }

    async fn poll_convert(&self, vid: &str, b_id: &str) -> Result<Value, ClientError> {
        self.post_form(
            "mates/convertV2/pool",
            &format!("{}/youtube/{vid}", self.base_url),
            &[("vid", vid), ("b_id", b_id)],
        )
        .await
    }

    async fn post_form(
        &self,
        path: &str,
        referer: &str,
        form: &[(&str, &str)],
    ) -> Result<Value, ClientError> {
        let url = format!("{}/{path}", self.base_url);
        debug!(%url, "calling upstream");

        let response = self
            .http
            .post(&url)
            .header(header::ACCEPT, "*/*")
            .header(header::ACCEPT_LANGUAGE, ACCEPT_LANGUAGE)
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::ORIGIN, &self.base_url)
            .header(header::PRAGMA, "no-cache")
            .header(header::REFERER, referer)
            .header(header::USER_AGENT, USER_AGENT)
            .header("sec-fetch-dest", "empty")
            .header("sec-fetch-mode", "cors")
            .header("sec-fetch-site", "same-origin")
            .header("x-requested-with", "XMLHttpRequest")
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::UpstreamStatus(status));
        }

        Ok(response.json::<Value>().await?)
    }
}

fn failure(operation: &str, error: ClientError) -> Value {
    warn!(operation, %error, "request failed");
    json!({ "status": false, "message": error.to_string() })
}

fn ensure_ok(response: &Value, fallback: &str) -> Result<(), ClientError> {
    if field_str(response, "status") == Some("ok") {
        return Ok(());
    }
    let message = field_str(response, "mess")
        .filter(|mess| !mess.is_empty())
        .unwrap_or(fallback)
        .to_string();
    Err(ClientError::Upstream(message))
}

fn field_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn field_or_unknown(value: &Value, key: &str) -> Value {
    value
        .get(key)
        .filter(|field| !field.is_null())
        .cloned()
        .unwrap_or_else(|| json!("Unknown"))
}

// The conversion key lives at links.mp4[quality].k, with links.mp3 as the
// audio fallback for the same quality label.
fn find_convert_key(analyze: &Value, quality: &str) -> Option<String> {
    ["mp4", "mp3"].iter().find_map(|kind| {
        analyze
            .get("links")?
            .get(kind)?
            .get(quality)?
            .get("k")?
            .as_str()
            .map(ToString::to_string)
    })
}

fn available_formats(analyze: &Value) -> String {
    let keys = |kind: &str| -> Vec<String> {
        analyze
            .get("links")
            .and_then(|links| links.get(kind))
            .and_then(Value::as_object)
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default()
    };
    json!({ "video": keys("mp4"), "audio": keys("mp3") }).to_string()
}

fn deferred_payload(analyze: &Value, convert: &Value, vid: &str, b_id: &str) -> Map<String, Value> {
    let mut payload = Map::new();
    if let Some(fields) = analyze.as_object() {
        payload.extend(fields.clone());
    }
    if let Some(fields) = convert.as_object() {
        payload.extend(fields.clone());
    }
    payload.insert("vid".to_string(), Value::String(vid.to_string()));
    payload.insert("b_id".to_string(), Value::String(b_id.to_string()));
    payload
}
