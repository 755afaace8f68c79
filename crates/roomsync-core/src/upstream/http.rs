//! reqwest-backed client for the multiplayer rooms API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{Fetched, ScorePage, UpstreamApi, UpstreamError, UpstreamResult};
use crate::config::UpstreamConfig;
use crate::models::Room;

const SCORES_PAGE_LIMIT: u32 = 50;

#[derive(Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl std::fmt::Debug for HttpUpstream {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpUpstream")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl HttpUpstream {
    pub fn new(config: &UpstreamConfig) -> UpstreamResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|error| UpstreamError::Transport(sanitize(&error)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> UpstreamResult<Fetched<T>> {
        let url = format!("{}/{path}", self.base_url);
        let mut request = self
            .client
            .get(&url)
            .header(ACCEPT, "application/json")
            .query(query);
        if let Some(token) = self.token.as_deref() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(map_transport_error)?;
        let response = check_status(response, path).await?;

        let body = response.bytes().await.map_err(map_transport_error)?;
        let size_bytes = u64::try_from(body.len()).unwrap_or(u64::MAX);
        let value = serde_json::from_slice::<T>(&body)
            .map_err(|error| UpstreamError::Decode(format!("{path}: {error}")))?;
        Ok(Fetched::new(value, size_bytes))
    }
}

#[async_trait]
impl UpstreamApi for HttpUpstream {
    async fn fetch_room(&self, room_id: i64) -> UpstreamResult<Fetched<Room>> {
        self.get_json(&format!("rooms/{room_id}"), &[]).await
    }

    async fn fetch_scores_page(
        &self,
        room_id: i64,
        playlist_item_id: i64,
        cursor: Option<&str>,
    ) -> UpstreamResult<Fetched<ScorePage>> {
        let mut query = vec![("limit", SCORES_PAGE_LIMIT.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor_string", cursor.to_string()));
        }
        self.get_json(
            &format!("rooms/{room_id}/playlist/{playlist_item_id}/scores"),
            &query,
        )
        .await
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

async fn check_status(response: Response, path: &str) -> UpstreamResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(UpstreamError::RateLimited { retry_after });
    }
    if status.is_server_error() {
        return Err(UpstreamError::Server(status.as_u16()));
    }
    if status == StatusCode::NOT_FOUND {
        return Err(UpstreamError::NotFound(path.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    Err(UpstreamError::Client {
        status: status.as_u16(),
        body: parse_api_error(&body),
    })
}

fn parse_api_error(body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return compact_body(&message);
        }
    }
    compact_body(body)
}

fn map_transport_error(error: reqwest::Error) -> UpstreamError {
    if error.is_timeout() {
        UpstreamError::Timeout
    } else {
        UpstreamError::Transport(sanitize(&error))
    }
}

fn sanitize(error: &impl std::fmt::Display) -> String {
    error.to_string().replace('\n', " ").trim().to_string()
}

fn compact_body(body: &str) -> String {
    body.trim().chars().take(180).collect()
}
