use std::hash::Hash;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::ResourceCache;
use crate::error::{GatewayError, Result};
use crate::gateway::ConnectUrlSource;
use crate::protocol::with_protocol_params;
use crate::ratelimit::{self, RateLimiter};

const MAX_REST_ATTEMPTS: u32 = 3;
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const CLIENT_USER_AGENT: &str = concat!("chatwire/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Base URL all request paths are joined onto, without a trailing slash.
    pub api_root: String,
    pub token: String,
}

/// A decoded-on-demand response body. Successful requests always land here;
/// failure statuses are surfaced as errors by the client instead.
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RestResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Deserialize)]
struct GatewayUrlResponse {
    url: String,
}

/// HTTP client for the chat backend's REST API. Every request is signed with
/// the bot token and gated through the shared [`RateLimiter`]; transient
/// failures are retried a bounded number of times.
pub struct RestClient {
    http: reqwest::Client,
    limiter: RateLimiter,
    config: RestConfig,
}

impl RestClient {
    pub fn new(config: RestConfig) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            limiter: RateLimiter::new(),
            config,
        })
    }

    pub async fn get(&self, path: &str) -> Result<RestResponse> {
        self.request(Method::GET, path, None).await
    }

    pub async fn delete(&self, path: &str) -> Result<RestResponse> {
        self.request(Method::DELETE, path, None).await
    }

    pub async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<RestResponse> {
        self.request(Method::POST, path, Some(serde_json::to_vec(body)?))
            .await
    }

    pub async fn put<T: Serialize>(&self, path: &str, body: &T) -> Result<RestResponse> {
        self.request(Method::PUT, path, Some(serde_json::to_vec(body)?))
            .await
    }

    pub async fn patch<T: Serialize>(&self, path: &str, body: &T) -> Result<RestResponse> {
        self.request(Method::PATCH, path, Some(serde_json::to_vec(body)?))
            .await
    }

    /// GET with a cache in front: a hit skips the network entirely, a miss
    /// fetches, decodes and stores the resource before returning it.
    pub async fn get_cacheable<K, V>(
        &self,
        cache: &ResourceCache<K, V>,
        key: K,
        path: &str,
    ) -> Result<V>
    where
        K: Eq + Hash + Clone,
        V: DeserializeOwned + Clone,
    {
        if let Some(hit) = cache.get(&key) {
            debug!("[rest] cache hit for {path}");
            return Ok(hit);
        }
        let resource: V = self.get(path).await?.json()?;
        cache.add(key, resource.clone());
        Ok(resource)
    }

    /// Asks the backend where the websocket gateway lives and appends the
    /// protocol parameters the gateway handshake expects.
    pub async fn fetch_gateway_url(&self) -> Result<String> {
        let response: GatewayUrlResponse = self.get("/gateway/bot").await?.json()?;
        if response.url.is_empty() {
            return Err(GatewayError::Protocol(
                "gateway discovery returned an empty url".to_owned(),
            ));
        }
        Ok(with_protocol_params(&response.url))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<RestResponse> {
        let url = format!("{}{}", self.config.api_root, path);
        let route_key = format!("{method} {url}");

        for attempt in 1..=MAX_REST_ATTEMPTS {
            let ticket = self.limiter.acquire(&route_key).await;

            let mut request = self
                .http
                .request(method.clone(), &url)
                .header(USER_AGENT, CLIENT_USER_AGENT)
                .header(AUTHORIZATION, format!("Bot {}", self.config.token));
            if let Some(bytes) = &body {
                request = request
                    .header(CONTENT_TYPE, "application/json")
                    .body(bytes.clone());
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    // No headers to learn from; release the route untouched.
                    drop(ticket);
                    if attempt == MAX_REST_ATTEMPTS {
                        return Err(err.into());
                    }
                    warn!("[rest] attempt {attempt} failed to send, retrying: {err}");
                    continue;
                }
            };

            let status = response.status();
            let headers = response.headers().clone();
            self.limiter.note_response(ticket, &headers)?;
            let bytes = response.bytes().await?;

            match status {
                StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => {
                    return Ok(RestResponse {
                        status: status.as_u16(),
                        body: bytes.to_vec(),
                    });
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after =
                        ratelimit::parse_f64(&headers, ratelimit::HEADER_RETRY_AFTER)?.ok_or(
                            GatewayError::RateLimitHeader {
                                name: ratelimit::HEADER_RETRY_AFTER,
                                value: String::new(),
                            },
                        )?;
                    let global =
                        ratelimit::header_str(&headers, ratelimit::HEADER_GLOBAL).is_some();
                    self.limiter.note_rate_limited(
                        &route_key,
                        Duration::from_secs_f64(retry_after.max(0.0)),
                        global,
                    );
                    warn!("[rest] attempt {attempt} rate limited (global={global}), retrying");
                }
                StatusCode::INTERNAL_SERVER_ERROR
                | StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE => {
                    warn!("[rest] attempt {attempt} failed with {status}, retrying");
                }
                StatusCode::UNAUTHORIZED => return Err(GatewayError::Unauthorized),
                _ => {
                    return Err(GatewayError::Api {
                        status: status.as_u16(),
                        body: String::from_utf8_lossy(&bytes).into_owned(),
                    })
                }
            }
        }

        Err(GatewayError::RetriesExhausted {
            method: method.to_string(),
            url,
        })
    }
}

#[async_trait]
impl ConnectUrlSource for RestClient {
    async fn resolve_connect_url(&self) -> Result<String> {
        self.fetch_gateway_url().await
    }
}
