//! Client core for a realtime chat platform: a websocket gateway session
//! engine with automatic heartbeating and resume, a rate-limited REST client
//! with signed requests and bounded retries, and a fixed-capacity LRU cache
//! for fetched resources.
//!
//! The usual wiring: build a [`rest::RestClient`], hand it to
//! [`gateway::Gateway::connect`] as the connect-URL source, and implement
//! [`gateway::EventHandler`] for the dispatch events the session delivers.

pub mod cache;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod ratelimit;
pub mod rest;

pub use cache::ResourceCache;
pub use error::{GatewayError, Result};
pub use gateway::{ConnectUrlSource, EventHandler, Gateway, GatewayConfig, GatewayHandle};
pub use protocol::GatewayPayload;
pub use ratelimit::RateLimiter;
pub use rest::{RestClient, RestConfig, RestResponse};
