use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::header::HeaderMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};

const HEADER_BUCKET: &str = "X-RateLimit-Bucket";
const HEADER_LIMIT: &str = "X-RateLimit-Limit";
const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
const HEADER_RESET: &str = "X-RateLimit-Reset";
const HEADER_RESET_AFTER: &str = "X-RateLimit-Reset-After";
pub(crate) const HEADER_GLOBAL: &str = "X-RateLimit-Global";
pub(crate) const HEADER_RETRY_AFTER: &str = "Retry-After";

// Responses keep coming back 429 when the advertised retry-after is honored
// exactly, so deadlines get a fixed offset on top.
const LOCKOUT_MARGIN: Duration = Duration::from_millis(500);

/// Gates every outbound REST call behind per-route token buckets and a global
/// lockout clock. Buckets are discovered lazily: a route with unknown bucket
/// identity executes serialized behind a single process-wide mutex until its
/// first response reveals its bucket id, after which the route is permanently
/// mapped to that bucket. Shared process-wide and safe for concurrent use.
pub struct RateLimiter {
    routes: Mutex<HashMap<String, String>>,
    buckets: Mutex<HashMap<String, Arc<RouteBucket>>>,
    discovery: Arc<AsyncMutex<()>>,
    global_until: Mutex<Option<Instant>>,
}

struct RouteBucket {
    id: String,
    // Admits one in-flight request per bucket; held until the response for
    // that request has been fed back through note_response.
    gate: Arc<AsyncMutex<()>>,
    state: Mutex<BucketState>,
}

struct BucketState {
    limit: u64,
    remaining: u64,
    reset: Instant,
}

/// Proof that the limiter admitted a request for a route. Holds the bucket
/// gate (or the discovery mutex for an unmapped route) until the response
/// headers are observed via [`RateLimiter::note_response`]; dropping it
/// without a response releases the gate with no state change.
pub struct RouteTicket {
    route_key: String,
    hold: Hold,
}

enum Hold {
    Known {
        bucket: Arc<RouteBucket>,
        _gate: OwnedMutexGuard<()>,
    },
    Discovery {
        _guard: OwnedMutexGuard<()>,
    },
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
            discovery: Arc::new(AsyncMutex::new(())),
            global_until: Mutex::new(None),
        }
    }

    /// Blocks the calling call-site (never unrelated routes) until the route
    /// may issue a request: waits out any global lockout, then either takes
    /// the route's bucket gate and a token, or the discovery mutex when the
    /// route's bucket is still unknown.
    pub async fn acquire(&self, route_key: &str) -> RouteTicket {
        loop {
            let wait = {
                let until = lock(&self.global_until);
                until.map(|u| u.saturating_duration_since(Instant::now()))
            };
            match wait {
                Some(wait) if !wait.is_zero() => {
                    debug!("globally rate limited, delaying {route_key} for {wait:?}");
                    sleep(wait).await;
                }
                _ => break,
            }
        }

        loop {
            if let Some(bucket) = self.bucket_for(route_key) {
                let gate = bucket.gate.clone().lock_owned().await;
                let wait = {
                    let state = lock_state(&bucket.state);
                    if state.remaining == 0 {
                        state.reset.saturating_duration_since(Instant::now())
                    } else {
                        Duration::ZERO
                    }
                };
                if !wait.is_zero() {
                    debug!("bucket {} exhausted, waiting {wait:?}", bucket.id);
                    sleep(wait).await;
                }
                {
                    let mut state = lock_state(&bucket.state);
                    state.remaining = state.remaining.saturating_sub(1);
                }
                return RouteTicket {
                    route_key: route_key.to_owned(),
                    hold: Hold::Known {
                        bucket,
                        _gate: gate,
                    },
                };
            }

            let guard = self.discovery.clone().lock_owned().await;
            if self.bucket_for(route_key).is_some() {
                // Another caller mapped this route while we queued for
                // discovery; go around and take the bucket path.
                drop(guard);
                continue;
            }
            debug!("unknown bucket for {route_key}, serializing behind discovery lock");
            return RouteTicket {
                route_key: route_key.to_owned(),
                hold: Hold::Discovery { _guard: guard },
            };
        }
    }

    /// Feeds a response's rate-limit headers back into the limiter and
    /// releases the ticket. A discovery ticket additionally records the
    /// advertised bucket id against its route for all future calls.
    pub fn note_response(&self, ticket: RouteTicket, headers: &HeaderMap) -> Result<()> {
        match ticket.hold {
            Hold::Known { ref bucket, .. } => bucket.update(headers),
            Hold::Discovery { .. } => {
                let Some(id) = header_str(headers, HEADER_BUCKET) else {
                    debug!(
                        "no bucket id advertised for {}, route stays serialized",
                        ticket.route_key
                    );
                    return Ok(());
                };
                let bucket = {
                    let mut buckets = lock(&self.buckets);
                    Arc::clone(
                        buckets
                            .entry(id.to_owned())
                            .or_insert_with(|| Arc::new(RouteBucket::new(id.to_owned()))),
                    )
                };
                bucket.update(headers)?;
                debug!("route {} mapped to bucket {id}", ticket.route_key);
                lock(&self.routes).insert(ticket.route_key, id.to_owned());
                Ok(())
            }
        }
    }

    /// Applies a 429. A globally-scoped limit arms the lockout clock for
    /// every route; a scoped one drains only the offending route's bucket.
    /// The deadline carries the safety margin in both cases.
    pub fn note_rate_limited(&self, route_key: &str, retry_after: Duration, global: bool) {
        let until = Instant::now() + retry_after + LOCKOUT_MARGIN;
        if global {
            warn!("globally rate limited, locking out all routes for {retry_after:?}");
            *lock(&self.global_until) = Some(until);
        } else if let Some(bucket) = self.bucket_for(route_key) {
            warn!(
                "rate limited on bucket {}, draining it for {retry_after:?}",
                bucket.id
            );
            let mut state = lock_state(&bucket.state);
            state.remaining = 0;
            state.reset = until;
        } else {
            // 429 on a route whose first response was itself the 429; the
            // discovery mapping (if any) was already recorded, so there is
            // nothing to drain.
            warn!("rate limited on unmapped route {route_key}");
        }
    }

    fn bucket_for(&self, route_key: &str) -> Option<Arc<RouteBucket>> {
        let id = lock(&self.routes).get(route_key).cloned()?;
        lock(&self.buckets).get(&id).cloned()
    }
}

impl RouteBucket {
    fn new(id: String) -> Self {
        Self {
            id,
            gate: Arc::new(AsyncMutex::new(())),
            state: Mutex::new(BucketState {
                limit: 1,
                remaining: 1,
                reset: Instant::now(),
            }),
        }
    }

    /// Parses the rate-limit headers into the bucket. Reset-After (relative
    /// seconds) is more accurate than Reset (absolute epoch) so it wins when
    /// both are present.
    fn update(&self, headers: &HeaderMap) -> Result<()> {
        let limit = parse_u64(headers, HEADER_LIMIT)?;
        let remaining = parse_u64(headers, HEADER_REMAINING)?;
        let reset_after = parse_f64(headers, HEADER_RESET_AFTER)?;
        let reset_epoch = parse_f64(headers, HEADER_RESET)?;

        let mut state = lock_state(&self.state);
        if let Some(limit) = limit {
            state.limit = limit;
        }
        if let Some(remaining) = remaining {
            state.remaining = remaining;
        }
        if let Some(secs) = reset_after {
            state.reset = Instant::now() + Duration::from_secs_f64(secs.max(0.0));
        } else if let Some(epoch) = reset_epoch {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64();
            state.reset = Instant::now() + Duration::from_secs_f64((epoch - now).max(0.0));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lock_state(mutex: &Mutex<BucketState>) -> MutexGuard<'_, BucketState> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn parse_u64(headers: &HeaderMap, name: &'static str) -> Result<Option<u64>> {
    match header_str(headers, name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| GatewayError::RateLimitHeader {
                name,
                value: raw.to_owned(),
            }),
    }
}

pub(crate) fn parse_f64(headers: &HeaderMap, name: &'static str) -> Result<Option<f64>> {
    match header_str(headers, name) {
        None => Ok(None),
        Some(raw) => match raw.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(Some(value)),
            _ => Err(GatewayError::RateLimitHeader {
                name,
                value: raw.to_owned(),
            }),
        },
    }
}
