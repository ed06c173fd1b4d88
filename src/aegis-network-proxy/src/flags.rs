//! Dynamic flag layer: remote per-domain verdicts with a TTL decision cache.
//!
//! The remote service is evaluated by direct REST calls (no SDK). Each
//! verdict is cached per normalized domain so the connection path only pays
//! for a network round-trip on cache misses, and every remote call is
//! bounded by a short timeout so a hung service cannot stall connection
//! setup.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::{DynamicFlagConfig, FailoverMode};
use crate::{ProxyError, Result};

/// The boolean flag evaluated per domain; `true` means allow.
pub const EGRESS_FLAG_KEY: &str = "egress-allowlist";

/// Bound on each remote evaluation call.
const EVALUATION_TIMEOUT: Duration = Duration::from_secs(3);

/// Outcome of a flag-layer evaluation, consumed by the policy pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOutcome {
    /// A live cache entry answered without a network call.
    Cached(bool),

    /// The remote service answered; the verdict is now cached.
    Fresh(bool),

    /// The remote service failed, timed out, or omitted the flag.
    Unavailable,
}

/// Per-domain verdict cache with a fixed TTL.
pub struct DecisionCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

struct CacheEntry {
    allowed: bool,
    recorded_at: Instant,
}

impl DecisionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the live verdict for a domain, pruning a stale entry.
    pub fn lookup(&self, domain: &str) -> Option<bool> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(domain) {
            Some(entry) if entry.recorded_at.elapsed() <= self.ttl => Some(entry.allowed),
            Some(_) => {
                entries.remove(domain);
                None
            }
            None => None,
        }
    }

    /// Record a fresh verdict for a domain.
    pub fn record(&self, domain: &str, allowed: bool) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            domain.to_string(),
            CacheEntry {
                allowed,
                recorded_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One flag evaluation in the service response map.
#[derive(Debug, Deserialize)]
struct FlagEvaluation {
    value: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
enum FlagError {
    #[error("flag service request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("egress flag missing from response")]
    FlagMissing,
}

/// Client for the remote flag service.
pub struct FlagClient {
    config: DynamicFlagConfig,
    subject: String,
    http: reqwest::Client,
    cache: DecisionCache,
}

impl FlagClient {
    pub fn new(config: DynamicFlagConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(EVALUATION_TIMEOUT)
            .no_proxy()
            .build()
            .map_err(|e| ProxyError::Config(format!("flag client: {e}")))?;

        let subject = config.subject.clone().unwrap_or_else(local_username);
        let cache = DecisionCache::new(Duration::from_secs(config.cache_ttl_secs));

        Ok(Self {
            config,
            subject,
            http,
            cache,
        })
    }

    /// The failover mode applied when this layer reports
    /// [`FlagOutcome::Unavailable`].
    pub fn failover(&self) -> FailoverMode {
        self.config.failover
    }

    /// Evaluate the egress flag for a normalized domain.
    ///
    /// A live cache entry answers immediately. On a miss the remote service
    /// is queried (bounded); a successful verdict is cached and a usage
    /// record is reported on a detached task the caller never awaits.
    /// Reporting failures are logged and nothing more.
    pub async fn evaluate(&self, domain: &str) -> FlagOutcome {
        if let Some(allowed) = self.cache.lookup(domain) {
            return FlagOutcome::Cached(allowed);
        }

        match self.fetch_verdict(domain).await {
            Ok(allowed) => {
                self.cache.record(domain, allowed);
                self.report_usage(domain, allowed);
                FlagOutcome::Fresh(allowed)
            }
            Err(e) => {
                warn!(domain, error = %e, "flag evaluation failed");
                FlagOutcome::Unavailable
            }
        }
    }

    async fn fetch_verdict(&self, domain: &str) -> std::result::Result<bool, FlagError> {
        let url = format!(
            "{}/sdk/evalx/{}/user",
            self.config.evaluation_base_url.trim_end_matches('/'),
            self.config.client_id
        );
        let context = json!({
            "kind": "user",
            "key": domain,
            "username": self.subject,
        });

        let response = self
            .http
            .post(&url)
            .json(&context)
            .send()
            .await?
            .error_for_status()?;
        let flags: HashMap<String, FlagEvaluation> = response.json().await?;

        flags
            .get(EGRESS_FLAG_KEY)
            .and_then(|flag| flag.value.as_bool())
            .ok_or(FlagError::FlagMissing)
    }

    /// Fire-and-forget usage report. Detached by design: no handle is kept
    /// and completion is irrelevant to the connection's correctness.
    fn report_usage(&self, domain: &str, allowed: bool) {
        let http = self.http.clone();
        let url = format!(
            "{}/events/bulk/{}",
            self.config.events_base_url.trim_end_matches('/'),
            self.config.client_id
        );
        let events = json!([{
            "kind": "feature",
            "key": EGRESS_FLAG_KEY,
            "contextKeys": { "user": domain },
            "value": allowed,
            "creationDate": unix_millis(),
        }]);

        tokio::spawn(async move {
            if let Err(e) = http.post(&url).json(&events).send().await {
                debug!(error = %e, "flag usage report failed");
            }
        });
    }
}

fn local_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
