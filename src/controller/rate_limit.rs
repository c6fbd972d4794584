//! Shared record of the controller API's rate-limit window.
//!
//! The controller enforces one quota per account, so every client talking to
//! the same API shares a single [`RateLimitTracker`], handed out by a
//! [`RateLimitRegistry`] keyed on the API host.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// How long a limit with no reset hint blocks calls before one trial call is allowed.
const UNKNOWN_RESET_BACKOFF_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Clear,
    Limited {
        reset_at: Option<DateTime<Utc>>,
        since: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct TrackerInner {
    status: Status,
    remaining: Option<i64>,
    limit: Option<i64>,
    /// Last reset time the API reported, limited or not.
    reset_hint: Option<DateTime<Utc>>,
}

/// Point-in-time copy of the tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitState {
    pub limited: bool,
    pub reset_time: Option<DateTime<Utc>>,
    pub remaining: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug)]
pub struct RateLimitTracker {
    api: String,
    inner: Mutex<TrackerInner>,
}

impl RateLimitTracker {
    pub fn new(api: impl Into<String>) -> Self {
        Self {
            api: api.into(),
            inner: Mutex::new(TrackerInner {
                status: Status::Clear,
                remaining: None,
                limit: None,
                reset_hint: None,
            }),
        }
    }

    pub fn api(&self) -> &str {
        &self.api
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_limited(&self) -> bool {
        self.is_limited_at(Utc::now())
    }

    /// Limited state expires on its own once `now` reaches the reset time.
    pub fn is_limited_at(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        let status = inner.status;
        match status {
            Status::Clear => false,
            Status::Limited { reset_at, since } => {
                let expires = reset_at
                    .unwrap_or(since + Duration::seconds(UNKNOWN_RESET_BACKOFF_SECS));
                if now >= expires {
                    info!(api = %self.api, "Controller rate limit window has reset");
                    inner.status = Status::Clear;
                    inner.remaining = None;
                    inner.limit = None;
                    inner.reset_hint = None;
                    false
                } else {
                    true
                }
            }
        }
    }

    pub fn record_success(
        &self,
        remaining: Option<i64>,
        limit: Option<i64>,
        reset: Option<DateTime<Utc>>,
    ) {
        self.record_success_at(Utc::now(), remaining, limit, reset);
    }

    /// Counters from a successful response. Remaining calls win over any
    /// earlier reset hint since the API sends reset headers on every reply.
    pub fn record_success_at(
        &self,
        now: DateTime<Utc>,
        remaining: Option<i64>,
        limit: Option<i64>,
        reset: Option<DateTime<Utc>>,
    ) {
        let mut inner = self.lock();
        if remaining.is_some() {
            inner.remaining = remaining;
        }
        if limit.is_some() {
            inner.limit = limit;
        }
        if reset.is_some() {
            inner.reset_hint = reset;
        }

        match remaining {
            Some(r) if r > 0 => {
                if matches!(inner.status, Status::Limited { .. }) {
                    debug!(api = %self.api, remaining = r, "Calls remaining, clearing rate limit");
                }
                inner.status = Status::Clear;
            }
            Some(_) => {
                let live_hint = inner.reset_hint.filter(|hint| *hint > now);
                inner.reset_hint = live_hint;
                warn!(api = %self.api, reset = ?live_hint, "Controller quota exhausted");
                inner.status = Status::Limited {
                    reset_at: live_hint,
                    since: now,
                };
            }
            None => {}
        }
    }

    pub fn record_limited(&self, reset_time: Option<DateTime<Utc>>, retry_after_secs: Option<i64>) {
        self.record_limited_at(Utc::now(), reset_time, retry_after_secs);
    }

    /// Enter the limited state. An explicit reset time is preferred, then
    /// `now + retry_after`, else the reset stays unknown.
    pub fn record_limited_at(
        &self,
        now: DateTime<Utc>,
        reset_time: Option<DateTime<Utc>>,
        retry_after_secs: Option<i64>,
    ) {
        let reset_at = reset_time
            .or_else(|| retry_after_secs.map(|secs| now + Duration::seconds(secs.max(0))));

        let mut inner = self.lock();
        let remaining = inner.remaining;
        inner.remaining = remaining.map(|r| r.min(0));
        let live_hint = inner.reset_hint.filter(|hint| *hint > now);
        inner.reset_hint = reset_at.or(live_hint);
        inner.status = Status::Limited {
            reset_at: inner.reset_hint,
            since: now,
        };

        warn!(api = %self.api, reset = ?inner.reset_hint, "Controller API rate limited");
    }

    pub fn state(&self) -> RateLimitState {
        let inner = self.lock();
        let (limited, reset_time) = match inner.status {
            Status::Clear => (false, inner.reset_hint),
            Status::Limited { reset_at, .. } => (true, reset_at),
        };
        RateLimitState {
            limited,
            reset_time,
            remaining: inner.remaining,
            limit: inner.limit,
        }
    }
}

/// One tracker per destination API, shared by every client that targets it.
#[derive(Debug, Default)]
pub struct RateLimitRegistry {
    trackers: Mutex<HashMap<String, Arc<RateLimitTracker>>>,
}

impl RateLimitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracker_for(&self, base_url: &str) -> Arc<RateLimitTracker> {
        let key = api_key_for(base_url);
        let mut trackers = self.trackers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            trackers
                .entry(key.clone())
                .or_insert_with(|| Arc::new(RateLimitTracker::new(key))),
        )
    }
}

fn api_key_for(base_url: &str) -> String {
    reqwest::Url::parse(base_url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| base_url.trim_end_matches('/').to_string())
}
