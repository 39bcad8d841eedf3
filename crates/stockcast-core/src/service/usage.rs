use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::util::{Clock, SystemClock};

/// Fixed-window request limiter, one window per user.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: DashMap<String, (DateTime<Utc>, u32)>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: DashMap::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// `limit` requests per hour.
    pub fn per_hour(limit: u32) -> Self {
        Self::new(limit, Duration::hours(1))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Count one request. Returns false once the user is over the limit.
    pub fn check(&self, user: &str) -> bool {
        let now = self.clock.now();
        let mut entry = self.windows.entry(user.to_string()).or_insert((now, 0));
        let (started, count) = entry.value_mut();
        if now - *started >= self.window {
            *started = now;
            *count = 0;
        }
        if *count >= self.limit {
            warn!("Rate limit exceeded for {}", user);
            return false;
        }
        *count += 1;
        true
    }

    /// Requests left in the user's current window.
    pub fn remaining(&self, user: &str) -> u32 {
        let now = self.clock.now();
        match self.windows.get(user) {
            Some(entry) if now - entry.0 < self.window => self.limit.saturating_sub(entry.1),
            _ => self.limit,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    started: DateTime<Utc>,
    value: u64,
}

impl Counter {
    fn current(&mut self, now: DateTime<Utc>, period: Duration) -> &mut u64 {
        if now - self.started >= period {
            self.started = now;
            self.value = 0;
        }
        &mut self.value
    }
}

/// Snapshot shown on the usage page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub news_requests_today: u64,
    pub news_daily_limit: u64,
    pub sentiment_chars_this_month: u64,
    pub sentiment_monthly_limit: u64,
}

/// Third-party API usage: news requests per day and sentiment characters per
/// 30 days.
pub struct ApiUsage {
    news: Mutex<Counter>,
    sentiment: Mutex<Counter>,
    news_daily_limit: u64,
    sentiment_monthly_limit: u64,
    clock: Arc<dyn Clock>,
}

const DAY: i64 = 24 * 3600;
const MONTH: i64 = 30 * DAY;

impl ApiUsage {
    pub fn new(news_daily_limit: u64, sentiment_monthly_limit: u64) -> Self {
        Self::with_clock(news_daily_limit, sentiment_monthly_limit, Arc::new(SystemClock))
    }

    pub fn with_clock(
        news_daily_limit: u64,
        sentiment_monthly_limit: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        let fresh = Counter {
            started: now,
            value: 0,
        };
        Self {
            news: Mutex::new(fresh),
            sentiment: Mutex::new(fresh),
            news_daily_limit,
            sentiment_monthly_limit,
            clock,
        }
    }

    fn read(&self, counter: &Mutex<Counter>, period: i64) -> u64 {
        let mut counter = counter.lock().unwrap_or_else(|e| e.into_inner());
        *counter.current(self.clock.now(), Duration::seconds(period))
    }

    fn add(&self, counter: &Mutex<Counter>, period: i64, amount: u64) {
        let mut counter = counter.lock().unwrap_or_else(|e| e.into_inner());
        let value = counter.current(self.clock.now(), Duration::seconds(period));
        *value = value.saturating_add(amount);
    }

    pub fn news_requests(&self) -> u64 {
        self.read(&self.news, DAY)
    }

    pub fn news_budget_left(&self) -> bool {
        self.news_requests() < self.news_daily_limit
    }

    pub fn record_news_request(&self) {
        self.add(&self.news, DAY, 1);
        debug!("News requests today: {}", self.news_requests());
    }

    pub fn sentiment_chars(&self) -> u64 {
        self.read(&self.sentiment, MONTH)
    }

    pub fn sentiment_budget_left(&self) -> bool {
        self.sentiment_chars() < self.sentiment_monthly_limit
    }

    pub fn record_sentiment_chars(&self, chars: u64) {
        self.add(&self.sentiment, MONTH, chars);
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            news_requests_today: self.news_requests(),
            news_daily_limit: self.news_daily_limit,
            sentiment_chars_this_month: self.sentiment_chars(),
            sentiment_monthly_limit: self.sentiment_monthly_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ManualClock;

    #[test]
    fn test_rate_limiter_window() {
        let clock = Arc::new(ManualClock::default());
        let limiter = RateLimiter::per_hour(5).with_clock(clock.clone());

        for _ in 0..5 {
            assert!(limiter.check("alice"));
        }
        assert!(!limiter.check("alice"));
        assert_eq!(limiter.remaining("alice"), 0);
        assert!(limiter.check("bob"));

        clock.advance(Duration::minutes(59));
        assert!(!limiter.check("alice"));

        clock.advance(Duration::minutes(1));
        assert_eq!(limiter.remaining("alice"), 5);
        assert!(limiter.check("alice"));
        assert_eq!(limiter.remaining("alice"), 4);
    }

    #[test]
    fn test_api_usage_counters_reset() {
        let clock = Arc::new(ManualClock::default());
        let usage = ApiUsage::with_clock(2, 100, clock.clone());

        usage.record_news_request();
        assert!(usage.news_budget_left());
        usage.record_news_request();
        assert!(!usage.news_budget_left());

        usage.record_sentiment_chars(60);
        usage.record_sentiment_chars(40);
        assert!(!usage.sentiment_budget_left());

        clock.advance(Duration::days(1));
        assert_eq!(usage.news_requests(), 0);
        assert_eq!(usage.sentiment_chars(), 100);

        clock.advance(Duration::days(29));
        let snap = usage.snapshot();
        assert_eq!(snap.sentiment_chars_this_month, 0);
        assert_eq!(snap.news_daily_limit, 2);
    }
}
