use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::usage::ApiUsage;
use crate::config::{PredictionConfig, TablesConfig};
use crate::store::{self, get_f64, get_str, Item, PutCondition, RecordStore};
use crate::util::{format_timestamp, parse_timestamp, truncate_string, Clock, SystemClock};

/// Score used whenever sentiment cannot be determined.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Longest text sent for classification.
pub const MAX_SAMPLE_CHARS: usize = 5000;

pub const MAX_ARTICLES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum NewsError {
    #[error("news API key not configured")]
    NotConfigured,

    #[error("news request failed: {0}")]
    Http(String),
}

/// Headline search. Calls block.
pub trait NewsSource: Send + Sync {
    fn search(&self, query: &str) -> Result<Vec<Article>, NewsError>;
}

/// GNews search API.
pub struct GNewsClient {
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct GNewsResponse {
    #[serde(default)]
    articles: Vec<Article>,
}

impl GNewsClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

impl NewsSource for GNewsClient {
    fn search(&self, query: &str) -> Result<Vec<Article>, NewsError> {
        if self.api_key.is_empty() {
            return Err(NewsError::NotConfigured);
        }
        let client = crate::util::http::client()
            .ok_or_else(|| NewsError::Http("HTTP client unavailable".to_string()))?;

        let max = MAX_ARTICLES.to_string();
        let response = client
            .get(&self.base_url)
            .query(&[
                ("q", query),
                ("lang", "en"),
                ("country", "us"),
                ("max", max.as_str()),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json::<GNewsResponse>())
            .map_err(|e| NewsError::Http(e.to_string()))?;

        Ok(response.articles)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
    Mixed,
}

impl Sentiment {
    pub fn score(self) -> f64 {
        match self {
            Sentiment::Positive => 0.9,
            Sentiment::Negative => 0.1,
            Sentiment::Neutral | Sentiment::Mixed => NEUTRAL_SCORE,
        }
    }
}

pub trait SentimentAnalyzer: Send + Sync {
    fn classify(&self, text: &str) -> Sentiment;
}

const POSITIVE_WORDS: &[&str] = &[
    "beat", "beats", "boost", "bullish", "gain", "gains", "growth", "grow", "grows", "high",
    "jump", "jumps", "outperform", "profit", "profits", "rally", "rallies", "record", "rise",
    "rises", "soar", "soars", "strong", "surge", "surges", "up", "upgrade", "win", "wins",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bearish", "crash", "cut", "cuts", "decline", "declines", "down", "downgrade", "drop",
    "drops", "fall", "falls", "fraud", "loss", "losses", "low", "miss", "misses", "plunge",
    "plunges", "probe", "slump", "slumps", "weak", "warning",
];

/// Word-count classifier over fixed finance word lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexiconAnalyzer;

impl SentimentAnalyzer for LexiconAnalyzer {
    fn classify(&self, text: &str) -> Sentiment {
        let lower = text.to_lowercase();
        let (mut pos, mut neg) = (0usize, 0usize);
        for word in lower.split(|c: char| !c.is_alphanumeric()) {
            if POSITIVE_WORDS.contains(&word) {
                pos += 1;
            } else if NEGATIVE_WORDS.contains(&word) {
                neg += 1;
            }
        }
        match (pos, neg) {
            (0, 0) => Sentiment::Neutral,
            (p, n) if p == n => Sentiment::Mixed,
            (p, n) if p > n => Sentiment::Positive,
            _ => Sentiment::Negative,
        }
    }
}

/// Company sentiment from recent headlines, cached in the store.
pub struct SentimentService {
    store: Arc<dyn RecordStore>,
    news_table: String,
    sentiment_table: String,
    news: Arc<dyn NewsSource>,
    analyzer: Arc<dyn SentimentAnalyzer>,
    usage: Arc<ApiUsage>,
    clock: Arc<dyn Clock>,
    news_ttl: Duration,
    sentiment_ttl: Duration,
}

impl SentimentService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        tables: &TablesConfig,
        config: &PredictionConfig,
        news: Arc<dyn NewsSource>,
        usage: Arc<ApiUsage>,
    ) -> Self {
        Self {
            store,
            news_table: tables.news_cache.clone(),
            sentiment_table: tables.sentiment_cache.clone(),
            news,
            analyzer: Arc::new(LexiconAnalyzer),
            usage,
            clock: Arc::new(SystemClock),
            news_ttl: Duration::hours(config.news_cache_hours),
            sentiment_ttl: Duration::seconds(config.sentiment_cache_secs),
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn SentimentAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn is_fresh(&self, item: &Item, ttl: Duration) -> bool {
        get_str(item, "Timestamp")
            .and_then(parse_timestamp)
            .is_some_and(|at| self.clock.now() - at < ttl)
    }

    fn cached(&self, table: &str, company: &str) -> Option<Item> {
        match self.store.get(table, &store::key("Company", company)) {
            Ok(item) => item,
            Err(e) => {
                warn!("Error reading {} cache: {}", table, e);
                None
            }
        }
    }

    fn write_cache(&self, table: &str, mut item: Item) {
        item.insert(
            "Timestamp".into(),
            Value::String(format_timestamp(self.clock.now())),
        );
        if let Err(e) = self.store.put(table, item, PutCondition::Always) {
            warn!("Error writing {} cache: {}", table, e);
        }
    }

    /// Recent articles, from cache when fresh. Empty on any failure.
    pub fn recent_news(&self, company: &str) -> Vec<Article> {
        if let Some(item) = self.cached(&self.news_table, company) {
            if self.is_fresh(&item, self.news_ttl) {
                if let Some(articles) = item.get("Articles") {
                    if let Ok(articles) = serde_json::from_value(articles.clone()) {
                        return articles;
                    }
                }
            }
        }

        if !self.usage.news_budget_left() {
            info!("Daily news API limit reached; using cached data only");
            return Vec::new();
        }

        let articles = match self.news.search(company) {
            Ok(articles) => articles,
            Err(e) => {
                warn!("Error fetching news for {}: {}", company, e);
                return Vec::new();
            }
        };
        self.usage.record_news_request();

        let mut item = store::key("Company", company);
        item.insert(
            "Articles".into(),
            serde_json::to_value(&articles).unwrap_or(Value::Array(Vec::new())),
        );
        self.write_cache(&self.news_table, item);
        articles
    }

    /// Sentiment score in [0, 1]. Falls back to neutral on any failure.
    pub fn score(&self, company: &str) -> f64 {
        if let Some(item) = self.cached(&self.sentiment_table, company) {
            if self.is_fresh(&item, self.sentiment_ttl) {
                if let Some(score) = get_f64(&item, "Score") {
                    debug!("Using cached sentiment for {}", company);
                    return score;
                }
            }
        }

        if !self.usage.sentiment_budget_left() {
            info!("Monthly sentiment budget reached; using neutral sentiment");
            return NEUTRAL_SCORE;
        }

        let articles = self.recent_news(company);
        if articles.is_empty() {
            return NEUTRAL_SCORE;
        }

        let titles: Vec<&str> = articles.iter().map(|a| a.title.as_str()).collect();
        let sample = truncate_to_chars(&titles.join(" "), MAX_SAMPLE_CHARS);
        let score = self.analyzer.classify(&sample).score();

        let mut item = store::key("Company", company);
        item.insert("Score".into(), Value::String(score.to_string()));
        self.write_cache(&self.sentiment_table, item);
        self.usage
            .record_sentiment_chars(sample.chars().count() as u64);
        score
    }
}

fn truncate_to_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => truncate_string(text, end, ""),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::{app_tables, MemoryRecordStore};
    use crate::util::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedNews {
        titles: Vec<&'static str>,
        calls: AtomicUsize,
    }

    impl NewsSource for FixedNews {
        fn search(&self, _query: &str) -> Result<Vec<Article>, NewsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .titles
                .iter()
                .map(|t| Article {
                    title: t.to_string(),
                    description: None,
                    url: None,
                    published_at: None,
                })
                .collect())
        }
    }

    struct FailingNews;

    impl NewsSource for FailingNews {
        fn search(&self, _query: &str) -> Result<Vec<Article>, NewsError> {
            Err(NewsError::Http("boom".into()))
        }
    }

    fn service(
        news: Arc<dyn NewsSource>,
    ) -> (Arc<ManualClock>, Arc<ApiUsage>, SentimentService) {
        let config = Config::default();
        let store = Arc::new(MemoryRecordStore::with_tables(&app_tables(&config)));
        let clock = Arc::new(ManualClock::default());
        let usage = Arc::new(ApiUsage::with_clock(100, 45_000, clock.clone()));
        let svc = SentimentService::new(store, &config.tables, &config.prediction, news, usage.clone())
            .with_clock(clock.clone());
        (clock, usage, svc)
    }

    #[test]
    fn test_lexicon() {
        let lex = LexiconAnalyzer;
        assert_eq!(lex.classify("Shares surge on record profit"), Sentiment::Positive);
        assert_eq!(lex.classify("Stock plunges after fraud probe"), Sentiment::Negative);
        assert_eq!(lex.classify("Company holds annual meeting"), Sentiment::Neutral);
        assert_eq!(lex.classify("Profit rises but shares fall"), Sentiment::Positive);
        assert_eq!(lex.classify("Gains offset by losses"), Sentiment::Mixed);
        assert_eq!(Sentiment::Mixed.score(), 0.5);
    }

    #[test]
    fn test_score_is_cached() {
        let news = Arc::new(FixedNews {
            titles: vec!["Infosys shares surge", "Infosys profit jumps"],
            calls: AtomicUsize::new(0),
        });
        let (clock, usage, svc) = service(news.clone());

        assert_eq!(svc.score("INFY.NS"), 0.9);
        assert_eq!(svc.score("INFY.NS"), 0.9);
        assert_eq!(news.calls.load(Ordering::SeqCst), 1);
        assert_eq!(usage.news_requests(), 1);
        assert!(usage.sentiment_chars() > 0);

        // sentiment expires after an hour, news after a day
        clock.advance(Duration::minutes(61));
        assert_eq!(svc.score("INFY.NS"), 0.9);
        assert_eq!(news.calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::hours(24));
        assert_eq!(svc.score("INFY.NS"), 0.9);
        assert_eq!(news.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fallbacks() {
        let (_, _, svc) = service(Arc::new(FailingNews));
        assert_eq!(svc.score("TCS.NS"), NEUTRAL_SCORE);
        assert!(svc.recent_news("TCS.NS").is_empty());
    }

    #[test]
    fn test_budget_exhausted() {
        let news = Arc::new(FixedNews {
            titles: vec!["TCS shares surge"],
            calls: AtomicUsize::new(0),
        });
        let (_, usage, svc) = service(news.clone());
        usage.record_sentiment_chars(45_000);
        assert_eq!(svc.score("TCS.NS"), NEUTRAL_SCORE);
        assert_eq!(news.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_truncate_to_chars() {
        assert_eq!(truncate_to_chars("héllo", 2), "hé");
        assert_eq!(truncate_to_chars("abc", 10), "abc");
    }
}
