use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use super::catalog::{self, ForexPair};
use super::market::MarketDataSource;
use super::model::{ModelStore, STOCK_MODEL};
use super::sentiment::SentimentService;
use crate::error::{PredictionError, StoreError};
use crate::store::{self, get_str, PutCondition, Query, RecordStore};
use crate::util::{format_timestamp, Clock, SystemClock};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StockPrediction {
    pub index: usize,
    pub company: &'static str,
    pub close: f64,
    pub sentiment: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForexPrediction {
    pub index: usize,
    pub pair: &'static str,
    pub close: f64,
    pub value: f64,
}

/// A logged prediction, as listed on the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionRecord {
    pub timestamp: String,
    pub kind: String,
    pub subject: String,
    pub value: String,
}

pub struct PredictionService {
    store: Arc<dyn RecordStore>,
    table: String,
    models: ModelStore,
    market: Arc<dyn MarketDataSource>,
    sentiment: Arc<SentimentService>,
    clock: Arc<dyn Clock>,
}

impl PredictionService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        table: impl Into<String>,
        models: ModelStore,
        market: Arc<dyn MarketDataSource>,
        sentiment: Arc<SentimentService>,
    ) -> Self {
        Self {
            store,
            table: table.into(),
            models,
            market,
            sentiment,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn predict_stock(
        &self,
        user: &str,
        raw_symbol: Option<&str>,
    ) -> Result<StockPrediction, PredictionError> {
        let (index, company) = catalog::stock(raw_symbol)?;

        let bar = self.market.latest(company).map_err(|e| {
            error!("Error fetching closing price for {}: {}", company, e);
            PredictionError::MarketData("stock")
        })?;
        let model = self.models.load(STOCK_MODEL)?;
        let sentiment = self.sentiment.score(company);

        let value = model.predict(&[
            ("Close_Lagged", bar.close),
            ("Sentiment_Score", sentiment),
            ("Company", index as f64),
        ])?;

        self.log(user, "Stock", ("Company", company), value);
        info!("Stock prediction for {}: {:.4}", company, value);
        Ok(StockPrediction {
            index,
            company,
            close: bar.close,
            sentiment,
            value,
        })
    }

    pub fn predict_forex(
        &self,
        user: &str,
        raw_symbol: Option<&str>,
    ) -> Result<ForexPrediction, PredictionError> {
        let (index, ForexPair { name, model, symbol }) = catalog::forex(raw_symbol)?;

        let model = self.models.load(model)?;
        let bar = self.market.latest(symbol).map_err(|e| {
            error!("Error fetching forex data for {}: {}", symbol, e);
            PredictionError::MarketData("forex")
        })?;

        let value = model.predict(&[
            ("Close", bar.close),
            ("High", bar.high),
            ("Low", bar.low),
            ("Volume", bar.volume),
        ])?;

        self.log(user, "Forex", ("ForexPair", name), value);
        info!("Forex prediction for {}: {:.6}", name, value);
        Ok(ForexPrediction {
            index,
            pair: name,
            close: bar.close,
            value,
        })
    }

    /// Write a prediction row. Failures are logged, never returned.
    fn log(&self, user: &str, kind: &str, subject: (&str, &str), value: f64) {
        let mut item = store::compound_key(
            ("UserId", user),
            ("Timestamp", format_timestamp(self.clock.now())),
        );
        item.insert("PredictionType".into(), Value::from(kind));
        item.insert(subject.0.into(), Value::from(subject.1));
        item.insert("PredictionValue".into(), Value::String(value.to_string()));

        if let Err(e) = self.store.put(&self.table, item, PutCondition::Always) {
            error!("Error logging prediction: {}", e);
        }
    }

    /// Most recent predictions first.
    pub fn recent(&self, user: &str, limit: usize) -> Result<Vec<PredictionRecord>, StoreError> {
        let items = self.store.query(
            &self.table,
            &Query::partition("UserId", user).newest_first().limit(limit),
        )?;
        Ok(items
            .iter()
            .map(|item| PredictionRecord {
                timestamp: get_str(item, "Timestamp").unwrap_or_default().to_string(),
                kind: get_str(item, "PredictionType").unwrap_or_default().to_string(),
                subject: get_str(item, "Company")
                    .or_else(|| get_str(item, "ForexPair"))
                    .unwrap_or_default()
                    .to_string(),
                value: get_str(item, "PredictionValue").unwrap_or_default().to_string(),
            })
            .collect())
    }
}
