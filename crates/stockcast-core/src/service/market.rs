use serde::Deserialize;
use tracing::{debug, error};

/// Latest daily bar for a symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bar {
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum MarketError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("no data found for symbol: {0}")]
    NoData(String),
}

/// Source of current market prices. Calls block.
pub trait MarketDataSource: Send + Sync {
    fn latest(&self, symbol: &str) -> Result<Bar, MarketError>;
}

/// Yahoo Finance chart API.
pub struct YahooFinance {
    base_url: String,
}

impl YahooFinance {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn url(&self, symbol: &str) -> Result<reqwest::Url, MarketError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| MarketError::Http(format!("bad base URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| MarketError::Http("base URL cannot take a path".to_string()))?
            .pop_if_empty()
            .push(symbol);
        url.query_pairs_mut()
            .append_pair("range", "1d")
            .append_pair("interval", "1d");
        Ok(url)
    }
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<Quote>,
}

#[derive(Debug, Default, Deserialize)]
struct Quote {
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

fn last_value(series: &[Option<f64>]) -> Option<f64> {
    series.iter().rev().find_map(|v| *v)
}

fn parse_chart(symbol: &str, body: &str) -> Result<Bar, MarketError> {
    let response: ChartResponse =
        serde_json::from_str(body).map_err(|e| MarketError::Http(e.to_string()))?;
    let quote = response
        .chart
        .result
        .and_then(|r| r.into_iter().next())
        .and_then(|r| r.indicators.quote.into_iter().next())
        .ok_or_else(|| MarketError::NoData(symbol.to_string()))?;

    let no_data = || MarketError::NoData(symbol.to_string());
    Ok(Bar {
        close: last_value(&quote.close).ok_or_else(no_data)?,
        high: last_value(&quote.high).ok_or_else(no_data)?,
        low: last_value(&quote.low).ok_or_else(no_data)?,
        // Forex bars often report no volume
        volume: last_value(&quote.volume).unwrap_or(0.0),
    })
}

impl MarketDataSource for YahooFinance {
    fn latest(&self, symbol: &str) -> Result<Bar, MarketError> {
        let client = crate::util::http::client()
            .ok_or_else(|| MarketError::Http("HTTP client unavailable".to_string()))?;
        let url = self.url(symbol)?;
        debug!("Fetching market data: {}", url);

        let result = client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.text());
        let body = match result {
            Ok(body) => body,
            Err(e) => {
                error!("Error fetching market data for {}: {}", symbol, e);
                return Err(MarketError::Http(e.to_string()));
            }
        };
        parse_chart(symbol, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chart_takes_last_values() {
        let body = r#"{"chart": {"result": [{"indicators": {"quote": [{
            "close": [100.0, null, 101.5],
            "high": [102.0, 103.0, null],
            "low": [99.0, 98.5, 99.5],
            "volume": [1000, 2000, 3000]
        }]}}], "error": null}}"#;
        let bar = parse_chart("INFY.NS", body).unwrap();
        assert_eq!(bar.close, 101.5);
        assert_eq!(bar.high, 103.0);
        assert_eq!(bar.low, 99.5);
        assert_eq!(bar.volume, 3000.0);
    }

    #[test]
    fn test_parse_chart_without_volume() {
        let body = r#"{"chart": {"result": [{"indicators": {"quote": [{
            "close": [1.1], "high": [1.2], "low": [1.0], "volume": [null]
        }]}}]}}"#;
        assert_eq!(parse_chart("EURUSD=X", body).unwrap().volume, 0.0);
    }

    #[test]
    fn test_parse_chart_no_data() {
        let body = r#"{"chart": {"result": null, "error": {"code": "Not Found"}}}"#;
        assert!(matches!(parse_chart("NOPE", body), Err(MarketError::NoData(_))));

        let body = r#"{"chart": {"result": [{"indicators": {"quote": [{"close": []}]}}]}}"#;
        assert!(matches!(parse_chart("NOPE", body), Err(MarketError::NoData(_))));
    }

    #[test]
    fn test_url_appends_symbol() {
        let yahoo = YahooFinance::new("https://query1.finance.yahoo.com/v8/finance/chart");
        let url = yahoo.url("M&M.NS").unwrap();
        assert_eq!(
            url.as_str(),
            "https://query1.finance.yahoo.com/v8/finance/chart/M&M.NS?range=1d&interval=1d"
        );
    }
}
