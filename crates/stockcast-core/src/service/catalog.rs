//! Fixed symbol catalogs. Indices are what the prediction forms submit and
//! what the stock model was trained on, so the order is significant.

use crate::error::PredictionError;

/// NSE tickers, indexed by position.
pub const STOCKS: [&str; 49] = [
    "ADANIPORTS.NS",
    "APOLLOHOSP.NS",
    "ASIANPAINT.NS",
    "AXISBANK.NS",
    "BAJAJ-AUTO.NS",
    "BAJAJFINSV.NS",
    "BPCL.NS",
    "BRITANNIA.NS",
    "CIPLA.NS",
    "COALINDIA.NS",
    "DIVISLAB.NS",
    "DRREDDY.NS",
    "EICHERMOT.NS",
    "GRASIM.NS",
    "HCLTECH.NS",
    "HDFCLIFE.NS",
    "HDFCBANK.NS",
    "HEROMOTOCO.NS",
    "HINDALCO.NS",
    "HINDUNILVR.NS",
    "ICICIBANK.NS",
    "INDUSINDBK.NS",
    "INFY.NS",
    "ITC.NS",
    "JIOFIN.NS",
    "JSWSTEEL.NS",
    "KOTAKBANK.NS",
    "LT.NS",
    "LTIM.NS",
    "M&M.NS",
    "MARUTI.NS",
    "NESTLEIND.NS",
    "NIFTY50.NS",
    "NTPC.NS",
    "ONGC.NS",
    "POWERGRD.NS",
    "RELIANCE.NS",
    "SBILIFE.NS",
    "SBIN.NS",
    "SUNPHARMA.NS",
    "TCS.NS",
    "TATACONSUM.NS",
    "TATAMOTORS.NS",
    "TATASTEEL.NS",
    "TECHM.NS",
    "TITAN.NS",
    "ULTRACEMCO.NS",
    "UPL.NS",
    "WIPRO.NS",
];

/// One forex pair and quote side, with its own model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForexPair {
    pub name: &'static str,
    pub model: &'static str,
    pub symbol: &'static str,
}

const fn pair(name: &'static str, model: &'static str, symbol: &'static str) -> ForexPair {
    ForexPair {
        name,
        model,
        symbol,
    }
}

pub const FOREX: [ForexPair; 16] = [
    pair("AUD/USD ASK", "AUD-USD-ASK", "AUDUSD=X"),
    pair("AUD/USD BID", "AUD-USD-BID", "AUDUSD=X"),
    pair("EUR/USD ASK", "EUR-USD-ASK", "EURUSD=X"),
    pair("EUR/USD BID", "EUR-USD-BID", "EURUSD=X"),
    pair("GBP/USD ASK", "GBP-USD-ASK", "GBPUSD=X"),
    pair("GBP/USD BID", "GBP-USD-BID", "GBPUSD=X"),
    pair("NZD/USD ASK", "NZD-USD-ASK", "NZDUSD=X"),
    pair("NZD/USD BID", "NZD-USD-BID", "NZDUSD=X"),
    pair("USD/CAD ASK", "USD-CAD-ASK", "USDCAD=X"),
    pair("USD/CAD BID", "USD-CAD-BID", "USDCAD=X"),
    pair("USD/CHF ASK", "USD-CHF-ASK", "USDCHF=X"),
    pair("USD/CHF BID", "USD-CHF-BID", "USDCHF=X"),
    pair("USD/JPY ASK", "USD-JPY-ASK", "USDJPY=X"),
    pair("USD/JPY BID", "USD-JPY-BID", "USDJPY=X"),
    pair("XAG/USD ASK", "XAG-USD-ASK", "XAGUSD=X"),
    pair("XAG/USD BID", "XAG-USD-BID", "XAGUSD=X"),
];

pub const STOCK_FIELD: &str = "company_symbol";
pub const FOREX_FIELD: &str = "forex_symbol";

/// Parse a submitted catalog index.
///
/// `field` names the form field in error messages.
pub fn parse_index(
    raw: Option<&str>,
    len: usize,
    field: &'static str,
) -> Result<usize, PredictionError> {
    let raw = raw.map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return Err(PredictionError::MissingSymbol(field));
    }
    let index: i64 = raw
        .parse()
        .map_err(|_| PredictionError::NotAnInteger(field))?;
    usize::try_from(index)
        .ok()
        .filter(|i| *i < len)
        .ok_or(PredictionError::UnknownSymbol(field))
}

pub fn stock(raw: Option<&str>) -> Result<(usize, &'static str), PredictionError> {
    let index = parse_index(raw, STOCKS.len(), STOCK_FIELD)?;
    Ok((index, STOCKS[index]))
}

pub fn forex(raw: Option<&str>) -> Result<(usize, ForexPair), PredictionError> {
    let index = parse_index(raw, FOREX.len(), FOREX_FIELD)?;
    Ok((index, FOREX[index]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_shape() {
        assert_eq!(STOCKS[0], "ADANIPORTS.NS");
        assert_eq!(STOCKS[29], "M&M.NS");
        assert_eq!(STOCKS[48], "WIPRO.NS");
        assert_eq!(FOREX[15].model, "XAG-USD-BID");
        assert!(FOREX.iter().all(|p| p.symbol.ends_with("=X")));
    }

    #[test]
    fn test_parse_index_messages() {
        let err = stock(None).unwrap_err();
        assert_eq!(err.to_string(), "Missing company_symbol");

        let err = stock(Some("abc")).unwrap_err();
        assert_eq!(err.to_string(), "Invalid company_symbol. It should be an integer.");

        let err = stock(Some("49")).unwrap_err();
        assert_eq!(err.to_string(), "Invalid company_symbol.");

        let err = forex(Some("-1")).unwrap_err();
        assert_eq!(err.to_string(), "Invalid forex_symbol.");

        let err = forex(Some("")).unwrap_err();
        assert_eq!(err.to_string(), "Missing forex_symbol");
    }

    #[test]
    fn test_parse_index_ok() {
        assert_eq!(stock(Some("36")).unwrap(), (36, "RELIANCE.NS"));
        let (i, pair) = forex(Some(" 2 ")).unwrap();
        assert_eq!(i, 2);
        assert_eq!(pair.name, "EUR/USD ASK");
    }
}
