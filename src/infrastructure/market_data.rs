//! Fast price feed over plain REST.
//!
//! Deliberately separate from the brokerage client: position re-pricing and
//! stop-loss checks keep working even when the brokerage session is
//! degraded. The feed answers with bare JSON arrays, or an object carrying
//! an "Error Message" field on failure.

use crate::domain::errors::BrokerError;
use crate::domain::ports::QuoteService;
use crate::domain::types::Candle;
use crate::infrastructure::core::http::with_query;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest_middleware::ClientWithMiddleware;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use tracing::debug;

pub struct FastQuoteClient {
    http: ClientWithMiddleware,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct QuoteRow {
    symbol: String,
    price: f64,
}

#[derive(Debug, Deserialize)]
struct CandleRow {
    date: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: u64,
}

impl FastQuoteClient {
    pub fn new(http: ClientWithMiddleware, base_url: String, api_key: String) -> Self {
        Self {
            http,
            base_url,
            api_key,
        }
    }

    async fn get_rows<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<Vec<T>, BrokerError> {
        let mut all_params: Vec<(&str, &str)> = params.to_vec();
        all_params.push(("apikey", self.api_key.as_str()));
        let url = with_query(&format!("{}{}", self.base_url, path), &all_params);

        let response = self.http.get(url).send().await?;
        let status = response.status();
        let text = response.text().await.map_err(BrokerError::from)?;

        if !status.is_success() {
            return Err(BrokerError::unavailable(format!("quote feed HTTP {status}")));
        }

        match serde_json::from_str::<Vec<T>>(&text) {
            Ok(rows) => Ok(rows),
            Err(_) => {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text)
                    && let Some(msg) = value.get("Error Message").and_then(|m| m.as_str())
                {
                    return Err(BrokerError::invalid(format!("quote feed: {msg}")));
                }
                Err(BrokerError::invalid("quote feed returned unexpected payload"))
            }
        }
    }
}

#[async_trait]
impl QuoteService for FastQuoteClient {
    async fn get_quote(&self, ticker: &str) -> Result<Decimal, BrokerError> {
        let rows: Vec<QuoteRow> = self.get_rows("/quote", &[("symbol", ticker)]).await?;
        let row = rows
            .into_iter()
            .find(|r| r.symbol.eq_ignore_ascii_case(ticker))
            .ok_or_else(|| BrokerError::invalid(format!("no quote for {ticker}")))?;

        to_decimal(row.price, ticker)
    }

    async fn get_quotes(
        &self,
        tickers: &[String],
    ) -> Result<HashMap<String, Decimal>, BrokerError> {
        if tickers.is_empty() {
            return Ok(HashMap::new());
        }

        let joined = tickers.join(",");
        let rows: Vec<QuoteRow> = self
            .get_rows("/quote", &[("symbol", joined.as_str())])
            .await?;

        debug!("FastQuote: batch of {} answered {} rows", tickers.len(), rows.len());

        let mut quotes = HashMap::new();
        for row in rows {
            // Rows the feed cannot price are simply absent from the result.
            if let Ok(price) = to_decimal(row.price, &row.symbol) {
                quotes.insert(row.symbol, price);
            }
        }
        Ok(quotes)
    }

    async fn get_daily_candles(
        &self,
        ticker: &str,
        days: u32,
    ) -> Result<Vec<Candle>, BrokerError> {
        let from = (Utc::now().date_naive() - chrono::Duration::days(i64::from(days)))
            .format("%Y-%m-%d")
            .to_string();

        let rows: Vec<CandleRow> = self
            .get_rows(
                "/historical-price-eod/full",
                &[("symbol", ticker), ("from", from.as_str())],
            )
            .await?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let date = NaiveDate::parse_from_str(&row.date[..row.date.len().min(10)], "%Y-%m-%d")
                .map_err(|_| BrokerError::invalid(format!("bad candle date: {}", row.date)))?;
            candles.push(Candle {
                date,
                open: to_decimal(row.open, ticker)?,
                high: to_decimal(row.high, ticker)?,
                low: to_decimal(row.low, ticker)?,
                close: to_decimal(row.close, ticker)?,
                volume: row.volume,
            });
        }

        // Feed returns newest first; callers expect chronological order.
        candles.sort_by_key(|c| c.date);
        Ok(candles)
    }
}

fn to_decimal(value: f64, ticker: &str) -> Result<Decimal, BrokerError> {
    Decimal::from_f64_retain(value)
        .ok_or_else(|| BrokerError::invalid(format!("unrepresentable price for {ticker}: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_rows_deserialize() {
        let body = r#"[{"symbol": "AAPL", "price": 189.95, "volume": 51230000}]"#;
        let rows: Vec<QuoteRow> = serde_json::from_str(body).unwrap();
        assert_eq!(rows[0].symbol, "AAPL");
        assert!((rows[0].price - 189.95).abs() < f64::EPSILON);
    }

    #[test]
    fn candle_rows_deserialize_and_truncate_date() {
        let body = r#"[{"date": "2025-06-02 00:00:00", "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5, "volume": 100}]"#;
        let rows: Vec<CandleRow> = serde_json::from_str(body).unwrap();
        let date =
            NaiveDate::parse_from_str(&rows[0].date[..10], "%Y-%m-%d").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2025, 6, 2).unwrap());
    }

    #[test]
    fn f64_prices_convert_exactly() {
        assert_eq!(to_decimal(50.0, "T").unwrap(), Decimal::from(50));
        assert!(to_decimal(f64::NAN, "T").is_err());
    }
}
