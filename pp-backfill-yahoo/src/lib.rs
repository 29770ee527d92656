//! Yahoo Finance chart-API backfill connector.
//!
//! Implements [`BackfillProvider`] against Yahoo's undocumented `v8/finance/chart`
//! endpoint. Vendor symbol rewriting is delegated to
//! [`pp_connector_figi::normalize`] rather than duplicated here.
#![warn(missing_docs)]

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use pp_core::connector::{BackfillProvider, Provider};
use pp_core::error::ProviderPlaneError;
use pp_core::types::{
    AdjustedBar, Capabilities, CapabilityMask, DateRange, Granularity, HistoricalBar, PrimaryKind,
    ProviderId, RateLimitProfile,
};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

fn chart_base_url() -> String {
    "https://query1.finance.yahoo.com/v8/finance/chart".to_string()
}

fn interval_str(granularity: Granularity) -> &'static str {
    match granularity {
        Granularity::Daily => "1d",
        Granularity::Hourly => "1h",
        Granularity::Minute => "1m",
    }
}

fn day_start_unix(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .expect("midnight is always a valid time")
        .and_utc()
        .timestamp()
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
    #[serde(default)]
    events: Option<ChartEvents>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<QuoteIndicator>,
    #[serde(default)]
    adjclose: Option<Vec<AdjCloseIndicator>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct QuoteIndicator {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<u64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseIndicator {
    #[serde(default)]
    adjclose: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize, Default)]
struct ChartEvents {
    #[serde(default)]
    dividends: HashMap<String, DividendEvent>,
    #[serde(default)]
    splits: HashMap<String, SplitEvent>,
}

#[derive(Debug, Deserialize)]
struct DividendEvent {
    amount: f64,
}

#[derive(Debug, Deserialize)]
struct SplitEvent {
    numerator: f64,
    denominator: f64,
}

/// One unadjusted session built from the chart response, kept alongside the
/// raw event lookups needed to enrich it into an [`AdjustedBar`].
struct RawSession {
    bar: HistoricalBar,
    adjusted_close: Option<Decimal>,
    split_factor: Option<Decimal>,
    dividend_amount: Option<Decimal>,
}

/// Backfill connector for Yahoo Finance's chart API.
pub struct YahooBackfillProvider {
    id: ProviderId,
    client: reqwest::Client,
    base_url: String,
    capabilities: Capabilities,
}

impl Default for YahooBackfillProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl YahooBackfillProvider {
    /// Build a provider against the production Yahoo endpoint.
    #[must_use]
    pub fn new() -> Self {
        Self::with_base_url(chart_base_url())
    }

    /// Build a provider against a non-default base URL, for tests.
    #[must_use]
    fn with_base_url(base_url: String) -> Self {
        Self {
            id: ProviderId::new("yahoo"),
            client: reqwest::Client::new(),
            base_url,
            capabilities: Capabilities {
                primary_kind: PrimaryKind::Backfill,
                mask: CapabilityMask::BACKFILL | CapabilityMask::BACKFILL_ADJUSTED,
                max_depth_levels: None,
                supports_adjusted: true,
                supports_intraday: true,
                supports_historical_trades: false,
                supports_historical_quotes: false,
                supports_auctions: false,
                markets: vec!["US".to_string()],
                rate_limit: RateLimitProfile {
                    max_requests: 2_000,
                    window_ms: 60 * 60 * 1_000,
                    min_inter_request_delay_ms: 500,
                },
            },
        }
    }

    async fn fetch_chart(
        &self,
        symbol: &str,
        range: DateRange,
        granularity: Granularity,
    ) -> Result<ChartResult, ProviderPlaneError> {
        let vendor_symbol = pp_connector_figi::normalize(symbol, "yahoo");
        let period1 = day_start_unix(range.from);
        let period2 = day_start_unix(range.to.succ_opt().unwrap_or(range.to));

        let response = self
            .client
            .get(format!("{}/{vendor_symbol}", self.base_url))
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .query(&[
                ("period1", period1.to_string()),
                ("period2", period2.to_string()),
                ("interval", interval_str(granularity).to_string()),
                ("events", "div,splits".to_string()),
            ])
            .send()
            .await
            .map_err(|err| {
                ProviderPlaneError::transient("yahoo", format!("request failed: {err}"))
            })?;

        if !response.status().is_success() {
            return Err(ProviderPlaneError::transient(
                "yahoo",
                format!("unexpected status {}", response.status()),
            ));
        }

        let body = response.text().await.map_err(|err| {
            ProviderPlaneError::transient("yahoo", format!("body read failed: {err}"))
        })?;
        let envelope: ChartEnvelope = serde_json::from_str(&body)
            .map_err(|_| ProviderPlaneError::malformed("yahoo", &body))?;

        if let Some(error) = envelope.chart.error {
            return Err(classify_chart_error(symbol, &error));
        }
        envelope
            .chart
            .result
            .and_then(|mut results| {
                if results.is_empty() {
                    None
                } else {
                    Some(results.remove(0))
                }
            })
            .ok_or_else(|| ProviderPlaneError::not_found(format!("bars for {symbol}")))
    }

    /// Build per-session bars, skipping any session with a missing OHLC value
    /// (Yahoo pads non-trading sessions with nulls rather than omitting them).
    fn build_sessions(symbol: &str, result: &ChartResult) -> Vec<RawSession> {
        let Some(timestamps) = &result.timestamp else {
            return Vec::new();
        };
        let quote = result.indicators.quote.first().cloned().unwrap_or_default();
        let adjclose = result
            .indicators
            .adjclose
            .as_ref()
            .and_then(|v| v.first())
            .map(|a| a.adjclose.clone())
            .unwrap_or_default();
        let events = result.events.as_ref();

        let mut sessions = Vec::with_capacity(timestamps.len());
        for (i, &ts) in timestamps.iter().enumerate() {
            let (Some(Some(open)), Some(Some(high)), Some(Some(low)), Some(Some(close))) = (
                quote.open.get(i),
                quote.high.get(i),
                quote.low.get(i),
                quote.close.get(i),
            ) else {
                continue;
            };
            let (Some(open), Some(high), Some(low), Some(close)) = (
                Decimal::from_f64(*open),
                Decimal::from_f64(*high),
                Decimal::from_f64(*low),
                Decimal::from_f64(*close),
            ) else {
                continue;
            };
            let volume = quote.volume.get(i).copied().flatten().unwrap_or(0);
            let Some(session_date) = DateTime::<Utc>::from_timestamp(ts, 0).map(|dt| dt.date_naive())
            else {
                continue;
            };

            let bar = HistoricalBar {
                symbol: symbol.to_string(),
                session_date,
                open,
                high,
                low,
                close,
                volume,
                source: "yahoo".to_string(),
                sequence_number: ts.max(0) as u64,
            };

            let ts_key = ts.to_string();
            let adjusted_close = adjclose.get(i).copied().flatten().and_then(Decimal::from_f64);
            let split_factor = events
                .and_then(|e| e.splits.get(&ts_key))
                .and_then(|s| Decimal::from_f64(s.numerator / s.denominator));
            let dividend_amount = events
                .and_then(|e| e.dividends.get(&ts_key))
                .and_then(|d| Decimal::from_f64(d.amount));

            sessions.push(RawSession {
                bar,
                adjusted_close,
                split_factor,
                dividend_amount,
            });
        }
        sessions
    }
}

fn classify_chart_error(symbol: &str, error: &ChartError) -> ProviderPlaneError {
    let code = error.code.to_ascii_lowercase();
    if code.contains("not found") || error.description.to_ascii_lowercase().contains("no data") {
        ProviderPlaneError::not_found(format!("bars for {symbol}"))
    } else {
        ProviderPlaneError::transient("yahoo", error.description.clone())
    }
}

#[async_trait]
impl BackfillProvider for YahooBackfillProvider {
    async fn fetch_bars(
        &self,
        symbol: &str,
        range: DateRange,
        granularity: Granularity,
    ) -> Result<Vec<HistoricalBar>, ProviderPlaneError> {
        let result = self.fetch_chart(symbol, range, granularity).await?;
        Ok(Self::build_sessions(symbol, &result)
            .into_iter()
            .map(|s| s.bar)
            .collect())
    }

    async fn fetch_adjusted_bars(
        &self,
        symbol: &str,
        range: DateRange,
        granularity: Granularity,
    ) -> Result<Vec<AdjustedBar>, ProviderPlaneError> {
        let result = self.fetch_chart(symbol, range, granularity).await?;
        Ok(Self::build_sessions(symbol, &result)
            .into_iter()
            .map(|s| AdjustedBar {
                bar: s.bar,
                adjusted_open: None,
                adjusted_high: None,
                adjusted_low: None,
                adjusted_close: s.adjusted_close,
                adjusted_volume: None,
                split_factor: s.split_factor,
                dividend_amount: s.dividend_amount,
            })
            .collect())
    }
}

#[async_trait]
impl Provider for YahooBackfillProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn as_backfill_provider(&self) -> Option<&dyn BackfillProvider> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn provider_with(server: &MockServer) -> YahooBackfillProvider {
        YahooBackfillProvider::with_base_url(format!("{}/v8/finance/chart", server.base_url()))
    }

    fn range() -> DateRange {
        DateRange {
            from: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            to: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
        }
    }

    #[tokio::test]
    async fn fetch_bars_parses_a_successful_chart_response() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v8/finance/chart/AAPL");
            then.status(200).json_body(serde_json::json!({
                "chart": {
                    "result": [{
                        "timestamp": [1704240000, 1704326400],
                        "indicators": {
                            "quote": [{
                                "open": [180.0, 181.5],
                                "high": [182.0, 183.0],
                                "low": [179.0, 180.5],
                                "close": [181.0, 182.5],
                                "volume": [1000000, 1200000]
                            }]
                        }
                    }],
                    "error": null
                }
            }));
        });

        let provider = provider_with(&server);
        let bars = provider
            .fetch_bars("AAPL", range(), Granularity::Daily)
            .await
            .unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].symbol, "AAPL");
        assert_eq!(bars[0].source, "yahoo");
        assert_eq!(bars[0].volume, 1_000_000);
    }

    #[tokio::test]
    async fn fetch_bars_skips_sessions_with_null_ohlc() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v8/finance/chart/AAPL");
            then.status(200).json_body(serde_json::json!({
                "chart": {
                    "result": [{
                        "timestamp": [1704240000, 1704326400],
                        "indicators": {
                            "quote": [{
                                "open": [180.0, null],
                                "high": [182.0, null],
                                "low": [179.0, null],
                                "close": [181.0, null],
                                "volume": [1000000, null]
                            }]
                        }
                    }],
                    "error": null
                }
            }));
        });

        let provider = provider_with(&server);
        let bars = provider
            .fetch_bars("AAPL", range(), Granularity::Daily)
            .await
            .unwrap();
        assert_eq!(bars.len(), 1);
    }

    #[tokio::test]
    async fn not_found_error_maps_to_not_found() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v8/finance/chart/ZZZZ");
            then.status(200).json_body(serde_json::json!({
                "chart": {
                    "result": null,
                    "error": {"code": "Not Found", "description": "No data found, symbol may be delisted"}
                }
            }));
        });

        let provider = provider_with(&server);
        let err = provider
            .fetch_bars("ZZZZ", range(), Granularity::Daily)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderPlaneError::NotFound { .. }));
    }

    #[tokio::test]
    async fn malformed_body_surfaces_as_malformed_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v8/finance/chart/AAPL");
            then.status(200).body("not json");
        });

        let provider = provider_with(&server);
        let err = provider
            .fetch_bars("AAPL", range(), Granularity::Daily)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderPlaneError::Malformed { .. }));
    }

    #[tokio::test]
    async fn fetch_adjusted_bars_carries_split_and_dividend_events() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v8/finance/chart/AAPL");
            then.status(200).json_body(serde_json::json!({
                "chart": {
                    "result": [{
                        "timestamp": [1704240000],
                        "indicators": {
                            "quote": [{
                                "open": [180.0], "high": [182.0], "low": [179.0],
                                "close": [181.0], "volume": [1000000]
                            }],
                            "adjclose": [{"adjclose": [180.5]}]
                        },
                        "events": {
                            "dividends": {"1704240000": {"amount": 0.24}},
                            "splits": {"1704240000": {"numerator": 4.0, "denominator": 1.0}}
                        }
                    }],
                    "error": null
                }
            }));
        });

        let provider = provider_with(&server);
        let bars = provider
            .fetch_adjusted_bars("AAPL", range(), Granularity::Daily)
            .await
            .unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].adjusted_close, Decimal::from_f64(180.5));
        assert_eq!(bars[0].split_factor, Decimal::from_f64(4.0));
        assert_eq!(bars[0].dividend_amount, Decimal::from_f64(0.24));
    }
}
