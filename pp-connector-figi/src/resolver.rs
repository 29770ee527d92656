//! OpenFIGI-backed [`FigiResolverProvider`] with a positive/negative LRU
//! cache, following the same split-cache idiom as the teacher's
//! `moka`-based caching middleware: short-lived negative entries for
//! "nothing matched", long-lived positive entries for a resolved mapping.

use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use pp_core::connector::{FigiMapping, Provider, TickerLookup};
use pp_core::connector::{AvailabilityContext, FigiResolverProvider};
use pp_core::error::ProviderPlaneError;
use pp_core::types::{Capabilities, CapabilityMask, PrimaryKind, ProviderId, RateLimitProfile};
use pp_types::FigiResolverConfig;
use serde::{Deserialize, Serialize};

const MAPPING_ENDPOINT: &str = "https://api.openfigi.com/v3/mapping";
/// OpenFIGI rejects batches larger than this in a single call.
const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Ticker {
        ticker: String,
        exchange: Option<String>,
        market_sector: Option<String>,
    },
    Isin(String),
    Cusip(String),
    Sedol(String),
}

#[derive(Debug, Serialize)]
struct MappingRequestItem {
    #[serde(rename = "idType")]
    id_type: &'static str,
    #[serde(rename = "idValue")]
    id_value: String,
    #[serde(rename = "exchCode", skip_serializing_if = "Option::is_none")]
    exch_code: Option<String>,
    #[serde(rename = "marketSecDes", skip_serializing_if = "Option::is_none")]
    market_sec_des: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMapping {
    figi: String,
    #[serde(rename = "compositeFIGI")]
    composite_figi: Option<String>,
    #[serde(rename = "securityType")]
    security_type: Option<String>,
    #[serde(rename = "marketSector")]
    market_sector: Option<String>,
    ticker: Option<String>,
    name: Option<String>,
    #[serde(rename = "exchCode")]
    exch_code: Option<String>,
}

impl From<RawMapping> for FigiMapping {
    fn from(raw: RawMapping) -> Self {
        Self {
            figi: raw.figi,
            composite_figi: raw.composite_figi,
            security_type: raw.security_type,
            market_sector: raw.market_sector,
            ticker: raw.ticker,
            name: raw.name,
            exchange_code: raw.exch_code,
        }
    }
}

/// One element of the parallel OpenFIGI mapping response. A request item
/// with no match comes back as `{"error": "..."}` rather than an empty
/// `data` array.
#[derive(Debug, Deserialize)]
struct RawMappingResponseItem {
    #[serde(default)]
    data: Option<Vec<RawMapping>>,
    #[serde(default)]
    error: Option<String>,
}

/// Symbol-resolution connector: normalizes vendor symbols and resolves
/// ticker/ISIN/CUSIP/SEDOL identifiers to FIGIs via OpenFIGI.
pub struct FigiResolver {
    id: ProviderId,
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    positive_cache: Cache<CacheKey, Vec<FigiMapping>>,
    negative_cache: Cache<CacheKey, ()>,
    capabilities: Capabilities,
}

impl FigiResolver {
    /// Build a resolver from `config`, reading the API key (if any) from
    /// `config.api_key_env_var`.
    #[must_use]
    pub fn new(config: &FigiResolverConfig) -> Self {
        Self::with_endpoint(config, MAPPING_ENDPOINT.to_string())
    }

    /// Build a resolver pointed at a non-default mapping endpoint, for tests.
    #[must_use]
    fn with_endpoint(config: &FigiResolverConfig, endpoint: String) -> Self {
        let api_key = std::env::var(&config.api_key_env_var).ok();
        Self {
            id: ProviderId::new("openfigi"),
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            positive_cache: Cache::builder()
                .max_capacity(config.cache_capacity)
                .time_to_live(config.positive_ttl)
                .build(),
            negative_cache: Cache::builder()
                .max_capacity(config.cache_capacity)
                .time_to_live(config.negative_ttl)
                .build(),
            capabilities: Capabilities {
                primary_kind: PrimaryKind::SymbolSearch,
                mask: CapabilityMask::FIGI_RESOLVE,
                max_depth_levels: None,
                supports_adjusted: false,
                supports_intraday: false,
                supports_historical_trades: false,
                supports_historical_quotes: false,
                supports_auctions: false,
                markets: vec!["US".to_string(), "UK".to_string(), "JP".to_string()],
                rate_limit: RateLimitProfile {
                    max_requests: 25,
                    window_ms: 60_000,
                    min_inter_request_delay_ms: 0,
                },
            },
        }
    }

    async fn resolve_one(
        &self,
        key: CacheKey,
        item: MappingRequestItem,
    ) -> Result<Vec<FigiMapping>, ProviderPlaneError> {
        if self.negative_cache.get(&key).await.is_some() {
            return Ok(Vec::new());
        }
        if let Some(hit) = self.positive_cache.get(&key).await {
            return Ok(hit);
        }

        let mut outcomes = self.request_mapping(vec![item]).await?;
        let mapping = outcomes.pop().unwrap_or_default();
        if mapping.is_empty() {
            self.negative_cache.insert(key, ()).await;
        } else {
            self.positive_cache.insert(key, mapping.clone()).await;
        }
        Ok(mapping)
    }

    /// Send at most [`MAX_BATCH_SIZE`] items per OpenFIGI request, returning
    /// one mapping list per input item in order.
    ///
    /// A non-2xx response with a `429` status is surfaced as
    /// [`ProviderPlaneError::RateLimitExceeded`]; any other transport or
    /// status-code failure is `Transient`. A response body that can't be
    /// parsed as the expected parallel array yields an empty mapping list
    /// per item rather than an error: a single vendor's malformed payload
    /// never propagates as an exception across this boundary.
    async fn request_mapping(
        &self,
        items: Vec<MappingRequestItem>,
    ) -> Result<Vec<Vec<FigiMapping>>, ProviderPlaneError> {
        let mut results = Vec::with_capacity(items.len());
        for chunk in items.chunks(MAX_BATCH_SIZE) {
            let mut request = self.client.post(&self.endpoint).json(chunk);
            if let Some(api_key) = &self.api_key {
                request = request.header("X-OPENFIGI-APIKEY", api_key);
            }

            let response = request.send().await.map_err(|err| {
                ProviderPlaneError::transient("openfigi", format!("request failed: {err}"))
            })?;

            if response.status().as_u16() == 429 {
                return Err(ProviderPlaneError::rate_limit_exceeded("openfigi"));
            }
            if !response.status().is_success() {
                return Err(ProviderPlaneError::transient(
                    "openfigi",
                    format!("unexpected status {}", response.status()),
                ));
            }

            let body = response.text().await.map_err(|err| {
                ProviderPlaneError::transient("openfigi", format!("body read failed: {err}"))
            })?;
            let parsed: Result<Vec<RawMappingResponseItem>, _> = serde_json::from_str(&body);
            match parsed {
                Ok(items) => {
                    results.extend(items.into_iter().map(|item| {
                        item.data
                            .unwrap_or_default()
                            .into_iter()
                            .map(FigiMapping::from)
                            .collect::<Vec<_>>()
                    }));
                }
                Err(_) => results.extend(std::iter::repeat_with(Vec::new).take(chunk.len())),
            }
        }
        Ok(results)
    }
}

fn ticker_item(
    ticker: &str,
    exchange: Option<&str>,
    market_sector: Option<&str>,
) -> MappingRequestItem {
    MappingRequestItem {
        id_type: "TICKER",
        id_value: ticker.to_string(),
        exch_code: exchange.map(str::to_string),
        market_sec_des: market_sector.map(str::to_string),
    }
}

#[async_trait]
impl Provider for FigiResolver {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn as_figi_resolver_provider(&self) -> Option<&dyn FigiResolverProvider> {
        Some(self)
    }

    async fn is_available(&self, _ctx: AvailabilityContext<'_>) -> bool {
        true
    }
}

#[async_trait]
impl FigiResolverProvider for FigiResolver {
    async fn lookup_by_ticker(
        &self,
        ticker: &str,
        exchange: Option<&str>,
        market_sector: Option<&str>,
    ) -> Result<Vec<FigiMapping>, ProviderPlaneError> {
        let key = CacheKey::Ticker {
            ticker: ticker.to_string(),
            exchange: exchange.map(str::to_string),
            market_sector: market_sector.map(str::to_string),
        };
        self.resolve_one(key, ticker_item(ticker, exchange, market_sector))
            .await
    }

    async fn lookup_by_isin(&self, isin: &str) -> Result<Vec<FigiMapping>, ProviderPlaneError> {
        let item = MappingRequestItem {
            id_type: "ID_ISIN",
            id_value: isin.to_string(),
            exch_code: None,
            market_sec_des: None,
        };
        self.resolve_one(CacheKey::Isin(isin.to_string()), item).await
    }

    async fn lookup_by_cusip(&self, cusip: &str) -> Result<Vec<FigiMapping>, ProviderPlaneError> {
        let item = MappingRequestItem {
            id_type: "ID_CUSIP",
            id_value: cusip.to_string(),
            exch_code: None,
            market_sec_des: None,
        };
        self.resolve_one(CacheKey::Cusip(cusip.to_string()), item)
            .await
    }

    async fn lookup_by_sedol(&self, sedol: &str) -> Result<Vec<FigiMapping>, ProviderPlaneError> {
        let item = MappingRequestItem {
            id_type: "ID_SEDOL",
            id_value: sedol.to_string(),
            exch_code: None,
            market_sec_des: None,
        };
        self.resolve_one(CacheKey::Sedol(sedol.to_string()), item)
            .await
    }

    async fn lookup_tickers_batch(
        &self,
        tickers: &[TickerLookup],
    ) -> Result<Vec<Vec<FigiMapping>>, ProviderPlaneError> {
        let keys: Vec<CacheKey> = tickers
            .iter()
            .map(|t| CacheKey::Ticker {
                ticker: t.ticker.clone(),
                exchange: t.exchange.clone(),
                market_sector: t.market_sector.clone(),
            })
            .collect();

        let mut out: Vec<Option<Vec<FigiMapping>>> = Vec::with_capacity(tickers.len());
        let mut pending_indices = Vec::new();
        let mut pending_items = Vec::new();
        for (idx, (t, key)) in tickers.iter().zip(keys.iter()).enumerate() {
            if self.negative_cache.get(key).await.is_some() {
                out.push(Some(Vec::new()));
                continue;
            }
            if let Some(hit) = self.positive_cache.get(key).await {
                out.push(Some(hit));
                continue;
            }
            out.push(None);
            pending_indices.push(idx);
            pending_items.push(ticker_item(
                &t.ticker,
                t.exchange.as_deref(),
                t.market_sector.as_deref(),
            ));
        }

        if !pending_items.is_empty() {
            let resolved = self.request_mapping(pending_items).await?;
            for (pos, idx) in pending_indices.into_iter().enumerate() {
                let mapping = resolved.get(pos).cloned().unwrap_or_default();
                let key = keys[idx].clone();
                if mapping.is_empty() {
                    self.negative_cache.insert(key, ()).await;
                } else {
                    self.positive_cache.insert(key, mapping.clone()).await;
                }
                out[idx] = Some(mapping);
            }
        }

        Ok(out.into_iter().map(Option::unwrap_or_default).collect())
    }
}
