//! Alpaca WebSocket streaming connector.
//!
//! Implements [`StreamingProvider`] against Alpaca's `v2` market-data feed,
//! driving the streaming-client state machine in `pp_core::streaming`. Own
//! transport I/O (websocket connect, ping/pong, message framing) lives here;
//! the pure connection reducer and subscription bookkeeping are reused
//! unchanged from `pp-core`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use pp_core::connector::{Provider, StreamSinks, StreamingProvider};
use pp_core::error::ProviderPlaneError;
use pp_core::streaming::{Action, ConnectionState, Event, StreamingSupervisor, SubscriptionManager};
use pp_core::types::{
    Aggressor, Capabilities, CapabilityMask, EventMeta, PrimaryKind, ProviderId, QuoteUpdate,
    RateLimitProfile, SubscriptionId, SubscriptionKind, TradeUpdate,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// Per-feed credentials and connection options for one Alpaca session.
#[derive(Debug, Clone)]
pub struct AlpacaConfig {
    /// Alpaca key id.
    pub key_id: String,
    /// Alpaca secret key.
    pub secret_key: String,
    /// Feed name, e.g. `"iex"`, `"sip"`, `"test"`.
    pub feed: String,
    /// Use the sandbox host instead of production.
    pub use_sandbox: bool,
    /// Also subscribe to top-of-book quotes alongside trades.
    pub subscribe_quotes: bool,
}

impl AlpacaConfig {
    fn url(&self) -> String {
        let host = if self.use_sandbox {
            "stream.data.sandbox.alpaca.markets"
        } else {
            "stream.data.alpaca.markets"
        };
        format!("wss://{host}/v2/{}", self.feed)
    }
}

#[derive(Debug, Clone)]
enum WireCommand {
    Subscribe { symbol: String, kind: SubscriptionKind },
    Unsubscribe { symbol: String, kind: SubscriptionKind },
}

struct ConnectionHandles {
    task: JoinHandle<()>,
    commands: mpsc::UnboundedSender<WireCommand>,
}

/// Concrete Alpaca streaming provider. Holds no data until [`connect`] is
/// called; reconnect/backoff/circuit-breaker state lives entirely inside the
/// spawned connection task, driven by [`StreamingSupervisor`].
///
/// [`connect`]: StreamingProvider::connect
pub struct AlpacaConnector {
    id: ProviderId,
    config: AlpacaConfig,
    capabilities: Capabilities,
    subscriptions: Arc<Mutex<SubscriptionManager>>,
    connection: Mutex<Option<ConnectionHandles>>,
}

impl AlpacaConnector {
    /// Construct a connector for `config`. Does not open a connection.
    #[must_use]
    pub fn new(config: AlpacaConfig) -> Self {
        Self {
            id: ProviderId::new("alpaca"),
            config,
            capabilities: Capabilities {
                primary_kind: PrimaryKind::Streaming,
                mask: CapabilityMask::STREAM_TRADES | CapabilityMask::STREAM_QUOTES,
                max_depth_levels: None,
                supports_adjusted: false,
                supports_intraday: false,
                supports_historical_trades: false,
                supports_historical_quotes: false,
                supports_auctions: false,
                markets: vec!["US".to_string()],
                rate_limit: RateLimitProfile {
                    max_requests: 200,
                    window_ms: 60_000,
                    min_inter_request_delay_ms: 0,
                },
            },
            subscriptions: Arc::new(Mutex::new(SubscriptionManager::new())),
            connection: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Provider for AlpacaConnector {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn as_streaming_provider(&self) -> Option<&dyn StreamingProvider> {
        Some(self)
    }

    async fn dispose(&self) -> Result<(), ProviderPlaneError> {
        self.disconnect().await
    }
}

#[async_trait]
impl StreamingProvider for AlpacaConnector {
    async fn connect(&self, sinks: StreamSinks) -> Result<(), ProviderPlaneError> {
        let mut slot = self.connection.lock().await;
        if slot.is_some() {
            return Ok(());
        }
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let session = Session {
            config: self.config.clone(),
            sinks,
            subscriptions: Arc::clone(&self.subscriptions),
        };
        let task = tokio::spawn(session.run(commands_rx));
        *slot = Some(ConnectionHandles {
            task,
            commands: commands_tx,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ProviderPlaneError> {
        if let Some(handles) = self.connection.lock().await.take() {
            handles.task.abort();
        }
        Ok(())
    }

    async fn subscribe_trades(&self, symbol: &str) -> Result<SubscriptionId, ProviderPlaneError> {
        let id = self
            .subscriptions
            .lock()
            .await
            .subscribe(symbol, SubscriptionKind::Trade);
        self.send_command(WireCommand::Subscribe {
            symbol: symbol.to_string(),
            kind: SubscriptionKind::Trade,
        })
        .await?;
        Ok(id)
    }

    async fn unsubscribe_trades(&self, symbol: &str) -> Result<(), ProviderPlaneError> {
        self.subscriptions
            .lock()
            .await
            .unsubscribe(symbol, SubscriptionKind::Trade);
        self.send_command(WireCommand::Unsubscribe {
            symbol: symbol.to_string(),
            kind: SubscriptionKind::Trade,
        })
        .await
    }

    async fn subscribe_quotes(&self, symbol: &str) -> Result<SubscriptionId, ProviderPlaneError> {
        if !self.config.subscribe_quotes {
            return Err(ProviderPlaneError::unsupported(
                pp_core::types::Capability::StreamQuotes,
            ));
        }
        let id = self
            .subscriptions
            .lock()
            .await
            .subscribe(symbol, SubscriptionKind::Quote);
        self.send_command(WireCommand::Subscribe {
            symbol: symbol.to_string(),
            kind: SubscriptionKind::Quote,
        })
        .await?;
        Ok(id)
    }

    async fn unsubscribe_quotes(&self, symbol: &str) -> Result<(), ProviderPlaneError> {
        self.subscriptions
            .lock()
            .await
            .unsubscribe(symbol, SubscriptionKind::Quote);
        self.send_command(WireCommand::Unsubscribe {
            symbol: symbol.to_string(),
            kind: SubscriptionKind::Quote,
        })
        .await
    }
}

impl AlpacaConnector {
    async fn send_command(&self, cmd: WireCommand) -> Result<(), ProviderPlaneError> {
        let slot = self.connection.lock().await;
        match slot.as_ref() {
            Some(handles) => {
                let _ = handles.commands.send(cmd);
                Ok(())
            }
            None => Err(ProviderPlaneError::fatal("alpaca connector is not connected")),
        }
    }
}

/// Owns one websocket session for its lifetime: connect/auth/heartbeat,
/// reconnect with backoff via [`StreamingSupervisor`], and frame dispatch.
struct Session {
    config: AlpacaConfig,
    sinks: StreamSinks,
    subscriptions: Arc<Mutex<SubscriptionManager>>,
}

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
/// Placeholder deadline for "no ping currently outstanding" — long enough
/// that it never fires before the next real ping re-arms it.
const NO_PING_OUTSTANDING: Duration = Duration::from_secs(365 * 24 * 60 * 60);

impl Session {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<WireCommand>) {
        let supervisor = StreamingSupervisor::new();
        let (mut supervisor, mut pending_actions) = supervisor.handle(Event::ConnectRequested);

        loop {
            let actions_to_run = std::mem::take(&mut pending_actions);
            let mut reconnect_delay: Option<Duration> = None;
            for action in actions_to_run {
                match action {
                    Action::OpenTransport => {
                        match self.open_and_run(&mut commands).await {
                            Ok(()) => {
                                let (next, acts) = supervisor.handle(Event::ConnectionLost);
                                supervisor = next;
                                pending_actions.extend(acts);
                            }
                            Err(()) => {
                                let (next, acts) = supervisor.handle(Event::TransportFailed);
                                supervisor = next;
                                pending_actions.extend(acts);
                            }
                        }
                    }
                    Action::ScheduleReconnect { delay } => reconnect_delay = Some(delay),
                    Action::ScheduleCircuitReclose { delay } => reconnect_delay = Some(delay),
                    Action::SurfaceFatal => {
                        #[cfg(feature = "tracing")]
                        tracing::error!(provider = "alpaca", "connect attempts exhausted, giving up");
                        return;
                    }
                    Action::SendCredentials { .. }
                    | Action::ResubscribeAll
                    | Action::StartHeartbeat
                    | Action::StopHeartbeat
                    | Action::OpenCircuitBreaker => {}
                }
            }
            if matches!(supervisor.state, ConnectionState::Disposed) {
                return;
            }
            if let Some(delay) = reconnect_delay {
                tokio::time::sleep(delay).await;
                let (next, acts) = supervisor.handle(Event::BackoffElapsed);
                supervisor = next;
                pending_actions = acts;
            } else if pending_actions.is_empty() {
                let (next, acts) = supervisor.handle(Event::ConnectRequested);
                supervisor = next;
                pending_actions = acts;
            }
        }
    }

    /// Opens the websocket, authenticates, resubscribes, then drives the
    /// receive/heartbeat loop until the connection drops or a command channel
    /// closes. `Ok(())` means the connection ended cleanly and should be
    /// retried from scratch; `Err(())` means the open/auth step itself failed.
    async fn open_and_run(&self, commands: &mut mpsc::UnboundedReceiver<WireCommand>) -> Result<(), ()> {
        let (ws, _resp) = tokio_tungstenite::connect_async(self.config.url())
            .await
            .map_err(|_| ())?;
        let (mut write, mut read) = ws.split();

        let auth = serde_json::json!({
            "action": "auth",
            "key": self.config.key_id,
            "secret": self.config.secret_key,
        });
        write
            .send(Message::Text(auth.to_string().into()))
            .await
            .map_err(|_| ())?;

        let existing = self.subscriptions.lock().await.all();
        if !existing.is_empty() {
            for msg in resubscribe_messages(&existing) {
                write.send(Message::Text(msg.into())).await.map_err(|_| ())?;
            }
        }

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;

        // Armed to `HEARTBEAT_TIMEOUT` after every ping we send, and disarmed
        // (pushed a year out) once the matching pong arrives, so a missed
        // pong is caught ~`HEARTBEAT_TIMEOUT` after it was due rather than on
        // the next `HEARTBEAT_INTERVAL` tick.
        let pong_deadline = tokio::time::sleep(NO_PING_OUTSTANDING);
        tokio::pin!(pong_deadline);

        loop {
            tokio::select! {
                biased;
                cmd = commands.recv() => {
                    match cmd {
                        Some(cmd) => {
                            let msg = command_message(&cmd);
                            if write.send(Message::Text(msg.into())).await.is_err() {
                                return Ok(());
                            }
                        }
                        None => return Ok(()),
                    }
                }
                () = &mut pong_deadline => {
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return Ok(());
                    }
                    pong_deadline.as_mut().reset(tokio::time::Instant::now() + HEARTBEAT_TIMEOUT);
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Pong(_))) => {
                            pong_deadline.as_mut().reset(tokio::time::Instant::now() + NO_PING_OUTSTANDING);
                        }
                        Some(Ok(Message::Text(text))) => {
                            self.dispatch_frame(&text);
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            if let Ok(text) = String::from_utf8(bytes.to_vec()) {
                                self.dispatch_frame(&text);
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(_)) => return Ok(()),
                    }
                }
            }
        }
    }

    fn dispatch_frame(&self, text: &str) {
        let parsed: Result<Vec<Value>, _> = serde_json::from_str(text);
        let items = match parsed {
            Ok(items) => items,
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    provider = "alpaca",
                    payload = %truncate(text, 500),
                    "malformed alpaca frame"
                );
                return;
            }
        };
        for item in items {
            self.dispatch_message(&item);
        }
    }

    fn dispatch_message(&self, item: &Value) {
        match item.get("T").and_then(Value::as_str) {
            Some("t") => {
                if let Some(update) = parse_trade(item) {
                    self.sinks.trades.on_trade(update);
                } else {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        provider = "alpaca",
                        payload = %truncate(&item.to_string(), 500),
                        "malformed alpaca trade message"
                    );
                }
            }
            Some("q") => {
                if let Some(update) = parse_quote(item) {
                    self.sinks.quotes.on_quote(update);
                } else {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        provider = "alpaca",
                        payload = %truncate(&item.to_string(), 500),
                        "malformed alpaca quote message"
                    );
                }
            }
            _ => {
                // Subscription acks, auth acks, and unrecognized types are
                // silently dropped.
            }
        }
    }
}

fn truncate(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

fn resubscribe_messages(subs: &[(String, SubscriptionKind)]) -> Vec<String> {
    let trades: Vec<&str> = subs
        .iter()
        .filter(|(_, k)| *k == SubscriptionKind::Trade)
        .map(|(s, _)| s.as_str())
        .collect();
    let quotes: Vec<&str> = subs
        .iter()
        .filter(|(_, k)| *k == SubscriptionKind::Quote)
        .map(|(s, _)| s.as_str())
        .collect();
    let mut messages = Vec::new();
    if !trades.is_empty() || !quotes.is_empty() {
        messages.push(
            serde_json::json!({
                "action": "subscribe",
                "trades": trades,
                "quotes": quotes,
            })
            .to_string(),
        );
    }
    messages
}

fn command_message(cmd: &WireCommand) -> String {
    let (action, symbol, field) = match cmd {
        WireCommand::Subscribe {
            symbol,
            kind: SubscriptionKind::Trade,
        } => ("subscribe", symbol.as_str(), "trades"),
        WireCommand::Subscribe {
            symbol,
            kind: SubscriptionKind::Quote,
        } => ("subscribe", symbol.as_str(), "quotes"),
        WireCommand::Subscribe {
            symbol,
            kind: SubscriptionKind::Depth,
        } => ("subscribe", symbol.as_str(), "trades"),
        WireCommand::Unsubscribe {
            symbol,
            kind: SubscriptionKind::Trade,
        } => ("unsubscribe", symbol.as_str(), "trades"),
        WireCommand::Unsubscribe {
            symbol,
            kind: SubscriptionKind::Quote,
        } => ("unsubscribe", symbol.as_str(), "quotes"),
        WireCommand::Unsubscribe {
            symbol,
            kind: SubscriptionKind::Depth,
        } => ("unsubscribe", symbol.as_str(), "trades"),
    };
    serde_json::json!({
        "action": action,
        field: [symbol],
    })
    .to_string()
}

#[derive(Deserialize)]
struct RawTrade<'a> {
    #[serde(rename = "S")]
    symbol: &'a str,
    #[serde(rename = "p")]
    price: f64,
    #[serde(rename = "s")]
    size: f64,
    #[serde(rename = "t")]
    timestamp: DateTime<Utc>,
    #[serde(rename = "x")]
    venue: Option<&'a str>,
    #[serde(rename = "i")]
    trade_id: Option<u64>,
}

fn parse_trade(value: &Value) -> Option<TradeUpdate> {
    let raw: RawTrade<'_> = serde_json::from_value(value.clone()).ok()?;
    Some(TradeUpdate {
        meta: EventMeta {
            timestamp: raw.timestamp,
            symbol: raw.symbol.to_string(),
            sequence: raw.trade_id,
            stream_id: 0,
            source_venue: raw.venue.unwrap_or_default().to_string(),
        },
        price: Decimal::try_from(raw.price).ok()?,
        size: Decimal::try_from(raw.size).ok()?,
        aggressor: Aggressor::Unknown,
    })
}

#[derive(Deserialize)]
struct RawQuote<'a> {
    #[serde(rename = "S")]
    symbol: &'a str,
    #[serde(rename = "bp")]
    bid_price: f64,
    #[serde(rename = "bs")]
    bid_size: f64,
    #[serde(rename = "ap")]
    ask_price: f64,
    #[serde(rename = "as")]
    ask_size: f64,
    #[serde(rename = "t")]
    timestamp: DateTime<Utc>,
}

fn parse_quote(value: &Value) -> Option<QuoteUpdate> {
    let raw: RawQuote<'_> = serde_json::from_value(value.clone()).ok()?;
    Some(QuoteUpdate {
        meta: EventMeta {
            timestamp: raw.timestamp,
            symbol: raw.symbol.to_string(),
            sequence: None,
            stream_id: 0,
            source_venue: String::new(),
        },
        bid_price: Decimal::try_from(raw.bid_price).ok()?,
        ask_price: Decimal::try_from(raw.ask_price).ok()?,
        bid_size: Decimal::try_from(raw.bid_size).ok()?,
        ask_size: Decimal::try_from(raw.ask_size).ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_trade_message() {
        let value = serde_json::json!({
            "T": "t", "S": "AAPL", "p": 190.5, "s": 100.0,
            "t": "2024-01-02T15:04:05Z", "x": "V", "i": 42,
        });
        let trade = parse_trade(&value).unwrap();
        assert_eq!(trade.meta.symbol, "AAPL");
        assert_eq!(trade.meta.sequence, Some(42));
    }

    #[test]
    fn parses_a_quote_message() {
        let value = serde_json::json!({
            "T": "q", "S": "AAPL", "bp": 190.0, "bs": 1.0,
            "ap": 190.1, "as": 2.0, "t": "2024-01-02T15:04:05Z",
        });
        let quote = parse_quote(&value).unwrap();
        assert_eq!(quote.meta.symbol, "AAPL");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "x".repeat(600);
        assert!(truncate(&s, 500).len() <= 501);
    }

    #[test]
    fn resubscribe_groups_by_kind() {
        let subs = vec![
            ("AAPL".to_string(), SubscriptionKind::Trade),
            ("MSFT".to_string(), SubscriptionKind::Quote),
        ];
        let messages = resubscribe_messages(&subs);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("AAPL"));
        assert!(messages[0].contains("MSFT"));
    }
}
