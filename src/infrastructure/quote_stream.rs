//! Realtime quote session over a persistent websocket.
//!
//! The upstream speaks two framings on one socket: JSON control frames
//! (keepalive echoes, subscription acks, notices) and `|`-delimited data
//! frames whose first segment is a type tag and whose payload fields are
//! `^`-separated. Subscriptions are keyed by a channel identifier derived
//! from the ticker and the current trading session, so the key must be
//! recomputed on every subscribe.
//!
//! Connection management follows a fixed cycle: Disconnected -> Connecting
//! -> Connected, dropping back to Disconnected on error or close. Reconnects
//! use a fixed backoff with a bounded number of consecutive attempts; after
//! that the session halts until `restart()` is called. On every disconnect
//! the subscribed set moves to a pending-resubscribe set that is replayed
//! once the next connection is up.

use crate::domain::errors::BrokerError;
use crate::domain::market_hours::{self, MarketSession};
use crate::domain::types::QuoteUpdate;
use crate::infrastructure::broker::token::TokenManager;
use anyhow::Result;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{self, Duration};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

/// Type tag of realtime trade frames; doubles as the subscribe tr_id.
const QUOTE_FRAME_TAG: &str = "HDFSCNT0";
const KEEPALIVE_TAG: &str = "PINGPONG";

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
/// How long `subscribe` waits for the session to come up before failing.
const SUBSCRIBE_WAIT: Duration = Duration::from_secs(5);

// Payload field indices within a data frame.
const IDX_SYMBOL: usize = 1;
const IDX_LAST: usize = 11;
const IDX_RATE: usize = 14;
const IDX_TOTAL_VOLUME: usize = 20;

type WsSink = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<TcpStream>>,
    Message,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug)]
enum SessionCommand {
    Subscribe(String),
    Unsubscribe(String),
    Restart,
    Shutdown,
}

enum SessionEnd {
    Shutdown,
    Lost,
}

/// Subscription bookkeeping, separated from socket I/O.
///
/// `subscribed` tracks what the current connection carries; on disconnect
/// everything moves into `pending_resubscribe` and is replayed entry by
/// entry once a new connection is established.
#[derive(Debug, Default)]
pub struct SubscriptionBook {
    subscribed: HashSet<String>,
    pending_resubscribe: HashSet<String>,
}

impl SubscriptionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_subscribed(&self, ticker: &str) -> bool {
        self.subscribed.contains(ticker)
    }

    pub fn mark_subscribed(&mut self, ticker: &str) {
        self.pending_resubscribe.remove(ticker);
        self.subscribed.insert(ticker.to_string());
    }

    pub fn drop_ticker(&mut self, ticker: &str) {
        self.subscribed.remove(ticker);
        self.pending_resubscribe.remove(ticker);
    }

    /// Move every live subscription into the pending set. Called on every
    /// connection loss; extends rather than overwrites so repeated failed
    /// connects never lose entries.
    pub fn on_disconnect(&mut self) {
        let dropped: Vec<String> = self.subscribed.drain().collect();
        self.pending_resubscribe.extend(dropped);
    }

    pub fn pending(&self) -> Vec<String> {
        self.pending_resubscribe.iter().cloned().collect()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.subscribed.iter().cloned().collect()
    }
}

/// Channel identifier for one ticker in one trading session.
///
/// The venue segment differs per session, so the same ticker subscribes to
/// a different channel pre-market than it does during regular hours. Never
/// cache the result across calls.
pub fn channel_key(ticker: &str, session: MarketSession) -> String {
    let venue = match session {
        MarketSession::Pre => "BAQ",
        MarketSession::Regular => "NAS",
        MarketSession::After => "BAA",
        MarketSession::Closed => "BAY",
    };
    format!("D{venue}{ticker}")
}

#[derive(Debug, Deserialize)]
struct ControlHeader {
    tr_id: String,
}

#[derive(Debug, Deserialize)]
struct ControlFrame {
    header: ControlHeader,
    #[serde(default)]
    body: Option<serde_json::Value>,
}

#[derive(Debug)]
enum InboundText {
    /// Keepalive probe to be echoed back verbatim.
    Keepalive,
    /// Decoded tick.
    Quote(QuoteUpdate),
    /// Recognized but uninteresting (acks, notices) or malformed; dropped.
    Ignored,
}

fn classify_frame(text: &str) -> InboundText {
    if text.trim_start().starts_with('{') {
        match serde_json::from_str::<ControlFrame>(text) {
            Ok(frame) if frame.header.tr_id == KEEPALIVE_TAG => InboundText::Keepalive,
            Ok(frame) => {
                let note = frame
                    .body
                    .as_ref()
                    .and_then(|b| b.get("msg1"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("");
                debug!("QuoteStream: control frame {} {}", frame.header.tr_id, note);
                InboundText::Ignored
            }
            Err(e) => {
                warn!("QuoteStream: unreadable control frame, dropping: {e}");
                InboundText::Ignored
            }
        }
    } else {
        match parse_data_frame(text) {
            Some(update) => InboundText::Quote(update),
            None => InboundText::Ignored,
        }
    }
}

/// Decode a `TAG|CHANNEL|f0^f1^...` data frame into a quote update.
/// Unknown tags and malformed payloads are logged and dropped.
fn parse_data_frame(text: &str) -> Option<QuoteUpdate> {
    let mut parts = text.splitn(3, '|');
    let tag = parts.next()?;
    let _channel = parts.next()?;
    let payload = parts.next()?;

    if tag != QUOTE_FRAME_TAG {
        debug!("QuoteStream: ignoring frame with unknown tag {tag}");
        return None;
    }

    let fields: Vec<&str> = payload.split('^').collect();
    if fields.len() <= IDX_TOTAL_VOLUME {
        warn!(
            "QuoteStream: malformed data frame ({} fields), dropping",
            fields.len()
        );
        return None;
    }

    let price = match Decimal::from_str(fields[IDX_LAST]) {
        Ok(p) => p,
        Err(_) => {
            warn!("QuoteStream: unparsable price {:?}, dropping frame", fields[IDX_LAST]);
            return None;
        }
    };
    let change_rate = Decimal::from_str(fields[IDX_RATE]).unwrap_or(Decimal::ZERO);
    let volume = fields[IDX_TOTAL_VOLUME].parse::<u64>().unwrap_or(0);

    Some(QuoteUpdate {
        ticker: fields[IDX_SYMBOL].to_string(),
        price,
        change_rate,
        volume,
        received_at: Utc::now(),
    })
}

fn subscribe_message(approval_key: &str, key: &str, register: bool) -> String {
    serde_json::json!({
        "header": {
            "approval_key": approval_key,
            "custtype": "P",
            "tr_type": if register { "1" } else { "2" },
            "content-type": "utf-8",
        },
        "body": {
            "input": {
                "tr_id": QUOTE_FRAME_TAG,
                "tr_key": key,
            }
        }
    })
    .to_string()
}

fn keepalive_message() -> String {
    serde_json::json!({
        "header": {
            "tr_id": KEEPALIVE_TAG,
            "datetime": Utc::now().format("%Y%m%d%H%M%S").to_string(),
        }
    })
    .to_string()
}

/// Persistent quote-session manager. Decoded ticks are delivered to the
/// single receiver returned by `new`.
pub struct QuoteStreamSession {
    book: Arc<Mutex<SubscriptionBook>>,
    command_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<SessionState>,
}

impl QuoteStreamSession {
    pub fn new(ws_url: String, tokens: Arc<TokenManager>) -> (Self, mpsc::Receiver<QuoteUpdate>) {
        let (quote_tx, quote_rx) = mpsc::channel(1000);
        let (command_tx, command_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let book = Arc::new(Mutex::new(SubscriptionBook::new()));

        let session = Self {
            book: book.clone(),
            command_tx,
            state_rx,
        };

        tokio::spawn(Self::drive(
            ws_url, tokens, quote_tx, book, state_tx, command_rx,
        ));

        (session, quote_rx)
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Register a ticker on the stream.
    ///
    /// No-op when already subscribed. When the session is not yet up this
    /// waits a bounded time for `Connected` and then fails without leaving
    /// anything enqueued; the caller decides whether to retry.
    pub async fn subscribe(&self, ticker: &str) -> Result<(), BrokerError> {
        if self.book.lock().await.is_subscribed(ticker) {
            return Ok(());
        }

        self.await_connected().await?;

        self.command_tx
            .send(SessionCommand::Subscribe(ticker.to_string()))
            .await
            .map_err(|_| BrokerError::ConnectionLost {
                reason: "quote session task ended".to_string(),
            })
    }

    /// Remove a ticker. Offline there is nothing to tell the server; the
    /// ticker is only dropped from local bookkeeping.
    pub async fn unsubscribe(&self, ticker: &str) -> Result<(), BrokerError> {
        if self.state() != SessionState::Connected {
            self.book.lock().await.drop_ticker(ticker);
            return Ok(());
        }

        self.command_tx
            .send(SessionCommand::Unsubscribe(ticker.to_string()))
            .await
            .map_err(|_| BrokerError::ConnectionLost {
                reason: "quote session task ended".to_string(),
            })
    }

    pub async fn subscribed_tickers(&self) -> Vec<String> {
        self.book.lock().await.subscribed()
    }

    /// Resume connecting after the bounded reconnect attempts ran out.
    pub async fn restart(&self) -> Result<(), BrokerError> {
        self.command_tx
            .send(SessionCommand::Restart)
            .await
            .map_err(|_| BrokerError::ConnectionLost {
                reason: "quote session task ended".to_string(),
            })
    }

    async fn await_connected(&self) -> Result<(), BrokerError> {
        let mut state_rx = self.state_rx.clone();
        let wait = state_rx.wait_for(|s| *s == SessionState::Connected);
        match time::timeout(SUBSCRIBE_WAIT, wait).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(BrokerError::ConnectionLost {
                reason: "quote session task ended".to_string(),
            }),
            Err(_) => Err(BrokerError::ConnectionLost {
                reason: "quote session not connected".to_string(),
            }),
        }
    }

    /// Outer connection loop: connect, run, reconnect with backoff, halt
    /// after too many consecutive failures.
    async fn drive(
        ws_url: String,
        tokens: Arc<TokenManager>,
        quote_tx: mpsc::Sender<QuoteUpdate>,
        book: Arc<Mutex<SubscriptionBook>>,
        state_tx: watch::Sender<SessionState>,
        mut command_rx: mpsc::Receiver<SessionCommand>,
    ) {
        let mut attempts: u32 = 0;

        loop {
            if attempts >= MAX_RECONNECT_ATTEMPTS {
                error!(
                    "QuoteStream: giving up after {attempts} consecutive failed connections; waiting for restart"
                );
                state_tx.send_replace(SessionState::Disconnected);
                match command_rx.recv().await {
                    Some(SessionCommand::Restart) => {
                        info!("QuoteStream: manual restart requested");
                        attempts = 0;
                    }
                    Some(SessionCommand::Shutdown) | None => return,
                    Some(cmd) => {
                        warn!("QuoteStream: session halted, ignoring {cmd:?}");
                    }
                }
                continue;
            }

            state_tx.send_replace(SessionState::Connecting);
            info!("QuoteStream: connecting to {ws_url}");

            let end = Self::run_connection(
                &ws_url,
                &tokens,
                &quote_tx,
                &book,
                &state_tx,
                &mut command_rx,
                &mut attempts,
            )
            .await;

            state_tx.send_replace(SessionState::Disconnected);
            book.lock().await.on_disconnect();

            match end {
                Ok(SessionEnd::Shutdown) => {
                    info!("QuoteStream: shut down");
                    return;
                }
                Ok(SessionEnd::Lost) => {
                    warn!(
                        "QuoteStream: connection lost, reconnecting in {}s",
                        RECONNECT_BACKOFF.as_secs()
                    );
                }
                Err(e) => {
                    error!(
                        "QuoteStream: connection failed: {e}. Reconnecting in {}s",
                        RECONNECT_BACKOFF.as_secs()
                    );
                }
            }

            attempts += 1;
            time::sleep(RECONNECT_BACKOFF).await;
        }
    }

    async fn run_connection(
        ws_url: &str,
        tokens: &Arc<TokenManager>,
        quote_tx: &mpsc::Sender<QuoteUpdate>,
        book: &Arc<Mutex<SubscriptionBook>>,
        state_tx: &watch::Sender<SessionState>,
        command_rx: &mut mpsc::Receiver<SessionCommand>,
        attempts: &mut u32,
    ) -> Result<SessionEnd, BrokerError> {
        // Approval keys are connection-scoped; fetch a fresh one each time.
        let approval_key = tokens.ws_approval_key().await?;

        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| BrokerError::ConnectionLost {
                reason: format!("websocket connect: {e}"),
            })?;

        let (mut write, mut read) = ws_stream.split();

        state_tx.send_replace(SessionState::Connected);
        *attempts = 0;
        info!("QuoteStream: connected");

        Self::replay_pending(&mut write, &approval_key, book).await?;

        let mut keepalive = time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // interval fires immediately; skip the initial tick.
        keepalive.tick().await;

        loop {
            tokio::select! {
                msg_result = read.next() => {
                    match msg_result {
                        Some(Ok(Message::Text(text))) => {
                            match classify_frame(&text) {
                                InboundText::Keepalive => {
                                    write
                                        .send(Message::Text(text))
                                        .await
                                        .map_err(|e| BrokerError::ConnectionLost {
                                            reason: format!("keepalive echo: {e}"),
                                        })?;
                                }
                                InboundText::Quote(update) => {
                                    if quote_tx.send(update).await.is_err() {
                                        info!("QuoteStream: consumer dropped, shutting down");
                                        return Ok(SessionEnd::Shutdown);
                                    }
                                }
                                InboundText::Ignored => {}
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("QuoteStream: closed by server");
                            return Ok(SessionEnd::Lost);
                        }
                        Some(Err(e)) => {
                            return Err(BrokerError::ConnectionLost {
                                reason: format!("websocket read: {e}"),
                            });
                        }
                        None => {
                            warn!("QuoteStream: stream ended");
                            return Ok(SessionEnd::Lost);
                        }
                        _ => {}
                    }
                }

                Some(cmd) = command_rx.recv() => {
                    match cmd {
                        SessionCommand::Subscribe(ticker) => {
                            // The correct channel depends on the session of
                            // the moment, so derive it here, per call.
                            let key = channel_key(&ticker, market_hours::current_session());
                            let msg = subscribe_message(&approval_key, &key, true);
                            write.send(Message::Text(msg.into())).await.map_err(|e| {
                                BrokerError::ConnectionLost {
                                    reason: format!("subscribe send: {e}"),
                                }
                            })?;
                            book.lock().await.mark_subscribed(&ticker);
                            info!("QuoteStream: subscribed {ticker} on {key}");
                        }
                        SessionCommand::Unsubscribe(ticker) => {
                            let key = channel_key(&ticker, market_hours::current_session());
                            let msg = subscribe_message(&approval_key, &key, false);
                            write.send(Message::Text(msg.into())).await.map_err(|e| {
                                BrokerError::ConnectionLost {
                                    reason: format!("unsubscribe send: {e}"),
                                }
                            })?;
                            book.lock().await.drop_ticker(&ticker);
                            info!("QuoteStream: unsubscribed {ticker}");
                        }
                        SessionCommand::Restart => {
                            debug!("QuoteStream: restart ignored, session already up");
                        }
                        SessionCommand::Shutdown => {
                            return Ok(SessionEnd::Shutdown);
                        }
                    }
                }

                _ = keepalive.tick() => {
                    write
                        .send(Message::Text(keepalive_message().into()))
                        .await
                        .map_err(|e| BrokerError::ConnectionLost {
                            reason: format!("keepalive send: {e}"),
                        })?;
                }
            }
        }
    }

    /// Replay each pending ticker as a fresh subscribe. Entries leave the
    /// pending set one by one as their subscribe goes out, so a failure
    /// mid-replay keeps the remainder queued for the next connection.
    async fn replay_pending(
        write: &mut WsSink,
        approval_key: &str,
        book: &Arc<Mutex<SubscriptionBook>>,
    ) -> Result<(), BrokerError> {
        let pending = book.lock().await.pending();
        if pending.is_empty() {
            return Ok(());
        }

        info!("QuoteStream: resubscribing {} tickers", pending.len());
        for ticker in pending {
            let key = channel_key(&ticker, market_hours::current_session());
            let msg = subscribe_message(approval_key, &key, true);
            write
                .send(Message::Text(msg.into()))
                .await
                .map_err(|e| BrokerError::ConnectionLost {
                    reason: format!("resubscribe send: {e}"),
                })?;
            book.lock().await.mark_subscribed(&ticker);
            debug!("QuoteStream: resubscribed {ticker} on {key}");
        }
        Ok(())
    }
}

impl Drop for QuoteStreamSession {
    fn drop(&mut self) {
        // Best effort; the task also exits when the command channel closes.
        let _ = self.command_tx.try_send(SessionCommand::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SAMPLE_FRAME: &str = "HDFSCNT0|DNASAAPL|DNASAAPL^AAPL^4^20250115^20250115^093015^20250116^003015^188.50^190.10^187.90^189.95^2^1.45^0.77^189.94^189.96^300^200^1200^51230000";

    #[test]
    fn data_frame_decodes_into_quote_update() {
        let update = parse_data_frame(SAMPLE_FRAME).expect("frame should decode");
        assert_eq!(update.ticker, "AAPL");
        assert_eq!(update.price, dec!(189.95));
        assert_eq!(update.change_rate, dec!(0.77));
        assert_eq!(update.volume, 51_230_000);
    }

    #[test]
    fn unknown_tag_is_dropped() {
        let frame = SAMPLE_FRAME.replace("HDFSCNT0|", "HDFSASP0|");
        assert!(parse_data_frame(&frame).is_none());
    }

    #[test]
    fn short_payload_is_dropped() {
        assert!(parse_data_frame("HDFSCNT0|DNASAAPL|AAPL^189.95").is_none());
        assert!(parse_data_frame("garbage").is_none());
        assert!(parse_data_frame("").is_none());
    }

    #[test]
    fn unparsable_price_is_dropped() {
        let frame = SAMPLE_FRAME.replace("^189.95^", "^not-a-price^");
        assert!(parse_data_frame(&frame).is_none());
    }

    #[test]
    fn keepalive_control_frame_is_recognized() {
        let text = r#"{"header": {"tr_id": "PINGPONG", "datetime": "20250115093015"}}"#;
        assert!(matches!(classify_frame(text), InboundText::Keepalive));
    }

    #[test]
    fn notices_and_malformed_json_are_ignored() {
        let ack = r#"{"header": {"tr_id": "HDFSCNT0"}, "body": {"msg1": "SUBSCRIBE SUCCESS"}}"#;
        assert!(matches!(classify_frame(ack), InboundText::Ignored));
        assert!(matches!(classify_frame("{not json"), InboundText::Ignored));
    }

    #[test]
    fn quote_frame_classifies_as_quote() {
        assert!(matches!(classify_frame(SAMPLE_FRAME), InboundText::Quote(_)));
    }

    #[test]
    fn channel_key_varies_by_session_and_sticks_within_one() {
        let keys: HashSet<String> = [
            channel_key("AAPL", MarketSession::Pre),
            channel_key("AAPL", MarketSession::Regular),
            channel_key("AAPL", MarketSession::After),
            channel_key("AAPL", MarketSession::Closed),
        ]
        .into_iter()
        .collect();
        assert_eq!(keys.len(), 4, "each session must map to its own channel");

        assert_eq!(
            channel_key("AAPL", MarketSession::Regular),
            channel_key("AAPL", MarketSession::Regular)
        );
        assert!(channel_key("TSLA", MarketSession::Regular).ends_with("TSLA"));
    }

    #[test]
    fn disconnect_moves_subscribed_to_pending() {
        let mut book = SubscriptionBook::new();
        book.mark_subscribed("AAPL");
        book.mark_subscribed("TSLA");
        book.mark_subscribed("NVDA");
        assert_eq!(book.subscribed().len(), 3);

        book.on_disconnect();
        assert!(book.subscribed().is_empty());
        let mut pending = book.pending();
        pending.sort();
        assert_eq!(pending, vec!["AAPL", "NVDA", "TSLA"]);
    }

    #[test]
    fn repeated_disconnects_keep_pending_entries() {
        let mut book = SubscriptionBook::new();
        book.mark_subscribed("AAPL");
        book.on_disconnect();
        // A reconnect that fails before replay completes disconnects again.
        book.on_disconnect();
        assert_eq!(book.pending(), vec!["AAPL"]);
    }

    #[test]
    fn resubscribe_promotes_out_of_pending() {
        let mut book = SubscriptionBook::new();
        book.mark_subscribed("AAPL");
        book.mark_subscribed("TSLA");
        book.on_disconnect();

        for ticker in book.pending() {
            book.mark_subscribed(&ticker);
        }

        assert!(book.pending().is_empty());
        assert_eq!(book.subscribed().len(), 2);
        assert!(book.is_subscribed("AAPL"));
        assert!(book.is_subscribed("TSLA"));
    }

    #[test]
    fn drop_ticker_clears_both_sets() {
        let mut book = SubscriptionBook::new();
        book.mark_subscribed("AAPL");
        book.on_disconnect();
        book.drop_ticker("AAPL");
        assert!(book.pending().is_empty());
        assert!(!book.is_subscribed("AAPL"));
    }

    #[test]
    fn subscribe_and_unsubscribe_messages_differ_by_tr_type() {
        let sub = subscribe_message("key", "DNASAAPL", true);
        let unsub = subscribe_message("key", "DNASAAPL", false);
        assert!(sub.contains(r#""tr_type":"1""#));
        assert!(unsub.contains(r#""tr_type":"2""#));
        assert!(sub.contains("DNASAAPL"));
    }
}
