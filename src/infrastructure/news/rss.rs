//! RSS headline poller. Fetches the feed on an interval, skips everything
//! seen before, scores each fresh item and pushes the result downstream.

use crate::domain::news::NewsEvent;
use crate::domain::ports::{NewsFeed, SentimentScorer};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rss::Channel;
use std::collections::HashSet;
use std::io::Cursor;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, Receiver};
use tracing::{debug, error, info};
use uuid::Uuid;

pub struct RssFeed {
    url: String,
    client: Client,
    seen_guids: Arc<Mutex<HashSet<String>>>,
    poll_interval_seconds: u64,
    scorer: Arc<dyn SentimentScorer>,
}

impl RssFeed {
    pub fn new(url: &str, poll_interval_seconds: u64, scorer: Arc<dyn SentimentScorer>) -> Self {
        Self {
            url: url.to_string(),
            client: Client::new(),
            seen_guids: Arc::new(Mutex::new(HashSet::new())),
            poll_interval_seconds,
            scorer,
        }
    }

    async fn fetch_channel(client: &Client, url: &str) -> Result<Channel> {
        let response = client.get(url).send().await?;
        let bytes = response.bytes().await?;
        Channel::read_from(Cursor::new(bytes)).map_err(|e| anyhow::anyhow!(e))
    }

    fn item_guid(item: &rss::Item) -> String {
        item.guid()
            .map(|g| g.value.to_string())
            .or_else(|| item.link().map(|l| l.to_string()))
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    fn item_to_event(item: &rss::Item, guid: String) -> NewsEvent {
        // RSS dates are RFC 2822; missing or broken ones fall back to now.
        let published_at = item
            .pub_date()
            .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        NewsEvent {
            id: guid,
            source: "RSS".to_string(),
            title: item.title().unwrap_or("No Title").to_string(),
            content: item.description().unwrap_or("").to_string(),
            url: item.link().map(|l| l.to_string()),
            published_at,
        }
    }
}

#[async_trait]
impl NewsFeed for RssFeed {
    async fn subscribe(&self) -> Result<Receiver<crate::domain::news::ScoredSignal>> {
        let (tx, rx) = mpsc::channel(100);
        let url = self.url.clone();
        let client = self.client.clone();
        let seen_guids = self.seen_guids.clone();
        let interval_sec = self.poll_interval_seconds;
        let scorer = self.scorer.clone();

        tokio::spawn(async move {
            info!("RSS: starting poller for {url}");

            // Everything already in the feed at startup counts as seen, so
            // a restart does not replay stale headlines as fresh signals.
            match Self::fetch_channel(&client, &url).await {
                Ok(channel) => {
                    let mut guids = seen_guids.lock().await;
                    for item in channel.items() {
                        guids.insert(Self::item_guid(item));
                    }
                    info!("RSS: marked {} existing items as seen", guids.len());
                }
                Err(e) => error!("RSS: initial fetch failed: {e}"),
            }

            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval_sec)).await;

                debug!("RSS: polling feed");
                let channel = match Self::fetch_channel(&client, &url).await {
                    Ok(channel) => channel,
                    Err(e) => {
                        error!("RSS: poll failed: {e}");
                        continue;
                    }
                };

                let mut guids = seen_guids.lock().await;
                for item in channel.items() {
                    let guid = Self::item_guid(item);
                    if guids.contains(&guid) {
                        continue;
                    }
                    guids.insert(guid.clone());

                    let event = Self::item_to_event(item, guid);
                    let signal = scorer.score(&event);

                    let label = if signal.sentiment > 0.3 {
                        "bullish"
                    } else if signal.sentiment < -0.3 {
                        "bearish"
                    } else {
                        "neutral"
                    };
                    info!(
                        "RSS: new item '{}' [{}] signal {:.1}",
                        event.title, label, signal.signal_score
                    );

                    if tx.send(signal).await.is_err() {
                        info!("RSS: subscriber gone, stopping poller");
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
