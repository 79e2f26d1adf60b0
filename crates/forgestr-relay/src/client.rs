//! Outbound relay client - short-lived WebSocket sessions per request
//!
//! Fetch: open every relay in parallel, send `REQ`, collect `EVENT`s until
//! `EOSE` (or the timeout), then `CLOSE`. Results are merged by id.
//! Publish: send `["EVENT", ...]` and wait for the relay's `OK`.

use async_trait::async_trait;
use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use crate::event::Event;
use crate::filter::Filter;
use crate::source::{EventSource, PublishOutcome};
use crate::{Error, Result};

/// Default relays to query
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.ngit.dev",
];

/// Per-relay budget for a whole fetch or publish exchange
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

static SUB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Multi-relay client implementing `EventSource`
#[derive(Debug, Clone)]
pub struct RelayClient {
    relays: Vec<String>,
    timeout: Duration,
}

impl RelayClient {
    pub fn new(relays: Vec<String>) -> Self {
        Self {
            relays,
            timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    async fn fetch_from_relay(url: &str, filters: &[Filter], budget: Duration) -> Result<Vec<Event>> {
        let deadline = Instant::now() + budget;

        let (ws_stream, _) = timeout(budget, connect_async(url))
            .await
            .map_err(|_| Error::Timeout(format!("connecting to {}", url)))??;
        let (mut write, mut read) = ws_stream.split();

        let sub_id = format!("forgestr_{}", SUB_COUNTER.fetch_add(1, Ordering::Relaxed));
        let mut req = vec![Value::from("REQ"), Value::from(sub_id.clone())];
        for filter in filters {
            req.push(serde_json::to_value(filter)?);
        }
        write.send(Message::Text(Value::Array(req).to_string())).await?;

        let mut events = Vec::new();
        loop {
            let next = match timeout_at(deadline, read.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!("Relay {} did not send EOSE in time, keeping {} events", url, events.len());
                    break;
                }
            };

            let text = match next {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            };

            let Ok(arr) = serde_json::from_str::<Vec<Value>>(&text) else {
                trace!("Ignoring non-array message from {}", url);
                continue;
            };

            match arr.first().and_then(|v| v.as_str()) {
                Some("EVENT") if arr.len() >= 3 && arr[1].as_str() == Some(sub_id.as_str()) => {
                    match serde_json::from_value::<Event>(arr[2].clone()) {
                        Ok(event) => events.push(event),
                        Err(e) => debug!("Undecodable event from {}: {}", url, e),
                    }
                }
                Some("EOSE") | Some("CLOSED") => break,
                Some("NOTICE") => {
                    let notice = arr.get(1).and_then(|v| v.as_str()).unwrap_or_default();
                    debug!("Notice from {}: {}", url, notice);
                }
                _ => {}
            }
        }

        let close = serde_json::json!(["CLOSE", sub_id]).to_string();
        let _ = write.send(Message::Text(close)).await;
        let _ = write.close().await;

        debug!("Fetched {} events from {}", events.len(), url);
        Ok(events)
    }

    async fn publish_to_relay(url: &str, event: &Event, budget: Duration) -> Result<()> {
        let deadline = Instant::now() + budget;

        let (ws_stream, _) = timeout(budget, connect_async(url))
            .await
            .map_err(|_| Error::Timeout(format!("connecting to {}", url)))??;
        let (mut write, mut read) = ws_stream.split();

        let msg = serde_json::json!(["EVENT", event]).to_string();
        write.send(Message::Text(msg)).await?;

        let result = loop {
            let next = timeout_at(deadline, read.next())
                .await
                .map_err(|_| Error::Timeout(format!("waiting for OK from {}", url)))?;

            let text = match next {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => {
                    break Err(Error::Relay(format!("{} closed before OK", url)));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => break Err(e.into()),
            };

            let Ok(arr) = serde_json::from_str::<Vec<Value>>(&text) else {
                continue;
            };

            if arr.first().and_then(|v| v.as_str()) == Some("OK")
                && arr.get(1).and_then(|v| v.as_str()) == Some(event.id.as_str())
            {
                let accepted = arr.get(2).and_then(|v| v.as_bool()).unwrap_or(false);
                let message = arr.get(3).and_then(|v| v.as_str()).unwrap_or("").to_string();
                break if accepted {
                    Ok(())
                } else {
                    Err(Error::Relay(format!("{} rejected event: {}", url, message)))
                };
            }
        };

        let _ = write.close().await;
        result
    }
}

#[async_trait]
impl EventSource for RelayClient {
    async fn fetch_events(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        if self.relays.is_empty() {
            return Err(Error::Relay("no relays configured".to_string()));
        }

        let results = join_all(
            self.relays
                .iter()
                .map(|url| Self::fetch_from_relay(url, filters, self.timeout)),
        )
        .await;

        let mut seen = HashSet::new();
        let mut events = Vec::new();
        let mut failures = 0;

        for (url, result) in self.relays.iter().zip(results) {
            match result {
                Ok(batch) => {
                    for event in batch {
                        if seen.insert(event.id.clone()) {
                            events.push(event);
                        }
                    }
                }
                Err(e) => {
                    warn!("Fetch from {} failed: {}", url, e);
                    failures += 1;
                }
            }
        }

        if failures == self.relays.len() {
            return Err(Error::Relay(format!("all {} relays failed", failures)));
        }

        Ok(events)
    }

    async fn publish_event(&self, event: &Event, relays: &[String]) -> Result<PublishOutcome> {
        let targets = if relays.is_empty() { &self.relays[..] } else { relays };

        let results = join_all(
            targets
                .iter()
                .map(|url| Self::publish_to_relay(url, event, self.timeout)),
        )
        .await;

        let mut outcome = PublishOutcome::default();
        for (url, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => outcome.succeeded.push(url.clone()),
                Err(e) => outcome.failed.push((url.clone(), e.to_string())),
            }
        }

        info!(
            "Published {} to {}/{} relays",
            event.id,
            outcome.succeeded.len(),
            targets.len()
        );
        Ok(outcome)
    }
}
