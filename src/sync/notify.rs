//! Change notifications
//!
//! After each committed step the engine pushes the ids it changed. Delivery
//! is best effort: failures are logged and never reach the caller.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

/// Sink for changed message ids
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, ids: &[String]);
}

/// Deduplicated, sorted ids; `None` when there is nothing to send
fn unique_ids(ids: &[String]) -> Option<Vec<String>> {
    if ids.is_empty() {
        return None;
    }
    let set: BTreeSet<&String> = ids.iter().collect();
    Some(set.into_iter().cloned().collect())
}

#[derive(Serialize)]
struct NotifyRequest<'a> {
    ids: &'a [String],
}

/// POSTs `{"ids": [...]}` to a web endpoint
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, ids: &[String]) {
        let Some(ids) = unique_ids(ids) else { return };

        let result = self
            .client
            .post(&self.url)
            .json(&NotifyRequest { ids: &ids })
            .send()
            .await
            .and_then(|response| response.error_for_status());
        match result {
            Ok(_) => log::debug!("Notified {} changed emails", ids.len()),
            Err(e) => log::error!("Notify {} failed: {}", self.url, e),
        }
    }
}

/// Keeps every batch in memory
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    batches: Mutex<Vec<Vec<String>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batches received so far
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    /// Every id received so far, deduplicated and sorted
    pub fn ids(&self) -> Vec<String> {
        let all: Vec<String> = self.batches().into_iter().flatten().collect();
        unique_ids(&all).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut batches) = self.batches.lock() {
            batches.clear();
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, ids: &[String]) {
        let Some(ids) = unique_ids(ids) else { return };
        if let Ok(mut batches) = self.batches.lock() {
            batches.push(ids);
        }
    }
}
