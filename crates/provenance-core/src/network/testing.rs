//! Canned-response transport for unit tests.

use super::client::{RegistryResponse, RegistryTransport};
use crate::error::{ProvenanceError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) enum StubReply {
    Json(serde_json::Value),
    NotFound,
    ServerError,
}

/// Replies by path (`/images` keyed with its page). Unknown paths answer 404.
/// The last queued reply for a path repeats.
#[derive(Default)]
pub(crate) struct StubTransport {
    replies: Mutex<HashMap<String, VecDeque<StubReply>>>,
    calls: Mutex<Vec<String>>,
    delay: Duration,
}

impl StubTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn reply(&self, key: &str, reply: StubReply) {
        self.replies
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(reply);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn calls_to(&self, key: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|k| *k == key).count()
    }
}

#[async_trait]
impl RegistryTransport for StubTransport {
    async fn get(&self, path: &str, query: &[(String, String)]) -> Result<RegistryResponse> {
        let key = match query.iter().find(|(k, _)| k == "page") {
            Some((_, page)) => format!("{}?page={}", path, page),
            None => path.to_string(),
        };
        self.calls.lock().unwrap().push(key.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let reply = {
            let mut replies = self.replies.lock().unwrap();
            match replies.get_mut(&key) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match reply.unwrap_or(StubReply::NotFound) {
            StubReply::Json(value) => Ok(RegistryResponse::Found(value)),
            StubReply::NotFound => Ok(RegistryResponse::NotFound),
            StubReply::ServerError => Err(ProvenanceError::Network {
                message: format!("GET {} failed with HTTP 503", path),
                cause: None,
            }),
        }
    }
}
