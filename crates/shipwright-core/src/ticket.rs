//! Ticket-system collaborator.
//!
//! Notifications are best effort: implementations log failures and never
//! return them to the caller.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use shipwright_state::{Branch, BranchState};
use tracing::{debug, warn};

use crate::config::TicketConfig;

#[async_trait]
pub trait TicketSystem: Send + Sync {
    async fn notify_state(&self, branch: &Branch, state: BranchState);

    async fn comment(&self, branch: &Branch, text: &str);
}

/// Webhook when a url is configured, otherwise notifications are dropped.
pub fn from_config(config: &TicketConfig) -> Arc<dyn TicketSystem> {
    match &config.webhook_url {
        Some(url) => Arc::new(WebhookTicketSystem::new(url.clone())),
        None => Arc::new(NoopTicketSystem),
    }
}

/// Drops every notification.
#[derive(Debug, Default)]
pub struct NoopTicketSystem;

#[async_trait]
impl TicketSystem for NoopTicketSystem {
    async fn notify_state(&self, branch: &Branch, state: BranchState) {
        debug!(branch = %branch.name, state = %state, "ticket notification skipped");
    }

    async fn comment(&self, branch: &Branch, _text: &str) {
        debug!(branch = %branch.name, "ticket comment skipped");
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum TicketEvent<'a> {
    State {
        branch: &'a str,
        state: BranchState,
    },
    Comment {
        branch: &'a str,
        text: &'a str,
    },
}

/// Posts JSON events to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookTicketSystem {
    client: reqwest::Client,
    url: String,
}

impl WebhookTicketSystem {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    async fn post(&self, event: &TicketEvent<'_>) {
        let result = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        if let Err(e) = result {
            warn!(url = %self.url, error = %e, "ticket webhook failed");
        }
    }
}

#[async_trait]
impl TicketSystem for WebhookTicketSystem {
    async fn notify_state(&self, branch: &Branch, state: BranchState) {
        self.post(&TicketEvent::State {
            branch: &branch.name,
            state,
        })
        .await;
    }

    async fn comment(&self, branch: &Branch, text: &str) {
        self.post(&TicketEvent::Comment {
            branch: &branch.name,
            text,
        })
        .await;
    }
}

/// Something a [`RecordingTicketSystem`] received.
#[derive(Debug, Clone, PartialEq)]
pub enum TicketRecord {
    State(String, BranchState),
    Comment(String, String),
}

/// Keeps every notification in memory (testing only).
#[derive(Debug, Default)]
pub struct RecordingTicketSystem {
    records: Mutex<Vec<TicketRecord>>,
}

impl RecordingTicketSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TicketRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl TicketSystem for RecordingTicketSystem {
    async fn notify_state(&self, branch: &Branch, state: BranchState) {
        self.records
            .lock()
            .unwrap()
            .push(TicketRecord::State(branch.name.clone(), state));
    }

    async fn comment(&self, branch: &Branch, text: &str) {
        self.records
            .lock()
            .unwrap()
            .push(TicketRecord::Comment(branch.name.clone(), text.to_string()));
    }
}
