use log::info;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::autoresponder::AutoReply;
use crate::db::{Feature, MailboxId};
use crate::error::{EXIT_SUCCESS, EXIT_TEMPORARY};
use crate::filter::FilterOutcome;

/// Outcome of one destination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryResult {
    pub mailbox: MailboxId,
    pub destination: String,
    pub kind: &'static str,
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DeliveryResult {
    pub fn succeeded(&self) -> bool {
        self.code == EXIT_SUCCESS
    }
}

/// Single destination: its code verbatim. Fan-out: success only if all succeeded.
pub fn aggregate(results: &[DeliveryResult]) -> i32 {
    match results {
        [] => EXIT_TEMPORARY,
        [only] => only.code,
        many if many.iter().all(DeliveryResult::succeeded) => EXIT_SUCCESS,
        _ => EXIT_TEMPORARY,
    }
}

/// Everything one invocation did, logged once as JSON.
#[derive(Debug, Default, Serialize)]
pub struct DeliveryReport {
    pub sender: Option<String>,
    pub recipient: String,
    pub size: usize,
    pub sha1: String,
    pub features: BTreeMap<MailboxId, Vec<Feature>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterOutcome>,
    pub results: Vec<DeliveryResult>,
    pub autoreplies: BTreeMap<MailboxId, AutoReply>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u128,
    pub exit_code: i32,
}

impl DeliveryReport {
    pub fn log(&self) {
        match serde_json::to_string(self) {
            Ok(json) => info!("[report] {}", json),
            Err(e) => info!("[report] exit={} (unserialisable report: {})", self.exit_code, e),
        }
    }
}
