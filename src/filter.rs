use log::{debug, info, warn};
use serde::Serialize;

use crate::message::Message;
use crate::scanner::{MalwareScanner, ScanStatus, SpamScorer};

/// Subject tags left by upstream filters that always mean spam.
const LEGACY_SPAM_MARKERS: [&str; 2] = ["[SPAM]", "*****SPAM*****"];

const MAX_SPAM_LEVEL: usize = 50;

/// What the filters learned about the message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FilterOutcome {
    pub spam_score: Option<f64>,
    pub legacy_marker: bool,
    pub virus_status: Option<String>,
    pub attachments_removed: usize,
}

impl FilterOutcome {
    /// Spam classification against one mailbox's threshold.
    pub fn is_spam(&self, threshold: f64) -> bool {
        self.legacy_marker || self.spam_score.map(|s| s >= threshold).unwrap_or(false)
    }
}

pub struct ContentFilter<'a> {
    spam: &'a dyn SpamScorer,
    malware: &'a dyn MalwareScanner,
}

impl<'a> ContentFilter<'a> {
    pub fn new(spam: &'a dyn SpamScorer, malware: &'a dyn MalwareScanner) -> Self {
        ContentFilter { spam, malware }
    }

    /// Run the enabled scanners. Scanner failures leave the message untouched.
    pub fn run(&self, message: &mut Message, antispam: bool, antivirus: bool) -> FilterOutcome {
        let mut outcome = FilterOutcome::default();

        if antispam {
            match self.spam.score(message.raw()) {
                Ok(verdict) => {
                    info!(
                        "[filter] spam verdict spam={}, score={:.1}, spamd threshold={:.1}",
                        verdict.is_spam, verdict.score, verdict.threshold
                    );
                    let view = message.view_mut();
                    view.set_header("X-Spam-Flag", if verdict.is_spam { "YES" } else { "NO" });
                    view.set_header("X-Spam-Score", &format!("{:.1}", verdict.score));
                    view.set_header("X-Spam-Level", &spam_level(verdict.score));
                    outcome.spam_score = Some(verdict.score);
                }
                Err(e) => warn!("[filter] spam scan failed, delivering unscanned: {}", e),
            }
        }

        if let Some(subject) = message.subject() {
            if LEGACY_SPAM_MARKERS.iter().any(|m| subject.contains(m)) {
                info!("[filter] subject carries an upstream spam marker");
                outcome.legacy_marker = true;
            }
        }

        if antivirus {
            match self.malware.scan(message.raw()) {
                Ok(status) => {
                    let view = message.view_mut();
                    view.set_header("X-Virus-Scanned", "clamd");
                    view.set_header("X-Virus-Status", &status.as_header());
                    if let ScanStatus::Infected(name) = &status {
                        outcome.attachments_removed = view.strip_attachments(&removal_notice(name));
                        info!(
                            "[filter] virus {} found, removed {} attachment(s)",
                            name, outcome.attachments_removed
                        );
                    } else {
                        debug!("[filter] virus scan clean");
                    }
                    outcome.virus_status = Some(status.as_header());
                }
                Err(e) => warn!("[filter] virus scan failed, delivering unscanned: {}", e),
            }
        }

        outcome
    }
}

fn spam_level(score: f64) -> String {
    let stars = if score > 0.0 { score.floor() as usize } else { 0 };
    "*".repeat(stars.min(MAX_SPAM_LEVEL))
}

fn removal_notice(signature: &str) -> String {
    format!(
        "The virus scanner detected {} in this message.\n\
         All attachments have been removed. Please contact the sender\n\
         if you expected a file from them.",
        signature
    )
}
