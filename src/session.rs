use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use crate::autoresponder::Autoresponder;
use crate::config::Config;
use crate::db::{Database, DirectoryStore, Feature, MailboxId};
use crate::error::{DeliveryError, Result, EXIT_TEMPORARY};
use crate::filter::ContentFilter;
use crate::forward::{Forwarder, Injector, PipeExecutor};
use crate::maildir::MaildirWriter;
use crate::message::Message;
use crate::report::{self, DeliveryReport};
use crate::resolver::{Destination, RecipientResolver};
use crate::router::Router;
use crate::scanner::{Clamd, MalwareScanner, SpamScorer, Spamd};

/// Envelope addresses handed over by the MTA.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub recipient: String,
    pub sender: Option<String>,
}

impl Envelope {
    pub fn from_env() -> Result<Self> {
        let recipient = std::env::var("RECIPIENT")
            .ok()
            .filter(|r| !r.is_empty())
            .ok_or(DeliveryError::MissingEnv("RECIPIENT"))?;
        let sender = std::env::var("SENDER").ok().filter(|s| !s.is_empty());
        Ok(Envelope { recipient, sender })
    }
}

/// Per-mailbox settings gathered once per delivery.
struct Profile {
    features: HashSet<Feature>,
    threshold: f64,
}

impl Profile {
    fn has(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }
}

/// Everything one delivery needs, passed in rather than held globally.
pub struct Session<'a> {
    config: &'a Config,
    store: &'a dyn DirectoryStore,
    spam: &'a dyn SpamScorer,
    malware: &'a dyn MalwareScanner,
}

impl<'a> Session<'a> {
    pub fn new(
        config: &'a Config,
        store: &'a dyn DirectoryStore,
        spam: &'a dyn SpamScorer,
        malware: &'a dyn MalwareScanner,
    ) -> Self {
        Session {
            config,
            store,
            spam,
            malware,
        }
    }

    pub fn deliver(&self, envelope: &Envelope, raw: Vec<u8>) -> DeliveryReport {
        let started = Instant::now();
        let mut message = Message::new(raw);
        let mut report = DeliveryReport {
            sender: envelope.sender.clone(),
            recipient: envelope.recipient.clone(),
            size: message.len(),
            sha1: message.sha1().to_string(),
            ..Default::default()
        };

        info!(
            "[session] delivering {} bytes sha1={} to {}",
            message.len(),
            message.sha1(),
            envelope.recipient
        );
        report.exit_code = match self.process(envelope, &mut message, &mut report) {
            Ok(code) => code,
            Err(e) => {
                error!("[session] delivery to {} failed: {}", envelope.recipient, e);
                report.error = Some(e.to_string());
                e.exit_code()
            }
        };
        report.elapsed_ms = started.elapsed().as_millis();
        report
    }

    fn process(
        &self,
        envelope: &Envelope,
        message: &mut Message,
        report: &mut DeliveryReport,
    ) -> Result<i32> {
        let config = self.config;
        let resolver =
            RecipientResolver::new(self.store, &config.recipient_prefix, &config.inbox);
        let rcpt = resolver.parse(&envelope.recipient)?;
        let destinations = resolver.resolve(&rcpt)?;

        let profiles = self.profiles(&destinations)?;
        for (id, profile) in &profiles {
            let mut enabled: Vec<Feature> =
                Feature::ALL.into_iter().filter(|f| profile.has(*f)).collect();
            enabled.sort_by_key(|f| f.as_str());
            report.features.insert(*id, enabled);
        }

        let antispam = profiles.values().any(|p| p.has(Feature::Antispam));
        let antivirus = profiles.values().any(|p| p.has(Feature::Antivirus));
        let outcome = ContentFilter::new(self.spam, self.malware).run(message, antispam, antivirus);

        let writer = MaildirWriter::new(&config.hostname);
        let injector = Injector::new(&config.injector, config.exec_timeout);
        let forwarder = Forwarder::new(&injector, &config.bounce_sender);
        let pipe = PipeExecutor::new(config.exec_timeout);
        let router = Router::new(&writer, &forwarder, &pipe);

        for dest in &destinations {
            let profile = &profiles[&dest.mailbox];
            let is_spam = if profile.has(Feature::Antispam) {
                outcome.is_spam(profile.threshold)
            } else {
                outcome.legacy_marker
            };
            let result = router.deliver(dest, message, is_spam, profile.has(Feature::Dupfilter));
            report.results.push(result);
        }
        report.filter = Some(outcome);

        let autoresponder = Autoresponder::new(
            self.store,
            &injector,
            config.autoresponder_window,
            &config.hostname,
        );
        let recipient = rcpt.address();
        for (id, profile) in &profiles {
            let delivered = report
                .results
                .iter()
                .filter(|r| r.mailbox == *id)
                .all(|r| r.succeeded());
            if !delivered {
                debug!("[session] uid={} not delivered, no autoresponse", id);
                continue;
            }
            let reply = autoresponder.respond(
                *id,
                profile.has(Feature::Autoresponder),
                &recipient,
                envelope.sender.as_deref(),
                message,
            );
            report.autoreplies.insert(*id, reply);
        }

        Ok(report::aggregate(&report.results))
    }

    fn profiles(&self, destinations: &[Destination]) -> Result<BTreeMap<MailboxId, Profile>> {
        let mut profiles = BTreeMap::new();
        for dest in destinations {
            if profiles.contains_key(&dest.mailbox) {
                continue;
            }
            let mut features = HashSet::new();
            for feature in Feature::ALL {
                if self.store.feature_enabled(dest.mailbox, feature)? {
                    features.insert(feature);
                }
            }
            let threshold = self
                .store
                .spam_threshold(dest.mailbox)?
                .unwrap_or(self.config.spam_threshold);
            profiles.insert(dest.mailbox, Profile { features, threshold });
        }
        Ok(profiles)
    }
}

/// Read the message, open the directory and deliver; returns the exit status.
pub fn run(config: &Config, input: &mut dyn Read) -> i32 {
    let envelope = match Envelope::from_env() {
        Ok(env) => env,
        Err(e) => {
            error!("[session] {}", e);
            return e.exit_code();
        }
    };

    let mut raw = Vec::new();
    if let Err(e) = input.read_to_end(&mut raw) {
        error!("[session] failed to read message from stdin: {}", e);
        return EXIT_TEMPORARY;
    }

    let store = match Database::connect(&config.db_url()) {
        Ok(db) => db,
        Err(e) => {
            error!("[session] {}", e);
            return e.exit_code();
        }
    };
    let spamd = Spamd::new(&config.spamd_addr, config.scan_timeout);
    let clamd = Clamd::new(&config.clamd_addr, config.scan_timeout);

    let report = Session::new(config, &store, &spamd, &clamd).deliver(&envelope, raw);
    report.log();
    report.exit_code
}

/// Turn any panic inside `f` into a temporary failure.
pub fn fault_barrier<F: FnOnce() -> i32>(f: F) -> i32 {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(code) => code,
        Err(payload) => {
            let what = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            warn!("[session] caught panic, deferring delivery: {}", what);
            EXIT_TEMPORARY
        }
    }
}
