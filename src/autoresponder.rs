use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::Mailbox;
use log::{debug, info, warn};
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

use crate::db::{DirectoryStore, MailboxId};
use crate::forward::Injector;
use crate::message::Message;

static NO_REPLY: OnceLock<Regex> = OnceLock::new();

fn no_reply_re() -> &'static Regex {
    NO_REPLY.get_or_init(|| {
        Regex::new(r"(?i)^(no-?reply|do-?not-?reply|mailer-daemon|postmaster|bounces?)([+\-_.].*)?$")
            .expect("Invalid regex")
    })
}

/// Senders we must never answer: null senders and no-reply style mailboxes.
pub fn is_unanswerable(sender: &str) -> bool {
    let sender = sender.trim();
    if sender.is_empty() || sender == "#@[]" || sender == "<>" {
        return true;
    }
    match sender.rsplit_once('@') {
        Some((local, domain)) => local.is_empty() || domain.is_empty() || no_reply_re().is_match(local),
        None => true,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "lowercase")]
pub enum AutoReply {
    Suppressed(&'static str),
    Sent,
    Failed(String),
}

#[derive(Clone)]
struct AutoSubmitted(String);

impl Header for AutoSubmitted {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("Auto-Submitted")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(AutoSubmitted(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

pub struct Autoresponder<'a> {
    store: &'a dyn DirectoryStore,
    injector: &'a Injector,
    window: chrono::Duration,
    hostname: &'a str,
}

impl<'a> Autoresponder<'a> {
    pub fn new(
        store: &'a dyn DirectoryStore,
        injector: &'a Injector,
        window: chrono::Duration,
        hostname: &'a str,
    ) -> Self {
        Autoresponder {
            store,
            injector,
            window,
            hostname,
        }
    }

    /// Answer `sender` on behalf of `mailbox`/`recipient` when every throttle allows it.
    /// `enabled` is the mailbox's autoresponder feature flag.
    pub fn respond(
        &self,
        mailbox: MailboxId,
        enabled: bool,
        recipient: &str,
        sender: Option<&str>,
        message: &Message,
    ) -> AutoReply {
        if !enabled {
            return AutoReply::Suppressed("disabled");
        }
        match self.try_respond(mailbox, recipient, sender, message) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("[autoresponder] uid={} failed: {}", mailbox, e);
                AutoReply::Failed(e)
            }
        }
    }

    fn try_respond(
        &self,
        mailbox: MailboxId,
        recipient: &str,
        sender: Option<&str>,
        message: &Message,
    ) -> Result<AutoReply, String> {
        let store_err = |e: crate::error::DeliveryError| e.to_string();

        let sender = match sender {
            Some(s) if !is_unanswerable(s) => s,
            _ => {
                debug!("[autoresponder] no answerable sender for uid={}", mailbox);
                return Ok(AutoReply::Suppressed("sender"));
            }
        };
        if message.has_header("List-ID") {
            return Ok(AutoReply::Suppressed("mailing list"));
        }
        if !message.has_header("X-Mailer") {
            return Ok(AutoReply::Suppressed("no x-mailer"));
        }
        if self
            .store
            .has_recent_response(mailbox, sender, self.window)
            .map_err(store_err)?
        {
            debug!("[autoresponder] already answered {} for uid={}", sender, mailbox);
            return Ok(AutoReply::Suppressed("throttled"));
        }
        let text = match self.store.autoresponder_text(mailbox).map_err(store_err)? {
            Some(text) => text,
            None => return Ok(AutoReply::Suppressed("no text")),
        };

        let reply = self.build_reply(recipient, sender, message, &text)?;
        let code = self
            .injector
            .inject(recipient, sender, &reply)
            .map_err(|e| e.to_string())?;
        if code != 0 {
            return Err(format!("injector exited with {}", code));
        }

        self.store
            .record_response(mailbox, sender)
            .map_err(store_err)?;
        info!("[autoresponder] answered {} on behalf of {}", sender, recipient);
        Ok(AutoReply::Sent)
    }

    fn build_reply(
        &self,
        recipient: &str,
        sender: &str,
        original: &Message,
        text: &str,
    ) -> Result<Vec<u8>, String> {
        let from: Mailbox = recipient
            .parse()
            .map_err(|e| format!("invalid recipient {}: {}", recipient, e))?;
        let to: Mailbox = sender
            .parse()
            .map_err(|e| format!("invalid sender {}: {}", sender, e))?;

        let subject = match original.subject() {
            Some(s) if !s.trim().is_empty() => format!("Re: {}", s.trim()),
            _ => "Automatic reply".to_string(),
        };

        let mut builder = lettre::Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .message_id(Some(format!("<{}@{}>", uuid::Uuid::new_v4(), self.hostname)))
            .header(AutoSubmitted("auto-replied".to_string()))
            .header(ContentType::TEXT_PLAIN);
        if let Some(id) = original.header("Message-ID") {
            builder = builder.in_reply_to(id.clone()).references(id);
        }

        let reply = builder
            .body(text.to_string())
            .map_err(|e| format!("cannot build reply: {}", e))?;
        Ok(reply.formatted())
    }
}
