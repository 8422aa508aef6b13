use log::{debug, info, warn};
use serde::Serialize;
use std::path::Path;

use crate::db::{DirectoryStore, MailboxId};
use crate::error::{DeliveryError, Result};

/// Where one resolved mailbox wants its mail, for ham and for spam.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Destination {
    pub mailbox: MailboxId,
    pub default_path: String,
    pub spam_path: String,
}

impl Destination {
    pub fn path(&self, is_spam: bool) -> &str {
        if is_spam {
            &self.spam_path
        } else {
            &self.default_path
        }
    }
}

/// Envelope recipient after prefix stripping, rewrite and extension removal.
#[derive(Debug, Clone, PartialEq)]
pub struct Recipient {
    pub original: String,
    pub user: String,
    pub domain: String,
}

impl Recipient {
    pub fn address(&self) -> String {
        format!("{}@{}", self.user, self.domain)
    }
}

pub struct RecipientResolver<'a> {
    store: &'a dyn DirectoryStore,
    prefix: &'a str,
    inbox: &'a str,
}

impl<'a> RecipientResolver<'a> {
    pub fn new(store: &'a dyn DirectoryStore, prefix: &'a str, inbox: &'a str) -> Self {
        RecipientResolver {
            store,
            prefix,
            inbox,
        }
    }

    pub fn parse(&self, envelope: &str) -> Result<Recipient> {
        let original = envelope
            .strip_prefix(self.prefix)
            .unwrap_or(envelope)
            .to_string();

        let mut parts = original.split('@');
        let (user, domain) = match (parts.next(), parts.next()) {
            (Some(user), Some(domain)) => (user, domain),
            _ => {
                warn!("[resolver] cannot split {:?} into user and domain", original);
                return Err(DeliveryError::MalformedAddress(original));
            }
        };

        let user = match user.find('+') {
            Some(idx) => {
                debug!("[resolver] stripping extension {:?} from {}", &user[idx..], original);
                &user[..idx]
            }
            None => user,
        };

        let domain = match self.store.domain_rewrite(domain)? {
            Some(rewrite) => {
                info!("[resolver] domain {} is rewritten to {} for {}", domain, rewrite, original);
                rewrite
            }
            None => domain.to_string(),
        };

        Ok(Recipient {
            user: user.to_string(),
            domain,
            original,
        })
    }

    /// Map a recipient onto its mailboxes, falling back to the domain catch-all.
    pub fn resolve(&self, rcpt: &Recipient) -> Result<Vec<Destination>> {
        let mut ids = self.store.mailbox_ids(&rcpt.user, &rcpt.domain)?;
        if ids.is_empty() {
            debug!("[resolver] no mapping for {}, trying catch-all", rcpt.address());
            ids = self.store.mailbox_ids("*", &rcpt.domain)?;
        }

        let destinations: Vec<Destination> = if ids.is_empty() {
            Vec::new()
        } else {
            self.store
                .mailboxes(&ids)?
                .into_iter()
                .map(|row| {
                    let default_path = if Path::new(&row.homedir).is_absolute() {
                        join(&row.homedir, self.inbox)
                    } else {
                        row.homedir.clone()
                    };
                    let spam_path = match &row.spamfolder {
                        Some(folder) => join(&row.homedir, folder),
                        None => default_path.clone(),
                    };
                    Destination {
                        mailbox: row.id,
                        default_path,
                        spam_path,
                    }
                })
                .collect()
        };

        if destinations.is_empty() {
            warn!("[resolver] no destination for {}", rcpt.original);
            return Err(DeliveryError::UnknownRecipient(rcpt.original.clone()));
        }

        info!(
            "[resolver] {} resolved to {} destination(s)",
            rcpt.original,
            destinations.len()
        );
        Ok(destinations)
    }
}

fn join(base: &str, sub: &str) -> String {
    if sub.is_empty() {
        return base.to_string();
    }
    Path::new(base).join(sub).to_string_lossy().into_owned()
}
