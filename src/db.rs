use log::{debug, error, info, warn};
use postgres::{Client, NoTls};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{DeliveryError, Result};

pub type MailboxId = i64;

/// Per-mailbox switches stored in the `features` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    Antispam,
    Antivirus,
    Dupfilter,
    Autoresponder,
}

impl Feature {
    pub const ALL: [Feature; 4] = [
        Feature::Antispam,
        Feature::Antivirus,
        Feature::Dupfilter,
        Feature::Autoresponder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Antispam => "antispam",
            Feature::Antivirus => "antivirus",
            Feature::Dupfilter => "dupfilter",
            Feature::Autoresponder => "autoresponder",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MailboxRow {
    pub id: MailboxId,
    pub homedir: String,
    pub spamfolder: Option<String>,
}

/// Read-mostly lookups the delivery agent needs from the account directory.
pub trait DirectoryStore {
    fn domain_rewrite(&self, domain: &str) -> Result<Option<String>>;
    fn mailbox_ids(&self, user: &str, domain: &str) -> Result<Vec<MailboxId>>;
    fn mailboxes(&self, ids: &[MailboxId]) -> Result<Vec<MailboxRow>>;
    fn feature_enabled(&self, id: MailboxId, feature: Feature) -> Result<bool>;
    fn spam_threshold(&self, id: MailboxId) -> Result<Option<f64>>;
    fn autoresponder_text(&self, id: MailboxId) -> Result<Option<String>>;
    fn has_recent_response(
        &self,
        id: MailboxId,
        recipient: &str,
        window: chrono::Duration,
    ) -> Result<bool>;
    fn record_response(&self, id: MailboxId, recipient: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Client>>,
}

impl Database {
    /// Single connection attempt; the MTA retries the whole delivery on failure.
    pub fn connect(url: &str) -> Result<Self> {
        debug!("[db] connecting to PostgreSQL");
        let client = Client::connect(url, NoTls).map_err(|e| {
            error!("[db] failed to connect to PostgreSQL: {}", e);
            DeliveryError::StoreUnavailable(e.to_string())
        })?;
        info!("[db] PostgreSQL connection established");
        Ok(Database {
            conn: Arc::new(Mutex::new(client)),
        })
    }

    /// Acquire the connection after checking it is still usable.
    fn conn(&self) -> Result<MutexGuard<'_, Client>> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| {
            warn!("[db] mutex was poisoned, recovering connection");
            e.into_inner()
        });
        conn.is_valid(Duration::from_secs(2)).map_err(|e| {
            error!("[db] connection is no longer valid: {}", e);
            DeliveryError::StoreUnavailable(e.to_string())
        })?;
        Ok(conn)
    }
}

impl DirectoryStore for Database {
    fn domain_rewrite(&self, domain: &str) -> Result<Option<String>> {
        debug!("[db] looking up rewrite for domain={}", domain);
        let row = self.conn()?.query_opt(
            "SELECT rewrite FROM domains WHERE domain = $1 AND rewrite <> '' LIMIT 1",
            &[&domain],
        )?;
        Ok(row.map(|r| r.get::<_, String>(0)))
    }

    fn mailbox_ids(&self, user: &str, domain: &str) -> Result<Vec<MailboxId>> {
        debug!("[db] looking up mailboxes for user={}, domain={}", user, domain);
        let rows = self.conn()?.query(
            "SELECT DISTINCT uid FROM mapping WHERE domain = $1 AND \"user\" = $2 ORDER BY uid",
            &[&domain, &user],
        )?;
        Ok(rows.iter().map(|r| r.get::<_, i64>(0)).collect())
    }

    fn mailboxes(&self, ids: &[MailboxId]) -> Result<Vec<MailboxRow>> {
        debug!("[db] loading homedirs for uids={:?}", ids);
        let rows = self.conn()?.query(
            "SELECT uid, homedir, spamfolder FROM passwd
             WHERE uid = ANY($1) AND homedir <> '' ORDER BY uid",
            &[&ids],
        )?;
        Ok(rows
            .iter()
            .map(|r| MailboxRow {
                id: r.get(0),
                homedir: r.get(1),
                spamfolder: r
                    .get::<_, Option<String>>(2)
                    .filter(|s| !s.trim().is_empty()),
            })
            .collect())
    }

    fn feature_enabled(&self, id: MailboxId, feature: Feature) -> Result<bool> {
        let row = self.conn()?.query_opt(
            "SELECT 1 FROM features WHERE uid = $1 AND feature = $2 LIMIT 1",
            &[&id, &feature.as_str()],
        )?;
        debug!("[db] feature {} for uid={}: {}", feature.as_str(), id, row.is_some());
        Ok(row.is_some())
    }

    fn spam_threshold(&self, id: MailboxId) -> Result<Option<f64>> {
        let row = self.conn()?.query_opt(
            "SELECT score FROM spamlimits WHERE uid = $1 LIMIT 1",
            &[&id],
        )?;
        Ok(row.and_then(|r| r.get::<_, Option<f64>>(0)))
    }

    fn autoresponder_text(&self, id: MailboxId) -> Result<Option<String>> {
        let row = self.conn()?.query_opt(
            "SELECT message FROM autoresponder WHERE uid = $1 LIMIT 1",
            &[&id],
        )?;
        Ok(row
            .and_then(|r| r.get::<_, Option<String>>(0))
            .filter(|s| !s.trim().is_empty()))
    }

    fn has_recent_response(
        &self,
        id: MailboxId,
        recipient: &str,
        window: chrono::Duration,
    ) -> Result<bool> {
        let secs = window.num_seconds() as f64;
        let row = self.conn()?.query_opt(
            "SELECT 1 FROM autoresponder_history
             WHERE uid = $1 AND recipient = $2 AND sent_at > now() - make_interval(secs => $3)
             LIMIT 1",
            &[&id, &recipient, &secs],
        )?;
        Ok(row.is_some())
    }

    fn record_response(&self, id: MailboxId, recipient: &str) -> Result<()> {
        info!("[db] recording autoresponse uid={}, recipient={}", id, recipient);
        self.conn()?.execute(
            "INSERT INTO autoresponder_history (uid, recipient, sent_at) VALUES ($1, $2, now())",
            &[&id, &recipient],
        )?;
        Ok(())
    }
}

#[cfg(test)]
pub use memory::MemoryStore;
