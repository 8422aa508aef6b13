use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_DIR: &str = "/etc/qbox";

/// Settings for one delivery run, read from one-value-per-file config.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_server: String,
    pub db_user: String,
    pub db_pass: String,
    pub db_name: String,
    pub recipient_prefix: String,
    pub inbox: String,
    pub spamd_addr: String,
    pub clamd_addr: String,
    pub scan_timeout: Duration,
    pub exec_timeout: Duration,
    pub spam_threshold: f64,
    pub bounce_sender: String,
    pub injector: PathBuf,
    pub autoresponder_window: chrono::Duration,
    pub hostname: String,
    pub debug: bool,
}

impl Config {
    pub fn load(dir: &Path) -> Self {
        let hostname = local_hostname();
        let reader = ConfigDir { dir };

        let scan_timeout = reader
            .parsed::<u64>("scan-timeout")
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(3));
        let exec_timeout = reader
            .parsed::<u64>("exec-timeout")
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(60));
        let window_days = reader.parsed::<i64>("autoresponder-window").unwrap_or(7);

        Config {
            db_server: reader.get_or("dbserver", "127.0.0.1"),
            db_user: reader.get_or("dbuser", "qbox"),
            db_pass: reader.get_or("dbpass", ""),
            db_name: reader.get_or("dbname", "qbox"),
            recipient_prefix: reader.get_or("recipient-prefix", ""),
            inbox: reader.get_or("inbox", "INBOX"),
            spamd_addr: reader.get_or("spamd", "127.0.0.1:783"),
            clamd_addr: reader.get_or("clamd", "127.0.0.1:3310"),
            scan_timeout,
            exec_timeout,
            spam_threshold: reader.parsed("spam-threshold").unwrap_or(5.0),
            bounce_sender: reader.get_or("bouncesender", &format!("bounces@{}", hostname)),
            injector: PathBuf::from(reader.get_or("injector", "/var/qmail/bin/qmail-inject")),
            autoresponder_window: chrono::Duration::days(window_days),
            debug: reader.get("debug").is_some(),
            hostname,
        }
    }

    /// libpq-style connection string for the directory store.
    pub fn db_url(&self) -> String {
        let (host, port) = match self.db_server.rsplit_once(':') {
            Some((h, p)) if p.parse::<u16>().is_ok() => (h, p),
            _ => (self.db_server.as_str(), "5432"),
        };
        let mut url = format!(
            "host={} port={} user={} dbname={} connect_timeout=5",
            host, port, self.db_user, self.db_name
        );
        if !self.db_pass.is_empty() {
            url.push_str(&format!(" password='{}'", self.db_pass.replace('\'', "\\'")));
        }
        url
    }
}

struct ConfigDir<'a> {
    dir: &'a Path,
}

impl ConfigDir<'_> {
    /// Environment (`DELIVER_<NAME>`) first, then `<dir>/<name>`.
    fn get(&self, name: &str) -> Option<String> {
        let env_key = format!("DELIVER_{}", name.to_uppercase().replace('-', "_"));
        if let Ok(v) = std::env::var(&env_key) {
            debug!("[config] {} taken from {}", name, env_key);
            return Some(v.trim().to_string());
        }

        let path = self.dir.join(name);
        if !path.is_file() {
            return None;
        }
        match std::fs::read_to_string(&path) {
            Ok(v) => Some(v.trim().to_string()),
            Err(e) => {
                warn!("[config] failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    fn get_or(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| {
            debug!("[config] {} not set, defaulting to {:?}", name, default);
            default.to_string()
        })
    }

    fn parsed<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        let raw = self.get(name)?;
        match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("[config] ignoring unparsable {}={:?}", name, raw);
                None
            }
        }
    }
}

pub fn local_hostname() -> String {
    gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_one_value_per_file_and_trims() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("inbox"), "Mail/INBOX\n").unwrap();
        std::fs::write(dir.path().join("spam-threshold"), "7.5\n").unwrap();
        std::fs::write(dir.path().join("dbserver"), "db.internal:6432").unwrap();

        let cfg = Config::load(dir.path());
        assert_eq!(cfg.inbox, "Mail/INBOX");
        assert_eq!(cfg.spam_threshold, 7.5);
        assert!(cfg.db_url().contains("host=db.internal port=6432"));
        assert!(!cfg.debug);
    }

    #[test]
    fn defaults_apply_for_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(dir.path());
        assert_eq!(cfg.db_user, "qbox");
        assert_eq!(cfg.spamd_addr, "127.0.0.1:783");
        assert_eq!(cfg.scan_timeout, Duration::from_secs(3));
        assert_eq!(cfg.exec_timeout, Duration::from_secs(60));
        assert_eq!(cfg.autoresponder_window, chrono::Duration::days(7));
        assert!(cfg.bounce_sender.starts_with("bounces@"));
        assert!(cfg.db_url().contains("port=5432"));
        assert!(!cfg.db_url().contains("password"));
    }

    #[test]
    fn unparsable_numbers_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("scan-timeout"), "soon").unwrap();
        let cfg = Config::load(dir.path());
        assert_eq!(cfg.scan_timeout, Duration::from_secs(3));
    }
}
