use log::{debug, info, warn};
use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::error::{DeliveryError, Result};
use crate::message::Message;

/// Destinations starting with this are disabled mailboxes: accept and drop.
pub const NULL_DEVICE: &str = "/dev/null";

#[derive(Debug, Clone, PartialEq)]
pub enum Stored {
    Discarded,
    Duplicate(PathBuf),
    Written(PathBuf),
}

pub struct MaildirWriter {
    hostname: String,
}

impl MaildirWriter {
    pub fn new(hostname: &str) -> Self {
        MaildirWriter {
            hostname: escape_hostname(hostname),
        }
    }

    pub fn deliver(&self, dir: &Path, message: &Message, dupfilter: bool) -> Result<Stored> {
        if dir.as_os_str().as_bytes().starts_with(NULL_DEVICE.as_bytes()) {
            info!("[maildir] {} is disabled, discarding message", dir.display());
            return Ok(Stored::Discarded);
        }

        check_layout(dir)?;

        if dupfilter {
            if let Some(existing) = find_delivered(dir, message.sha1()) {
                info!(
                    "[maildir] sha1={} already delivered as {}, skipping",
                    message.sha1(),
                    existing.display()
                );
                return Ok(Stored::Duplicate(existing));
            }
        }

        let filename = self.filename(message.sha1());
        let tmp = dir.join("tmp").join(&filename);
        let new = dir.join("new").join(&filename);

        debug!(
            "[maildir] writing {} bytes (modified={}) to {}",
            message.len(),
            message.is_dirty(),
            tmp.display()
        );
        if let Err(e) = write_new_file(&tmp, &message.content()) {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                let _ = fs::remove_file(&tmp);
            }
            return Err(DeliveryError::io("write", tmp, e));
        }

        commit(&tmp, &new)?;

        info!("[maildir] delivered to {}", new.display());
        Ok(Stored::Written(new))
    }

    /// `<unix nanos>.<pid>.<host>.<sha1>`
    fn filename(&self, sha1: &str) -> String {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        format!("{}.{}.{}.{}", nanos, std::process::id(), self.hostname, sha1)
    }
}

fn write_new_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content)?;
    file.sync_all()
}

/// Publish `tmp` as `new`. A failed link leaves `tmp` in place.
fn commit(tmp: &Path, new: &Path) -> Result<()> {
    fs::hard_link(tmp, new).map_err(|e| DeliveryError::io("link", new, e))?;
    fs::remove_file(tmp).map_err(|e| DeliveryError::io("unlink", tmp, e))
}

fn check_layout(dir: &Path) -> Result<()> {
    let invalid = |reason: String| DeliveryError::InvalidMaildir {
        path: dir.to_path_buf(),
        reason,
    };

    if !dir.is_dir() {
        warn!("[maildir] {} is not a directory", dir.display());
        return Err(invalid("not a directory".into()));
    }
    for sub in ["tmp", "new", "cur"] {
        let path = dir.join(sub);
        if !path.is_dir() {
            warn!("[maildir] {} is missing", path.display());
            return Err(invalid(format!("{} is missing", sub)));
        }
        if !writable(&path) {
            warn!("[maildir] {} is not writable", path.display());
            return Err(invalid(format!("{} is not writable", sub)));
        }
    }
    Ok(())
}

fn writable(path: &Path) -> bool {
    match CString::new(path.as_os_str().as_bytes()) {
        // SAFETY: `c` is a valid NUL-terminated string for the duration of the call.
        Ok(c) => unsafe { libc::access(c.as_ptr(), libc::W_OK) == 0 },
        Err(_) => false,
    }
}

/// Delivered copy of `sha1` anywhere below `dir`. The top-level `tmp/`
/// holds only unfinished writes and is not searched.
fn find_delivered(dir: &Path, sha1: &str) -> Option<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("[maildir] cannot read {}: {}", dir.display(), e);
            return None;
        }
    };
    for entry in entries.flatten() {
        if entry.file_name() == "tmp" {
            continue;
        }
        let path = entry.path();
        match entry.file_type() {
            Ok(t) if t.is_dir() => {
                if let Some(found) = find_by_hash(&path, sha1) {
                    return Some(found);
                }
            }
            Ok(_) if entry.file_name().to_string_lossy().contains(sha1) => return Some(path),
            _ => {}
        }
    }
    None
}

/// Depth-first search for any file whose name contains `sha1`.
fn find_by_hash(dir: &Path, sha1: &str) -> Option<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("[maildir] cannot read {}: {}", dir.display(), e);
            return None;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(_) => continue,
        };
        if file_type.is_dir() {
            if let Some(found) = find_by_hash(&path, sha1) {
                return Some(found);
            }
        } else if entry.file_name().to_string_lossy().contains(sha1) {
            return Some(path);
        }
    }
    None
}

fn escape_hostname(host: &str) -> String {
    host.replace('/', "\\057").replace(':', "\\072")
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn maildir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["tmp", "new", "cur"] {
            fs::create_dir(dir.path().join(sub)).unwrap();
        }
        dir
    }

    fn count(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn writes_into_new_and_leaves_tmp_empty() {
        let dir = maildir();
        let m = Message::new(b"Subject: hi\n\nbody\n".to_vec());
        let stored = MaildirWriter::new("mx1").deliver(dir.path(), &m, false).unwrap();

        let Stored::Written(path) = stored else {
            panic!("expected a written file");
        };
        assert!(path.starts_with(dir.path().join("new")));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with(&format!(".{}.mx1.{}", std::process::id(), m.sha1())));
        assert_eq!(fs::read(&path).unwrap(), m.raw());
        assert_eq!(count(&dir.path().join("tmp")), 0);
    }

    #[test]
    fn written_files_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = maildir();
        let m = Message::new(b"x".to_vec());
        let Stored::Written(path) = MaildirWriter::new("h").deliver(dir.path(), &m, false).unwrap()
        else {
            panic!("expected a written file");
        };
        assert_eq!(fs::metadata(path).unwrap().permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn modified_message_is_stored_in_modified_form() {
        let dir = maildir();
        let mut m = Message::new(b"Subject: hi\n\nbody\n".to_vec());
        m.view_mut().set_header("X-Spam-Flag", "NO");
        let Stored::Written(path) = MaildirWriter::new("h").deliver(dir.path(), &m, false).unwrap()
        else {
            panic!("expected a written file");
        };
        let stored = fs::read_to_string(path).unwrap();
        assert!(stored.contains("X-Spam-Flag: NO"));
    }

    #[test]
    fn duplicate_is_not_written_twice() {
        let dir = maildir();
        let m = Message::new(b"Subject: same\n\nbody\n".to_vec());
        let writer = MaildirWriter::new("h");
        assert!(matches!(writer.deliver(dir.path(), &m, true).unwrap(), Stored::Written(_)));
        assert!(matches!(writer.deliver(dir.path(), &m, true).unwrap(), Stored::Duplicate(_)));
        assert_eq!(count(&dir.path().join("new")), 1);
    }

    #[test]
    fn duplicate_found_in_subfolders() {
        let dir = maildir();
        let m = Message::new(b"moved to cur".to_vec());
        let nested = dir.path().join(".Archive").join("cur");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join(format!("1.2.h.{}:2,S", m.sha1())), m.raw()).unwrap();

        let stored = MaildirWriter::new("h").deliver(dir.path(), &m, true).unwrap();
        assert!(matches!(stored, Stored::Duplicate(_)));
        assert_eq!(count(&dir.path().join("new")), 0);
    }

    #[test]
    fn dupfilter_off_writes_again() {
        let dir = maildir();
        let m = Message::new(b"twice".to_vec());
        let writer = MaildirWriter::new("h");
        writer.deliver(dir.path(), &m, false).unwrap();
        writer.deliver(dir.path(), &m, false).unwrap();
        assert_eq!(count(&dir.path().join("new")), 2);
    }

    #[test]
    fn missing_subdirectory_is_invalid() {
        let dir = maildir();
        fs::remove_dir(dir.path().join("cur")).unwrap();
        let m = Message::new(b"x".to_vec());
        let err = MaildirWriter::new("h").deliver(dir.path(), &m, false).unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidMaildir { .. }));
        assert_eq!(err.exit_code(), crate::error::EXIT_PERMANENT);
    }

    #[test]
    fn non_directory_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, b"").unwrap();
        let m = Message::new(b"x".to_vec());
        let err = MaildirWriter::new("h").deliver(&file, &m, false).unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidMaildir { .. }));
    }

    #[test]
    fn failed_link_leaves_tmp_orphan_and_nothing_in_new() {
        let dir = maildir();
        let tmp = dir.path().join("tmp").join("1.2.h.abc");
        fs::write(&tmp, b"x").unwrap();
        let new = dir.path().join("missing").join("1.2.h.abc");

        let err = commit(&tmp, &new).unwrap_err();
        assert!(matches!(err, DeliveryError::Io { action: "link", .. }));
        assert_eq!(err.exit_code(), crate::error::EXIT_TEMPORARY);
        assert!(tmp.exists());
        assert_eq!(count(&dir.path().join("new")), 0);
    }

    #[test]
    fn tmp_orphan_is_not_a_duplicate() {
        let dir = maildir();
        let m = Message::new(b"Subject: retried\n\nbody\n".to_vec());
        fs::write(dir.path().join("tmp").join(format!("1.2.h.{}", m.sha1())), m.raw()).unwrap();

        let stored = MaildirWriter::new("h").deliver(dir.path(), &m, true).unwrap();
        assert!(matches!(stored, Stored::Written(_)));
        assert_eq!(count(&dir.path().join("new")), 1);
    }

    #[test]
    fn null_device_discards() {
        let m = Message::new(b"x".to_vec());
        let stored = MaildirWriter::new("h")
            .deliver(Path::new("/dev/null/disabled"), &m, true)
            .unwrap();
        assert_eq!(stored, Stored::Discarded);
    }

    #[test]
    fn existing_tmp_file_is_never_overwritten() {
        let dir = maildir();
        let path = dir.path().join("tmp").join("taken");
        fs::write(&path, b"original").unwrap();
        let err = write_new_file(&path, b"replacement").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read(&path).unwrap(), b"original");
    }

    #[test]
    fn hostname_is_escaped() {
        assert_eq!(escape_hostname("a/b:c"), "a\\057b\\072c");
    }
}
