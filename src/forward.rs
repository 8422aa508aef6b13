use log::{debug, info, warn};
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

use crate::error::{DeliveryError, Result, EXIT_TEMPORARY};

/// The MTA's local injection program (`qmail-inject -f <sender> <rcpt>`).
pub struct Injector {
    program: PathBuf,
    timeout: Duration,
}

impl Injector {
    pub fn new(program: &Path, timeout: Duration) -> Self {
        Injector {
            program: program.to_path_buf(),
            timeout,
        }
    }

    /// Hand `content` to the MTA for `recipient`; returns the injector's exit status.
    pub fn inject(&self, sender: &str, recipient: &str, content: &[u8]) -> Result<i32> {
        info!(
            "[inject] injecting {} bytes sender={}, recipient={}",
            content.len(),
            sender,
            recipient
        );
        let mut cmd = Command::new(&self.program);
        cmd.arg("-f").arg(sender).arg(recipient);
        run_with_stdin(cmd, &self.program.to_string_lossy(), content, self.timeout)
    }
}

pub struct Forwarder<'a> {
    injector: &'a Injector,
    bounce_sender: &'a str,
}

impl<'a> Forwarder<'a> {
    pub fn new(injector: &'a Injector, bounce_sender: &'a str) -> Self {
        Forwarder {
            injector,
            bounce_sender,
        }
    }

    pub fn forward(&self, address: &str, raw: &[u8]) -> Result<i32> {
        info!("[forward] forwarding to {}", address);
        self.injector.inject(self.bounce_sender, address, raw)
    }
}

/// Runs `|program args...` destinations with the message on stdin.
pub struct PipeExecutor {
    timeout: Duration,
}

impl PipeExecutor {
    pub fn new(timeout: Duration) -> Self {
        PipeExecutor { timeout }
    }

    pub fn run(&self, command: &str, raw: &[u8]) -> Result<i32> {
        let command = command.strip_prefix('|').unwrap_or(command).trim();
        let mut words = command.split_whitespace();
        let program = words.next().unwrap_or_default();

        if program.is_empty() || !is_executable(Path::new(program)) {
            warn!("[pipe] {:?} is missing or not executable", program);
            return Err(DeliveryError::NotExecutable(program.to_string()));
        }

        info!("[pipe] piping message into {}", command);
        let mut cmd = Command::new(program);
        cmd.args(words);
        run_with_stdin(cmd, program, raw, self.timeout)
    }
}

/// Execute permission for whoever we are running as.
fn is_executable(path: &Path) -> bool {
    let meta = match std::fs::metadata(path) {
        Ok(m) if m.is_file() => m,
        _ => return false,
    };
    // SAFETY: geteuid/getegid cannot fail and touch no memory.
    let (euid, egid) = unsafe { (libc::geteuid(), libc::getegid()) };
    let mode = meta.mode();

    let mask = if euid == 0 {
        0o111
    } else if meta.uid() == euid {
        0o100
    } else if meta.gid() == egid {
        0o010
    } else {
        0o001
    };
    mode & mask != 0
}

/// Spawn `cmd`, feed it `content` and wait at most `timeout` for it to exit.
/// A child still running at the deadline is killed and reported as temporary.
fn run_with_stdin(mut cmd: Command, name: &str, content: &[u8], timeout: Duration) -> Result<i32> {
    let spawn_err = |source| DeliveryError::Spawn {
        program: name.to_string(),
        source,
    };

    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .spawn()
        .map_err(spawn_err)?;

    // a child that never reads would block a direct write past the pipe buffer
    let writer = child.stdin.take().map(|mut stdin| {
        let content = content.to_vec();
        std::thread::spawn(move || stdin.write_all(&content))
    });

    let status = match child.wait_timeout(timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            warn!("[pipe] {} still running after {:?}, killing it", name, timeout);
            if let Err(e) = child.kill() {
                debug!("[pipe] kill {} failed: {}", name, e);
            }
            child.wait().map_err(spawn_err)?;
            // writer may still be blocked on the pipe; leave it detached
            drop(writer);
            return Ok(EXIT_TEMPORARY);
        }
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(spawn_err(e));
        }
    };

    let write_failed = match writer.map(|handle| handle.join()) {
        Some(Ok(Err(e))) => {
            warn!("[pipe] writing message to {} failed: {}", name, e);
            true
        }
        Some(Err(_)) => true,
        _ => false,
    };

    let code = match status.code() {
        Some(0) if write_failed => EXIT_TEMPORARY,
        Some(code) => code,
        None => {
            warn!("[pipe] {} was terminated by a signal", name);
            EXIT_TEMPORARY
        }
    };
    debug!("[pipe] {} exited with {}", name, code);
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    const TIMEOUT: Duration = Duration::from_secs(10);

    pub fn script(dir: &Path, name: &str, body: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn pipe_feeds_stdin_and_returns_status() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let prog = script(dir.path(), "save", "cat > \"$1\"; exit 3", 0o644);

        let code = PipeExecutor::new(TIMEOUT)
            .run(&format!("|/bin/sh {} {}", prog.display(), out.display()), b"hello pipe")
            .unwrap();
        assert_eq!(code, 3);
        assert_eq!(std::fs::read(out).unwrap(), b"hello pipe");
    }

    #[test]
    fn missing_program_is_not_executed() {
        let err = PipeExecutor::new(TIMEOUT).run("|/nonexistent/filter", b"x").unwrap_err();
        assert!(matches!(err, DeliveryError::NotExecutable(_)));
        assert_eq!(err.exit_code(), EXIT_TEMPORARY);
    }

    #[test]
    fn non_executable_program_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let prog = script(dir.path(), "plain", "exit 0", 0o644);
        assert!(!is_executable(&prog));
        let err = PipeExecutor::new(TIMEOUT).run(&format!("|{}", prog.display()), b"x").unwrap_err();
        assert!(matches!(err, DeliveryError::NotExecutable(_)));
    }

    #[test]
    fn directories_are_not_executable() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_executable(dir.path()));
    }

    #[test]
    fn injector_receives_sender_and_recipient() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("args");
        let body = dir.path().join("body");
        let prog = script(
            dir.path(),
            "inject",
            &format!("echo \"$@\" > {}; cat > {}", log.display(), body.display()),
            0o755,
        );

        let injector = Injector::new(&prog, TIMEOUT);
        let code = Forwarder::new(&injector, "bounces@mx.example")
            .forward("bob@elsewhere.net", b"raw message")
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(
            std::fs::read_to_string(log).unwrap().trim(),
            "-f bounces@mx.example bob@elsewhere.net"
        );
        assert_eq!(std::fs::read(body).unwrap(), b"raw message");
    }

    #[test]
    fn missing_injector_is_a_spawn_error() {
        let injector = Injector::new(Path::new("/nonexistent/qmail-inject"), TIMEOUT);
        let err = injector.inject("a@b", "c@d", b"x").unwrap_err();
        assert!(matches!(err, DeliveryError::Spawn { .. }));
    }

    #[test]
    fn hung_program_is_killed_and_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let prog = script(dir.path(), "hang", "sleep 30", 0o644);

        let started = std::time::Instant::now();
        let code = PipeExecutor::new(Duration::from_millis(300))
            .run(&format!("|/bin/sh {}", prog.display()), b"x")
            .unwrap();
        assert_eq!(code, EXIT_TEMPORARY);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn program_ignoring_large_input_still_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let prog = script(dir.path(), "inject", "sleep 30", 0o755);
        let injector = Injector::new(&prog, Duration::from_millis(300));
        let big = vec![b'a'; 1 << 20];
        assert_eq!(injector.inject("a@b", "c@d", &big).unwrap(), EXIT_TEMPORARY);
    }
}
