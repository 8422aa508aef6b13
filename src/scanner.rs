use log::{debug, warn};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("cannot reach {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o with scanner failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected scanner reply: {0:?}")]
    Protocol(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpamVerdict {
    pub is_spam: bool,
    pub score: f64,
    /// spamd's own required score; routing uses the mailbox threshold instead.
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanStatus {
    Clean,
    Infected(String),
}

impl ScanStatus {
    pub fn as_header(&self) -> String {
        match self {
            ScanStatus::Clean => "clean".to_string(),
            ScanStatus::Infected(name) => format!("infected ({})", name),
        }
    }
}

/// Scores a message for spam.
pub trait SpamScorer {
    fn score(&self, raw: &[u8]) -> Result<SpamVerdict, ScanError>;
}

/// Scans a message for malware.
pub trait MalwareScanner {
    fn scan(&self, raw: &[u8]) -> Result<ScanStatus, ScanError>;
}

fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, ScanError> {
    let connect_err = |source| ScanError::Connect {
        addr: addr.to_string(),
        source,
    };
    let sockaddr = addr
        .to_socket_addrs()
        .map_err(connect_err)?
        .next()
        .ok_or_else(|| {
            connect_err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "address did not resolve",
            ))
        })?;

    debug!("[scanner] connecting to {}", addr);
    let stream = TcpStream::connect_timeout(&sockaddr, timeout).map_err(connect_err)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    stream.set_write_timeout(Some(READ_TIMEOUT))?;
    Ok(stream)
}

const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// SpamAssassin `spamd` client (SPAMC/1.5 `CHECK`).
pub struct Spamd {
    addr: String,
    timeout: Duration,
}

impl Spamd {
    pub fn new(addr: &str, timeout: Duration) -> Self {
        Spamd {
            addr: addr.to_string(),
            timeout,
        }
    }
}

impl SpamScorer for Spamd {
    fn score(&self, raw: &[u8]) -> Result<SpamVerdict, ScanError> {
        let mut stream = connect(&self.addr, self.timeout)?;
        write!(
            stream,
            "CHECK SPAMC/1.5\r\nContent-length: {}\r\n\r\n",
            raw.len()
        )?;
        stream.write_all(raw)?;
        stream.flush()?;
        stream.shutdown(Shutdown::Write)?;

        let mut reply = String::new();
        stream.read_to_string(&mut reply)?;
        parse_spamd_reply(&reply)
    }
}

/// `SPAMD/1.1 0 EX_OK` followed by `Spam: True ; 15.0 / 5.0`.
fn parse_spamd_reply(reply: &str) -> Result<SpamVerdict, ScanError> {
    let mut lines = reply.lines();
    let status = lines.next().unwrap_or_default();
    let mut fields = status.split_whitespace();
    if !fields.next().unwrap_or_default().starts_with("SPAMD/") {
        return Err(ScanError::Protocol(status.to_string()));
    }
    if fields.next() != Some("0") {
        return Err(ScanError::Protocol(status.to_string()));
    }

    for line in lines {
        let Some(rest) = line.strip_prefix("Spam:") else {
            continue;
        };
        let (flag, scores) = rest
            .split_once(';')
            .ok_or_else(|| ScanError::Protocol(line.to_string()))?;
        let (score, threshold) = scores
            .split_once('/')
            .and_then(|(s, t)| Some((s.trim().parse::<f64>().ok()?, t.trim().parse::<f64>().ok()?)))
            .ok_or_else(|| ScanError::Protocol(line.to_string()))?;
        let is_spam = matches!(flag.trim().to_ascii_lowercase().as_str(), "true" | "yes");
        return Ok(SpamVerdict {
            is_spam,
            score,
            threshold,
        });
    }

    Err(ScanError::Protocol(reply.to_string()))
}

/// ClamAV `clamd` client (`zINSTREAM`).
pub struct Clamd {
    addr: String,
    timeout: Duration,
}

impl Clamd {
    pub fn new(addr: &str, timeout: Duration) -> Self {
        Clamd {
            addr: addr.to_string(),
            timeout,
        }
    }
}

const CHUNK: usize = 64 * 1024;

impl MalwareScanner for Clamd {
    fn scan(&self, raw: &[u8]) -> Result<ScanStatus, ScanError> {
        let mut stream = connect(&self.addr, self.timeout)?;
        stream.write_all(b"zINSTREAM\0")?;
        for chunk in raw.chunks(CHUNK) {
            stream.write_all(&(chunk.len() as u32).to_be_bytes())?;
            stream.write_all(chunk)?;
        }
        stream.write_all(&0u32.to_be_bytes())?;
        stream.flush()?;

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply)?;
        parse_clamd_reply(&String::from_utf8_lossy(&reply))
    }
}

/// `stream: OK`, `stream: <name> FOUND` or `... ERROR`.
fn parse_clamd_reply(reply: &str) -> Result<ScanStatus, ScanError> {
    let reply = reply.trim_end_matches(['\0', '\n', '\r']);
    let result = reply.split_once(": ").map(|(_, r)| r).unwrap_or(reply);

    if result == "OK" {
        Ok(ScanStatus::Clean)
    } else if let Some(name) = result.strip_suffix(" FOUND") {
        warn!("[scanner] clamd found {}", name);
        Ok(ScanStatus::Infected(name.to_string()))
    } else {
        Err(ScanError::Protocol(reply.to_string()))
    }
}
