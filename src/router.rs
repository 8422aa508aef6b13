use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};

use crate::error::{DeliveryError, Result, EXIT_SUCCESS};
use crate::forward::{Forwarder, PipeExecutor};
use crate::maildir::{MaildirWriter, Stored};
use crate::message::Message;
use crate::report::DeliveryResult;
use crate::resolver::Destination;

/// What a destination string asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Mailbox(PathBuf),
    Forward(String),
    Pipe(String),
    Invalid(String),
}

impl Target {
    /// `/` mailbox, then `@` forward, then `|` pipe; the order matters.
    pub fn classify(dest: &str) -> Self {
        if dest.starts_with('/') {
            Target::Mailbox(PathBuf::from(dest))
        } else if dest.contains('@') {
            Target::Forward(dest.to_string())
        } else if dest.starts_with('|') {
            Target::Pipe(dest.to_string())
        } else {
            Target::Invalid(dest.to_string())
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Target::Mailbox(_) => "mailbox",
            Target::Forward(_) => "forward",
            Target::Pipe(_) => "pipe",
            Target::Invalid(_) => "invalid",
        }
    }
}

pub struct Router<'a> {
    maildir: &'a MaildirWriter,
    forwarder: &'a Forwarder<'a>,
    pipe: &'a PipeExecutor,
}

impl<'a> Router<'a> {
    pub fn new(
        maildir: &'a MaildirWriter,
        forwarder: &'a Forwarder<'a>,
        pipe: &'a PipeExecutor,
    ) -> Self {
        Router {
            maildir,
            forwarder,
            pipe,
        }
    }

    /// Deliver to one destination; failures become the result code, never an early return.
    pub fn deliver(
        &self,
        destination: &Destination,
        message: &Message,
        is_spam: bool,
        dupfilter: bool,
    ) -> DeliveryResult {
        let path = destination.path(is_spam);
        let target = Target::classify(path);
        info!(
            "[router] uid={} {} -> {} ({})",
            destination.mailbox,
            if is_spam { "spam" } else { "ham" },
            path,
            target.kind()
        );

        let outcome = match &target {
            Target::Mailbox(dir) => self.to_mailbox(dir, message, dupfilter),
            Target::Forward(address) => self.forwarder.forward(address, message.raw()),
            Target::Pipe(command) => self.pipe.run(command, message.raw()),
            Target::Invalid(dest) => Err(DeliveryError::InvalidDestination(dest.clone())),
        };

        let (code, detail) = match outcome {
            Ok(code) => {
                if code != EXIT_SUCCESS {
                    warn!("[router] {} returned {}", path, code);
                }
                (code, None)
            }
            Err(e) => {
                error!("[router] delivery to {} failed: {}", path, e);
                (e.exit_code(), Some(e.to_string()))
            }
        };

        DeliveryResult {
            mailbox: destination.mailbox,
            destination: path.to_string(),
            kind: target.kind(),
            code,
            detail,
        }
    }

    fn to_mailbox(&self, dir: &Path, message: &Message, dupfilter: bool) -> Result<i32> {
        match self.maildir.deliver(dir, message, dupfilter)? {
            Stored::Written(path) => debug!("[router] stored as {}", path.display()),
            Stored::Duplicate(existing) => {
                info!("[router] duplicate of {}, treating as delivered", existing.display())
            }
            Stored::Discarded => debug!("[router] discarded for {}", dir.display()),
        }
        Ok(EXIT_SUCCESS)
    }
}
