use log::{debug, warn};
use mailparse::{DispositionType, MailHeader, MailHeaderMap, ParsedMail};
use sha1::{Digest, Sha1};
use std::borrow::Cow;

/// An inbound message as read from stdin.
///
/// The raw bytes and their SHA-1 never change. Header edits and attachment
/// removal go to a lazily built [`MessageView`]; once that exists the
/// message is dirty and [`Message::content`] serves the view instead.
pub struct Message {
    raw: Vec<u8>,
    sha1: String,
    view: Option<MessageView>,
}

impl Message {
    pub fn new(raw: Vec<u8>) -> Self {
        let sha1 = sha1_hex(&raw);
        Message {
            raw,
            sha1,
            view: None,
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn sha1(&self) -> &str {
        &self.sha1
    }

    pub fn is_dirty(&self) -> bool {
        self.view.is_some()
    }

    /// Structured view for modification; marks the message dirty.
    pub fn view_mut(&mut self) -> &mut MessageView {
        let raw = &self.raw;
        self.view.get_or_insert_with(|| MessageView::parse(raw))
    }

    /// Bytes to store: the re-serialised view when modified, else the raw input.
    pub fn content(&self) -> Cow<'_, [u8]> {
        match &self.view {
            Some(view) => Cow::Owned(view.to_bytes()),
            None => Cow::Borrowed(&self.raw),
        }
    }

    /// First value of a header in the message as received.
    pub fn header(&self, name: &str) -> Option<String> {
        match mailparse::parse_headers(&self.raw) {
            Ok((headers, _)) => headers.get_first_value(name),
            Err(e) => {
                warn!("[message] unparsable header block: {}", e);
                None
            }
        }
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    pub fn subject(&self) -> Option<String> {
        self.header("Subject")
    }
}

pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Editable header list plus body, serialised back with the original line endings.
#[derive(Debug, Clone)]
pub struct MessageView {
    headers: Vec<(String, Vec<u8>)>,
    body: Vec<u8>,
    eol: &'static str,
}

impl MessageView {
    pub fn parse(raw: &[u8]) -> Self {
        let eol = if raw.windows(2).any(|w| w == b"\r\n") {
            "\r\n"
        } else {
            "\n"
        };

        match mailparse::parse_headers(raw) {
            Ok((parsed, offset)) => MessageView {
                headers: parsed
                    .iter()
                    .map(|h| (h.get_key(), h.get_value_raw().to_vec()))
                    .collect(),
                body: raw[offset.min(raw.len())..].to_vec(),
                eol,
            },
            Err(e) => {
                warn!("[message] treating unparsable message as body only: {}", e);
                MessageView {
                    headers: Vec::new(),
                    body: raw.to_vec(),
                    eol,
                }
            }
        }
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| String::from_utf8_lossy(v).trim().to_string())
    }

    /// Replace every occurrence of `name` with a single header, or append it.
    pub fn set_header(&mut self, name: &str, value: &str) {
        let value = value.as_bytes().to_vec();
        match self
            .headers
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some(first) => {
                self.headers[first].1 = value;
                let mut idx = 0;
                self.headers.retain(|(k, _)| {
                    idx += 1;
                    idx - 1 == first || !k.eq_ignore_ascii_case(name)
                });
            }
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Drop every attachment, at any nesting depth, and append a text/plain
    /// part carrying `notice`. Returns how many parts were removed.
    pub fn strip_attachments(&mut self, notice: &str) -> usize {
        let eol = self.eol;
        let full = self.to_bytes();
        let mut kept: Vec<Vec<u8>> = Vec::new();
        let mut removed = 0;

        match mailparse::parse_mail(&full) {
            Ok(parsed) if !parsed.subparts.is_empty() => {
                for part in &parsed.subparts {
                    if let Some(bytes) = prune(part, eol, &mut removed) {
                        kept.push(bytes);
                    }
                }
            }
            Ok(parsed) => {
                if is_attachment(&parsed.headers) {
                    removed += 1;
                } else {
                    let mut part = Vec::new();
                    for name in ["Content-Type", "Content-Transfer-Encoding", "Content-Disposition"] {
                        if let Some(v) = self.header(name) {
                            part.extend_from_slice(format!("{}: {}{}", name, v, eol).as_bytes());
                        }
                    }
                    part.extend_from_slice(eol.as_bytes());
                    part.extend_from_slice(&self.body);
                    kept.push(part);
                }
            }
            Err(e) => {
                warn!("[message] dropping unparsable body of infected message: {}", e);
                removed += 1;
            }
        }

        let boundary = new_boundary();
        let mut body = Vec::new();
        for part in kept {
            body.extend_from_slice(format!("--{}{}", boundary, eol).as_bytes());
            body.extend_from_slice(&part);
            body.extend_from_slice(eol.as_bytes());
        }
        body.extend_from_slice(format!("--{}{}", boundary, eol).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Type: text/plain; charset=utf-8{eol}Content-Transfer-Encoding: 8bit{eol}{eol}{}{eol}",
                notice
            )
            .as_bytes(),
        );
        body.extend_from_slice(format!("--{}--{}", boundary, eol).as_bytes());

        self.remove_header("Content-Transfer-Encoding");
        self.remove_header("Content-Disposition");
        self.set_header("MIME-Version", "1.0");
        self.set_header(
            "Content-Type",
            &format!("multipart/mixed; boundary=\"{}\"", boundary),
        );
        self.body = body;

        debug!("[message] stripped {} attachment(s)", removed);
        removed
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 1024);
        for (key, value) in &self.headers {
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(self.eol.as_bytes());
        }
        out.extend_from_slice(self.eol.as_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

fn new_boundary() -> String {
    format!("=_qbox_{}", uuid::Uuid::new_v4().simple())
}

/// Serialised `part` with attachments removed, or `None` when nothing is left.
fn prune(part: &ParsedMail, eol: &str, removed: &mut usize) -> Option<Vec<u8>> {
    if is_attachment(&part.headers) {
        *removed += 1;
        return None;
    }
    if part.subparts.is_empty() {
        return Some(trim_eol(part.raw_bytes).to_vec());
    }

    let children: Vec<Vec<u8>> = part
        .subparts
        .iter()
        .filter_map(|sub| prune(sub, eol, removed))
        .collect();
    if children.is_empty() {
        return None;
    }

    let boundary = part
        .ctype
        .params
        .get("boundary")
        .cloned()
        .unwrap_or_else(new_boundary);
    let mut out = Vec::new();
    for header in &part.headers {
        out.extend_from_slice(header.get_key_ref().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(header.get_value_raw());
        out.extend_from_slice(eol.as_bytes());
    }
    out.extend_from_slice(eol.as_bytes());
    for child in children {
        out.extend_from_slice(format!("--{}{}", boundary, eol).as_bytes());
        out.extend_from_slice(&child);
        out.extend_from_slice(eol.as_bytes());
    }
    out.extend_from_slice(format!("--{}--", boundary).as_bytes());
    Some(out)
}

fn trim_eol(mut s: &[u8]) -> &[u8] {
    if s.ends_with(b"\n") {
        s = &s[..s.len() - 1];
    }
    if s.ends_with(b"\r") {
        s = &s[..s.len() - 1];
    }
    s
}

fn is_attachment(headers: &[MailHeader]) -> bool {
    if let Some(disposition) = headers.get_first_value("Content-Disposition") {
        let parsed = mailparse::parse_content_disposition(&disposition);
        if matches!(parsed.disposition, DispositionType::Attachment)
            || parsed.params.contains_key("filename")
        {
            return true;
        }
    }
    headers
        .get_first_value("Content-Type")
        .map(|ct| mailparse::parse_content_type(&ct).params.contains_key("name"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAIN: &[u8] = b"From: a@example.org\nTo: b@example.org\nSubject: Hello\n\nHi there\n";

    const WITH_ATTACHMENT: &[u8] = b"From: a@example.org\r\n\
Subject: invoice\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
\r\n\
preamble\r\n\
--XYZ\r\n\
Content-Type: text/plain\r\n\
\r\n\
see attached\r\n\
--XYZ\r\n\
Content-Type: application/octet-stream; name=\"evil.exe\"\r\n\
Content-Disposition: attachment; filename=\"evil.exe\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
TVqQAAMAAAAEAAAA\r\n\
--XYZ--\r\n";

    #[test]
    fn hash_is_deterministic_and_hex() {
        let a = Message::new(PLAIN.to_vec());
        let b = Message::new(PLAIN.to_vec());
        assert_eq!(a.sha1(), b.sha1());
        assert_eq!(a.sha1().len(), 40);
        assert!(a.sha1().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.sha1(), Message::new(b"other".to_vec()).sha1());
    }

    #[test]
    fn hash_survives_modification() {
        let mut m = Message::new(PLAIN.to_vec());
        let before = m.sha1().to_string();
        m.view_mut().set_header("X-Spam-Flag", "YES");
        assert!(m.is_dirty());
        assert_eq!(m.sha1(), before);
        assert_eq!(m.raw(), PLAIN);
    }

    #[test]
    fn clean_message_content_is_raw() {
        let m = Message::new(PLAIN.to_vec());
        assert!(!m.is_dirty());
        assert_eq!(&*m.content(), PLAIN);
        assert_eq!(m.len(), PLAIN.len());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let m = Message::new(PLAIN.to_vec());
        assert_eq!(m.subject().as_deref(), Some("Hello"));
        assert!(m.has_header("to"));
        assert!(!m.has_header("List-ID"));
    }

    #[test]
    fn set_header_replaces_and_serialises_with_lf() {
        let mut view = MessageView::parse(PLAIN);
        view.set_header("Subject", "Changed");
        view.set_header("X-Spam-Level", "***");
        let out = String::from_utf8(view.to_bytes()).unwrap();
        assert!(out.contains("Subject: Changed\n"));
        assert!(!out.contains("Hello"));
        assert!(out.contains("X-Spam-Level: ***\n\nHi there\n"));
        assert!(!out.contains('\r'));
    }

    #[test]
    fn strip_attachments_keeps_text_and_adds_notice() {
        let mut view = MessageView::parse(WITH_ATTACHMENT);
        let removed = view.strip_attachments("Attachment removed: Win.Test.EICAR");
        assert_eq!(removed, 1);

        let out = view.to_bytes();
        let text = String::from_utf8_lossy(&out);
        assert!(!text.contains("evil.exe"));
        assert!(!text.contains("TVqQ"));
        assert!(text.contains("see attached"));
        assert!(text.contains("Attachment removed: Win.Test.EICAR"));
        assert!(text.contains("\r\n"));

        let parsed = mailparse::parse_mail(&out).unwrap();
        assert_eq!(parsed.ctype.mimetype, "multipart/mixed");
        assert_eq!(parsed.subparts.len(), 2);
    }

    #[test]
    fn strip_single_part_attachment_leaves_only_notice() {
        let raw = b"Subject: x\nContent-Type: application/pdf; name=\"a.pdf\"\nContent-Disposition: attachment\n\nJVBERi0=\n";
        let mut view = MessageView::parse(raw);
        assert_eq!(view.strip_attachments("removed"), 1);
        let bytes = view.to_bytes();
        let parsed = mailparse::parse_mail(&bytes).unwrap();
        assert_eq!(parsed.subparts.len(), 1);
        assert_eq!(parsed.subparts[0].get_body().unwrap().trim(), "removed");
    }

    #[test]
    fn strip_attachments_reaches_nested_multiparts() {
        let raw = b"From: a@example.org\n\
Subject: fwd\n\
MIME-Version: 1.0\n\
Content-Type: multipart/mixed; boundary=\"outer\"\n\
\n\
--outer\n\
Content-Type: text/plain\n\
\n\
see forwarded\n\
--outer\n\
Content-Type: multipart/mixed; boundary=\"inner\"\n\
\n\
--inner\n\
Content-Type: text/plain\n\
\n\
inner text\n\
--inner\n\
Content-Type: application/octet-stream; name=\"evil.exe\"\n\
Content-Disposition: attachment; filename=\"evil.exe\"\n\
\n\
MALWAREPAYLOAD\n\
--inner--\n\
--outer--\n";
        let mut view = MessageView::parse(raw);
        assert_eq!(view.strip_attachments("removed"), 1);

        let bytes = view.to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        assert!(!text.contains("MALWAREPAYLOAD"));
        assert!(!text.contains("evil.exe"));
        assert!(text.contains("see forwarded"));
        assert!(text.contains("inner text"));

        let parsed = mailparse::parse_mail(&bytes).unwrap();
        assert_eq!(parsed.subparts.len(), 3);
        assert_eq!(parsed.subparts[1].ctype.mimetype, "multipart/mixed");
        assert_eq!(parsed.subparts[1].subparts.len(), 1);
    }

    #[test]
    fn multipart_left_empty_is_dropped() {
        let raw = b"Content-Type: multipart/mixed; boundary=\"o\"\n\
\n\
--o\n\
Content-Type: multipart/mixed; boundary=\"i\"\n\
\n\
--i\n\
Content-Disposition: attachment; filename=\"a.zip\"\n\
\n\
UEsDBA==\n\
--i--\n\
--o--\n";
        let mut view = MessageView::parse(raw);
        assert_eq!(view.strip_attachments("removed"), 1);
        let bytes = view.to_bytes();
        let parsed = mailparse::parse_mail(&bytes).unwrap();
        assert_eq!(parsed.subparts.len(), 1);
        assert_eq!(parsed.subparts[0].get_body().unwrap().trim(), "removed");
    }
}
