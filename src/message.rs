use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mailparse::{MailHeaderMap, ParsedMail};

/// IMAP UID of a message. Unlike sequence numbers it survives expunges by
/// other clients between fetch and flag.
pub type MessageId = imap::types::Uid;

/// An unread message pulled from the bot's inbox. Lives for one poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub id: MessageId,
    /// Bare sender address, lowercased.
    pub from: String,
    pub date: Option<DateTime<Utc>>,
    pub subject: String,
    pub body: String,
}

impl InboundMessage {
    pub fn new(id: MessageId, from: &str, subject: &str, body: &str) -> Self {
        Self {
            id,
            from: bare_address(from),
            date: None,
            subject: subject.to_string(),
            body: body.to_string(),
        }
    }

    /// Parse a raw RFC 5322 message as fetched from the mailbox.
    pub fn from_raw(id: MessageId, raw: &[u8]) -> Result<Self> {
        let parsed = mailparse::parse_mail(raw).with_context(|| format!("message {} is malformed", id))?;
        let headers = &parsed.headers;

        let from = headers
            .get_first_value("From")
            .map(|v| bare_address(&v))
            .unwrap_or_default();
        let subject = headers.get_first_value("Subject").unwrap_or_default();
        let date = headers
            .get_first_value("Date")
            .and_then(|d| parse_date(&d))
            .or_else(|| {
                // Gateways sometimes omit Date; the relay stamps Received.
                headers
                    .get_first_value("Received")
                    .and_then(|r| r.rsplit(';').next().and_then(parse_date))
            });
        let body = text_body(&parsed).with_context(|| format!("message {} has no readable body", id))?;

        Ok(Self {
            id,
            from,
            date,
            subject,
            body,
        })
    }

    pub fn is_from(&self, address: &str) -> bool {
        !self.from.is_empty() && self.from == bare_address(address)
    }
}

/// Strip display name and angle brackets: `"Me" <5551234567@vtext.com>` -> `5551234567@vtext.com`.
pub fn bare_address(value: &str) -> String {
    let value = value.trim();
    let addr = match (value.rfind('<'), value.rfind('>')) {
        (Some(start), Some(end)) if start < end => &value[start + 1..end],
        _ => value,
    };
    addr.trim().trim_matches('"').to_ascii_lowercase()
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let ts = mailparse::dateparse(value.trim()).ok()?;
    DateTime::from_timestamp(ts, 0)
}

fn text_body(parsed: &ParsedMail) -> Result<String> {
    if parsed.subparts.is_empty() {
        return Ok(parsed.get_body()?);
    }
    match find_plain(parsed) {
        Some(part) => Ok(part.get_body()?),
        None => Ok(parsed.get_body()?),
    }
}

fn find_plain<'a>(part: &'a ParsedMail<'a>) -> Option<&'a ParsedMail<'a>> {
    if part.subparts.is_empty() {
        return (part.ctype.mimetype == "text/plain").then_some(part);
    }
    part.subparts.iter().find_map(find_plain)
}
