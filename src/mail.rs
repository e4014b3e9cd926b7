use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use lettre::message::Mailbox as MailAddress;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{debug, info, warn};
use mockall::automock;
use native_tls::{TlsConnector, TlsStream};
use std::net::TcpStream;

use crate::config::EmailConfig;
use crate::message::{InboundMessage, MessageId};

type ImapSession = imap::Session<TlsStream<TcpStream>>;

/// Inbox access plus outgoing mail.
#[automock]
#[async_trait]
pub trait Mailbox: Send {
    /// Establish or replace both the mailbox and the outgoing-mail sessions.
    async fn connect(&mut self) -> Result<()>;
    /// Unread messages, oldest first. Fetching does not set the read flag.
    async fn fetch_unread(&mut self) -> Result<Vec<InboundMessage>>;
    /// `id` is the message's UID.
    async fn mark_read(&mut self, id: MessageId) -> Result<()>;
    async fn send_html(&mut self, to: &str, subject: &str, html: String) -> Result<()>;
}

/// IMAP + SMTP client for the bot's mailbox.
pub struct MailClient {
    config: EmailConfig,
    imap: Option<ImapSession>,
    smtp: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl MailClient {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            imap: None,
            smtp: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.config.username
    }

    fn open_imap(config: &EmailConfig) -> Result<ImapSession> {
        let host = config.imap_host.as_str();
        let tls = TlsConnector::builder().build()?;
        let client = imap::connect((host, config.imap_port), host, &tls)
            .with_context(|| format!("failed to reach {}:{}", host, config.imap_port))?;
        client
            .login(&config.username, &config.password)
            .map_err(|(e, _)| e)
            .context("IMAP login failed")
    }

    // `&self` must not be held across an await: the IMAP session is not Sync.
    async fn open_smtp(config: &EmailConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let credentials = Credentials::new(config.username.clone(), config.password.clone());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)?
            .port(config.smtp_port)
            .credentials(credentials)
            .build();
        if !transport.test_connection().await.context("SMTP handshake failed")? {
            bail!("SMTP server {} refused the connection", config.smtp_host);
        }
        Ok(transport)
    }
}

/// Comma-separated UID set for a single fetch command.
fn uid_set(uids: &[MessageId]) -> String {
    uids.iter().map(|u| u.to_string()).collect::<Vec<_>>().join(",")
}

/// Build a message from one fetch response, keyed by its UID.
fn parse_fetched(uid: Option<MessageId>, raw: Option<&[u8]>) -> Option<InboundMessage> {
    let Some(uid) = uid else {
        warn!("Fetch response without a UID, skipping");
        return None;
    };
    let Some(raw) = raw else {
        warn!("Message {} has no body, skipping", uid);
        return None;
    };
    match InboundMessage::from_raw(uid, raw) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!("Skipping unreadable message {}: {:#}", uid, e);
            None
        }
    }
}

#[async_trait]
impl Mailbox for MailClient {
    async fn connect(&mut self) -> Result<()> {
        if let Some(mut stale) = self.imap.take() {
            if let Err(e) = tokio::task::block_in_place(|| stale.logout()) {
                debug!("Ignoring IMAP logout error: {}", e);
            }
        }

        let session = tokio::task::block_in_place(|| Self::open_imap(&self.config))?;
        self.imap = Some(session);
        self.smtp = Some(Self::open_smtp(&self.config).await?);

        info!("Connected to mailbox {} ({} / {})", self.config.username, self.config.imap_host, self.config.smtp_host);
        Ok(())
    }

    async fn fetch_unread(&mut self) -> Result<Vec<InboundMessage>> {
        let inbox = self.config.inbox.as_str();
        let session = self.imap.as_mut().ok_or_else(|| anyhow!("mailbox not connected"))?;

        tokio::task::block_in_place(|| -> Result<Vec<InboundMessage>> {
            session.select(inbox)?;
            let mut uids: Vec<MessageId> = session.uid_search("UNSEEN")?.into_iter().collect();
            if uids.is_empty() {
                return Ok(Vec::new());
            }
            uids.sort_unstable();

            let fetches = session.uid_fetch(uid_set(&uids), "(UID BODY.PEEK[])")?;
            let mut messages: Vec<InboundMessage> = fetches
                .iter()
                .filter_map(|fetch| parse_fetched(fetch.uid, fetch.body()))
                .collect();
            messages.sort_by_key(|m| m.id);
            Ok(messages)
        })
    }

    async fn mark_read(&mut self, id: MessageId) -> Result<()> {
        let session = self.imap.as_mut().ok_or_else(|| anyhow!("mailbox not connected"))?;
        tokio::task::block_in_place(|| session.uid_store(id.to_string(), "+FLAGS (\\Seen)"))
            .with_context(|| format!("failed to flag message {} as read", id))?;
        debug!("Message {} flagged as read", id);
        Ok(())
    }

    async fn send_html(&mut self, to: &str, subject: &str, html: String) -> Result<()> {
        let smtp = self.smtp.as_ref().ok_or_else(|| anyhow!("outgoing mail not connected"))?;
        let message = Message::builder()
            .from(self.config.username.parse::<MailAddress>()?)
            .to(to.parse::<MailAddress>()?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html)?;
        smtp.send(message).await.with_context(|| format!("failed to send '{}' to {}", subject, to))?;
        info!("Sent '{}' to {}", subject, to);
        Ok(())
    }
}
