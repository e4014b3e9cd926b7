use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use log::info;

use crate::connection::Broker;
use crate::mail::Mailbox;

/// Owns the mailbox and broker sessions. Refreshes replace them in place, so
/// every caller going through the accessors sees the current connection.
pub struct Sessions<M: Mailbox, B: Broker> {
    mail: M,
    broker: B,
    refresh_count: u64,
    last_refresh: Option<DateTime<Local>>,
}

impl<M: Mailbox, B: Broker> Sessions<M, B> {
    pub fn new(mail: M, broker: B) -> Self {
        Self {
            mail,
            broker,
            refresh_count: 0,
            last_refresh: None,
        }
    }

    /// Open both sessions for the first time.
    pub async fn connect(&mut self) -> Result<()> {
        self.mail.connect().await.context("mailbox connection failed")?;
        self.broker.login().await.context("broker login failed")?;
        self.last_refresh = Some(Local::now());
        Ok(())
    }

    /// Re-establish both sessions.
    pub async fn refresh(&mut self) -> Result<()> {
        self.connect().await?;
        self.refresh_count += 1;
        info!("Sessions refreshed ({} so far)", self.refresh_count);
        Ok(())
    }

    pub fn mail_mut(&mut self) -> &mut M {
        &mut self.mail
    }

    /// Mailbox and broker borrowed together, for routing a message.
    pub fn parts_mut(&mut self) -> (&mut M, &B) {
        (&mut self.mail, &self.broker)
    }

    pub fn refresh_count(&self) -> u64 {
        self.refresh_count
    }

    pub fn last_refresh(&self) -> Option<DateTime<Local>> {
        self.last_refresh
    }
}
