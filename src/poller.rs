use log::{error, info, warn};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::PollConfig;
use crate::connection::Broker;
use crate::mail::Mailbox;
use crate::message::InboundMessage;
use crate::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::routes::Router;
use crate::session::Sessions;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("mailbox still unreachable after {attempts} reconnect attempt(s)")]
    ReconnectExhausted {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
}

/// Poll loop: fetch unread mail on a short interval, route it, and keep both
/// sessions fresh.
pub struct Poller<M: Mailbox, B: Broker> {
    router: Router,
    sessions: Sessions<M, B>,
    poll_interval: Duration,
    refresh_period: Duration,
    reconnect: ReconnectPolicy,
    cycles: u64,
}

impl<M: Mailbox, B: Broker> Poller<M, B> {
    pub fn new(config: &PollConfig, router: Router, sessions: Sessions<M, B>) -> Self {
        Self {
            router,
            sessions,
            poll_interval: config.poll_interval(),
            refresh_period: config.refresh_period(),
            reconnect: ReconnectPolicy::new(ReconnectConfig::from_settings(&config.reconnect)),
            cycles: 0,
        }
    }

    /// Run until `shutdown` resolves or reconnecting gives up.
    pub async fn run<F: Future>(&mut self, shutdown: F) -> Result<(), PollError> {
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh = tokio::time::interval_at(Instant::now() + self.refresh_period, self.refresh_period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            "Polling every {:?}, refreshing sessions every {:?}",
            self.poll_interval, self.refresh_period
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested after {} poll cycles", self.cycles);
                    return Ok(());
                }
                _ = refresh.tick() => {
                    // A failed refresh surfaces on the next fetch, which reconnects.
                    if let Err(e) = self.sessions.refresh().await {
                        warn!("Scheduled session refresh failed: {:#}", e);
                    }
                }
                _ = poll.tick() => {
                    self.poll_once().await?;
                }
            }
        }
    }

    /// One fetch-and-route cycle. Returns how many messages were dispatched.
    pub async fn poll_once(&mut self) -> Result<usize, PollError> {
        let messages = self.fetch_with_reconnect().await?;
        self.cycles += 1;

        let (mail, broker) = self.sessions.parts_mut();
        match self.router.process_unread(&messages, mail, broker).await {
            Ok(dispatched) => Ok(dispatched),
            Err(e) => {
                error!("Command failed: {:#}", e);
                Ok(0)
            }
        }
    }

    async fn fetch_with_reconnect(&mut self) -> Result<Vec<InboundMessage>, PollError> {
        let mut last_error = match self.sessions.mail_mut().fetch_unread().await {
            Ok(messages) => return Ok(messages),
            Err(e) => e,
        };

        while let Some(delay) = self.reconnect.next_delay() {
            warn!(
                "Mail fetch failed: {:#}. Reconnecting in {:?} (attempt {}/{})",
                last_error,
                delay,
                self.reconnect.attempt_count(),
                self.reconnect.max_attempts()
            );
            tokio::time::sleep(delay).await;

            if let Err(e) = self.sessions.refresh().await {
                last_error = e;
                continue;
            }
            match self.sessions.mail_mut().fetch_unread().await {
                Ok(messages) => {
                    info!("Mailbox recovered after {} reconnect attempt(s)", self.reconnect.attempt_count());
                    // Each outage gets the full attempt budget again.
                    self.reconnect.reset();
                    return Ok(messages);
                }
                Err(e) => last_error = e,
            }
        }

        Err(PollError::ReconnectExhausted {
            attempts: self.reconnect.attempt_count(),
            source: last_error,
        })
    }

    pub fn sessions(&self) -> &Sessions<M, B> {
        &self.sessions
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandTriggers;
    use crate::connection::MockBroker;
    use crate::mail::MockMailbox;
    use anyhow::anyhow;

    fn router() -> Router {
        Router::new("5551234567@vtext.com", "bot@gmail.com", &CommandTriggers::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_once_counts_cycles() {
        let mut mail = MockMailbox::new();
        mail.expect_fetch_unread().returning(|| Ok(Vec::new()));
        let mut poller = Poller::new(&PollConfig::default(), router(), Sessions::new(mail, MockBroker::new()));

        assert_eq!(poller.poll_once().await.unwrap(), 0);
        assert_eq!(poller.poll_once().await.unwrap(), 0);
        assert_eq!(poller.cycles(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_fail_immediately() {
        let mut config = PollConfig::default();
        config.reconnect.max_attempts = 0;
        let mut mail = MockMailbox::new();
        mail.expect_fetch_unread().times(1).returning(|| Err(anyhow!("connection reset")));
        mail.expect_connect().never();

        let mut poller = Poller::new(&config, router(), Sessions::new(mail, MockBroker::new()));
        match poller.poll_once().await {
            Err(PollError::ReconnectExhausted { attempts, .. }) => assert_eq!(attempts, 0),
            other => panic!("unexpected {:?}", other),
        }
    }
}
