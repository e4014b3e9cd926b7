use anyhow::Result;
use log::{debug, info, warn};
use std::time::Instant;

use crate::commands::{Command, CommandTable};
use crate::config::{BotConfig, CommandTriggers};
use crate::connection::Broker;
use crate::handlers;
use crate::mail::Mailbox;
use crate::message::InboundMessage;
use crate::security_types::SecurityType;

/// What the router did with one message.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// Not from the authorized sender; left untouched.
    Ignored,
    /// From the authorized sender but no trigger matched.
    Unmatched,
    Dispatched(Vec<Command>),
}

/// Sender filter plus trigger table, dispatching matched commands to handlers.
pub struct Router {
    authorized_sender: String,
    bot_address: String,
    table: CommandTable,
    mark_unmatched_read: bool,
}

impl Router {
    pub fn new(authorized_sender: &str, bot_address: &str, triggers: &CommandTriggers) -> Self {
        Self {
            authorized_sender: authorized_sender.to_string(),
            bot_address: bot_address.to_string(),
            table: CommandTable::new(triggers),
            mark_unmatched_read: triggers.mark_unmatched_read,
        }
    }

    pub fn from_config(config: &BotConfig) -> Self {
        Self::new(&config.user_info.phone_address, &config.user_info.email.username, &config.commands)
    }

    pub fn table(&self) -> &CommandTable {
        &self.table
    }

    pub async fn route<M: Mailbox, B: Broker>(
        &self,
        message: &InboundMessage,
        mail: &mut M,
        broker: &B,
    ) -> Result<RouteOutcome> {
        if !message.is_from(&self.authorized_sender) {
            debug!("Ignoring message {} from {:?}", message.id, message.from);
            return Ok(RouteOutcome::Ignored);
        }

        let commands = self.table.classify(&message.body);
        if commands.is_empty() {
            if self.mark_unmatched_read {
                mail.mark_read(message.id).await?;
                warn!("Message {} matched no command, flagged read: {:?}", message.id, message.body.trim());
            } else {
                debug!("Message {} matched no command, left unread", message.id);
            }
            return Ok(RouteOutcome::Unmatched);
        }

        // Flag first so a failing handler cannot cause the command to run again.
        mail.mark_read(message.id).await?;

        for command in &commands {
            let started = Instant::now();
            self.execute(*command, message, mail, broker).await?;
            info!("[{}] Executed command [Runtime: {:.3?}]", command, started.elapsed());
        }
        Ok(RouteOutcome::Dispatched(commands))
    }

    async fn execute<M: Mailbox, B: Broker>(
        &self,
        command: Command,
        message: &InboundMessage,
        mail: &mut M,
        broker: &B,
    ) -> Result<()> {
        match command {
            Command::CurrentHoldings => handlers::current_holdings(broker, mail, &self.bot_address).await?,
            Command::CancelOrders => {
                let cancelled = handlers::cancel_orders(broker).await?;
                info!("Cancelled {} open orders", cancelled);
            }
            Command::LimitOrder { instrument: Some(SecurityType::Equity) } => {
                let params = self.table.order_params(&message.body)?;
                let placed = handlers::equity_limit_order(broker, &params).await?;
                info!("Order {} accepted ({})", placed.id, placed.state);
            }
            Command::LimitOrder { instrument: Some(SecurityType::Option) } => handlers::option_limit_order(&message.body),
            Command::LimitOrder { instrument: Some(SecurityType::Crypto) } => handlers::crypto_limit_order(&message.body),
            Command::LimitOrder { instrument: None } => {
                warn!("Limit order in message {} names no instrument, ignoring", message.id)
            }
            Command::OpenOrders => handlers::open_orders(),
        }
        Ok(())
    }

    /// Route a batch in order. The first handler error ends the batch.
    pub async fn process_unread<M: Mailbox, B: Broker>(
        &self,
        messages: &[InboundMessage],
        mail: &mut M,
        broker: &B,
    ) -> Result<usize> {
        let mut dispatched = 0;
        for message in messages {
            if let RouteOutcome::Dispatched(_) = self.route(message, mail, broker).await? {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }
}
