use anyhow::{Context, Result};
use chrono::Local;
use log::info;

use crate::commands::{OrderParams, compute_limit_price, round_price};
use crate::connection::Broker;
use crate::mail::Mailbox;
use crate::order_types::{OrderBuilder, PlacedOrder};
use crate::report::{HoldingRow, REPORT_SUBJECT, ReportAggregates, render_holdings_html};
use crate::security_types::SecurityType;

/// Build the holdings report and mail it to the bot's own address.
pub async fn current_holdings<B: Broker, M: Mailbox>(broker: &B, mail: &mut M, bot_address: &str) -> Result<()> {
    let account = broker.account_profile().await?;
    let portfolio = broker.portfolio_profile().await?;
    let rows: Vec<HoldingRow> = broker
        .holdings()
        .await?
        .into_iter()
        .map(|h| HoldingRow::new(h, portfolio.equity))
        .collect();

    let aggregates = ReportAggregates::compute(&account, &portfolio, &rows)?;
    let html = render_holdings_html(&aggregates, &rows, Local::now().naive_local());
    mail.send_html(bot_address, REPORT_SUBJECT, html).await?;

    info!(
        "Holdings report sent: {} positions, portfolio value {:.2}",
        rows.len(),
        aggregates.total_portfolio_value
    );
    Ok(())
}

/// Cancel open orders of every class in turn. The first failing class stops the rest.
pub async fn cancel_orders<B: Broker>(broker: &B) -> Result<usize> {
    let mut total = 0;
    for class in SecurityType::ALL {
        total += broker
            .cancel_all_orders(class)
            .await
            .with_context(|| format!("cancelling {} orders", class))?;
    }
    Ok(total)
}

pub async fn equity_limit_order<B: Broker>(broker: &B, params: &OrderParams) -> Result<PlacedOrder> {
    let quote = broker.quote(&params.symbol).await?;
    let market_price = quote.market_price();
    let limit_price = round_price(compute_limit_price(market_price, &params.adjustment));

    info!(
        "{} {} {} x{} market {:.4} limit {} ({:?})",
        params.order_type,
        params.side,
        params.symbol.to_ascii_uppercase(),
        params.quantity,
        market_price,
        limit_price,
        params.adjustment.direction
    );

    let order = OrderBuilder::limit_order(&params.symbol, params.side, params.quantity, limit_price);
    broker.place_order(&order).await
}

pub fn option_limit_order(body: &str) {
    info!("Option orders are not supported yet, ignoring: {:?}", first_line(body));
}

pub fn crypto_limit_order(body: &str) {
    info!("Crypto orders are not supported yet, ignoring: {:?}", first_line(body));
}

pub fn open_orders() {
    info!("Open order listing is not supported yet");
}

fn first_line(body: &str) -> &str {
    body.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("")
}
