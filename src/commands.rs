//! Command grammar for texts sent through the SMS-to-email gateway.
//!
//! A message body is uppercased and split into whitespace tokens, with
//! punctuation trimmed from the ends of each token. Trigger
//! phrases from the configuration match when their tokens appear as a
//! contiguous run of whole tokens, so single-letter triggers only match
//! single-letter words. Every category that matches is collected; dispatch
//! is not mutually exclusive.
//!
//! Order commands use the first line carrying a limit trigger and the
//! non-blank line after it:
//!
//! ```text
//! <TYPE> <SIDE> <INSTRUMENT>
//! <QUANTITY> <SYMBOL> [MAX|MIN] <PCT>
//! ```

use crate::config::CommandTriggers;
use crate::order_types::OrderSide;
use crate::security_types::SecurityType;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    CurrentHoldings,
    CancelOrders,
    LimitOrder { instrument: Option<SecurityType> },
    OpenOrders,
}

impl Command {
    pub fn label(&self) -> &'static str {
        match self {
            Command::CurrentHoldings => "CURRENT HOLDINGS",
            Command::CancelOrders => "CANCEL ALL ORDERS",
            Command::LimitOrder { instrument: Some(SecurityType::Equity) } => "STOCK ORDER",
            Command::LimitOrder { instrument: Some(SecurityType::Option) } => "OPTION ORDER",
            Command::LimitOrder { instrument: Some(SecurityType::Crypto) } => "CRYPTO ORDER",
            Command::LimitOrder { instrument: None } => "LIMIT ORDER",
            Command::OpenOrders => "OPEN ORDERS",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("order command needs a header line and a detail line, found {0}")]
    MissingLine(usize),
    #[error("order command is missing the {0} token")]
    MissingToken(&'static str),
    #[error("invalid {field} '{value}'")]
    InvalidNumber { field: &'static str, value: String },
    #[error("unknown order side '{0}'")]
    InvalidSide(String),
    #[error("quantity must be positive, got {0}")]
    NonPositiveQuantity(f64),
}

/// Whitespace-separated words with surrounding punctuation trimmed, so
/// `"Cancel."` yields `Cancel` while `0.5`, `.5`, `-1` and `BRK.B` stay whole.
fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split_whitespace().map(trim_word).filter(|w| !w.is_empty())
}

fn trim_word(word: &str) -> &str {
    let word = word.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    let start = word
        .char_indices()
        .find(|&(i, c)| {
            c.is_ascii_alphanumeric()
                || (matches!(c, '.' | '-') && word[i + 1..].starts_with(|d: char| d.is_ascii_digit()))
        })
        .map_or(word.len(), |(i, _)| i);
    &word[start..]
}

pub fn tokenize(text: &str) -> Vec<String> {
    words(text).map(|t| t.to_ascii_uppercase()).collect()
}

fn contains_phrase(tokens: &[String], phrase: &[String]) -> bool {
    !phrase.is_empty() && tokens.windows(phrase.len()).any(|window| window == phrase)
}

fn compile(phrases: &[String]) -> Vec<Vec<String>> {
    phrases
        .iter()
        .map(|p| tokenize(p))
        .filter(|tokens| !tokens.is_empty())
        .collect()
}

fn any_phrase(tokens: &[String], phrases: &[Vec<String>]) -> bool {
    phrases.iter().any(|phrase| contains_phrase(tokens, phrase))
}

/// Trigger table compiled from configuration.
#[derive(Debug, Clone)]
pub struct CommandTable {
    current_holdings: Vec<Vec<String>>,
    cancel_orders: Vec<Vec<String>>,
    limit_order: Vec<Vec<String>>,
    open_orders: Vec<Vec<String>>,
    instruments: Vec<(SecurityType, Vec<Vec<String>>)>,
}

impl CommandTable {
    pub fn new(triggers: &CommandTriggers) -> Self {
        Self {
            current_holdings: compile(&triggers.current_holdings),
            cancel_orders: compile(&triggers.cancel_orders),
            limit_order: compile(&triggers.limit_order),
            open_orders: compile(&triggers.open_orders),
            instruments: vec![
                (SecurityType::Equity, compile(&triggers.instruments.equities)),
                (SecurityType::Option, compile(&triggers.instruments.options)),
                (SecurityType::Crypto, compile(&triggers.instruments.crypto)),
            ],
        }
    }

    /// All commands present in `body`, in declared category order.
    pub fn classify(&self, body: &str) -> Vec<Command> {
        let tokens = tokenize(body);
        let mut commands = Vec::new();

        if any_phrase(&tokens, &self.current_holdings) {
            commands.push(Command::CurrentHoldings);
        }
        if any_phrase(&tokens, &self.cancel_orders) {
            commands.push(Command::CancelOrders);
        }
        if let Some(header) = self.limit_header(body) {
            let before = commands.len();
            for (instrument, phrases) in &self.instruments {
                if any_phrase(&header, phrases) {
                    commands.push(Command::LimitOrder { instrument: Some(*instrument) });
                }
            }
            if commands.len() == before {
                commands.push(Command::LimitOrder { instrument: None });
            }
        }
        if any_phrase(&tokens, &self.open_orders) {
            commands.push(Command::OpenOrders);
        }

        commands
    }

    /// The first line carrying a limit-order trigger and the non-blank line after it.
    fn order_lines<'a>(&self, body: &'a str) -> Option<(&'a str, Option<&'a str>)> {
        let mut lines = body.lines().filter(|l| words(l).next().is_some());
        let header = lines.by_ref().find(|l| any_phrase(&tokenize(l), &self.limit_order))?;
        Some((header, lines.next()))
    }

    fn limit_header(&self, body: &str) -> Option<Vec<String>> {
        self.order_lines(body).map(|(header, _)| tokenize(header))
    }

    /// Order parameters from the same header line `classify` matched.
    pub fn order_params(&self, body: &str) -> Result<OrderParams, CommandError> {
        match self.order_lines(body) {
            Some((header, Some(detail))) => OrderParams::from_lines(header, detail),
            Some((_, None)) => Err(CommandError::MissingLine(1)),
            None => Err(CommandError::MissingLine(0)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustDirection {
    /// Price ceiling: market price plus the percentage.
    Max,
    /// Price floor: market price minus the percentage.
    Min,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceAdjustment {
    pub direction: AdjustDirection,
    /// Percent, so 0.5 means half a percent.
    pub pct: Option<f64>,
}

impl PriceAdjustment {
    pub fn max(pct: f64) -> Self {
        Self { direction: AdjustDirection::Max, pct: Some(pct) }
    }

    pub fn min(pct: f64) -> Self {
        Self { direction: AdjustDirection::Min, pct: Some(pct) }
    }

    pub fn none() -> Self {
        Self { direction: AdjustDirection::None, pct: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderParams {
    pub order_type: String,
    pub side: OrderSide,
    pub instrument: String,
    pub quantity: f64,
    pub symbol: String,
    pub adjustment: PriceAdjustment,
}

fn parse_number(field: &'static str, value: &str) -> Result<f64, CommandError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| CommandError::InvalidNumber { field, value: value.to_string() })
}

impl OrderParams {
    /// Parse an order from its header line and detail line.
    pub fn from_lines(header: &str, detail: &str) -> Result<Self, CommandError> {
        let header: Vec<&str> = words(header).collect();
        let order_type = header.first().ok_or(CommandError::MissingToken("type"))?;
        let side = header.get(1).ok_or(CommandError::MissingToken("side"))?;
        let instrument = header.get(2).ok_or(CommandError::MissingToken("instrument"))?;
        let side = side
            .parse::<OrderSide>()
            .map_err(|_| CommandError::InvalidSide(side.to_ascii_uppercase()))?;

        let detail: Vec<&str> = words(detail).collect();
        let quantity = detail.first().ok_or(CommandError::MissingToken("quantity"))?;
        let quantity = parse_number("quantity", quantity)?;
        if quantity <= 0.0 {
            return Err(CommandError::NonPositiveQuantity(quantity));
        }
        let symbol = detail.get(1).ok_or(CommandError::MissingToken("symbol"))?;

        let adjustment = match detail.get(2).map(|t| t.to_ascii_uppercase()) {
            Some(dir) if dir == "MAX" || dir == "MIN" => {
                let pct = detail.get(3).ok_or(CommandError::MissingToken("percentage"))?;
                let pct = parse_number("percentage", pct)?;
                if dir == "MAX" {
                    PriceAdjustment::max(pct)
                } else {
                    PriceAdjustment::min(pct)
                }
            }
            Some(token) => PriceAdjustment {
                direction: AdjustDirection::None,
                pct: token.parse::<f64>().ok(),
            },
            None => PriceAdjustment::none(),
        };

        Ok(Self {
            order_type: order_type.to_ascii_uppercase(),
            side,
            instrument: instrument.to_ascii_uppercase(),
            quantity,
            symbol: symbol.to_string(),
            adjustment,
        })
    }
}

/// Adjust the market price by the requested percentage.
pub fn compute_limit_price(market_price: f64, adjustment: &PriceAdjustment) -> f64 {
    let pct = adjustment.pct.unwrap_or(0.0) / 100.0;
    match adjustment.direction {
        AdjustDirection::Max => market_price * (1.0 + pct),
        AdjustDirection::Min => market_price * (1.0 - pct),
        AdjustDirection::None => market_price,
    }
}

/// Cents at or above $1, hundredths of a cent below.
pub fn round_price(price: f64) -> f64 {
    let scale = if price >= 1.0 { 100.0 } else { 10_000.0 };
    (price * scale).round() / scale
}
