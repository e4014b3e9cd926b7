use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Order side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

impl FromStr for OrderSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(OrderSide::Buy),
            "SELL" => Ok(OrderSide::Sell),
            other => bail!("unknown order side '{}'", other),
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order types the broker accepts from this bot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum OrderType {
    Limit { price: f64 },
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit { .. } => "limit",
        }
    }

    pub fn limit_price(&self) -> Option<f64> {
        match self {
            OrderType::Limit { price } => Some(*price),
        }
    }
}

/// Time in force. Orders from texts always rest until cancelled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TimeInForce {
    #[default]
    Gtc, // Good Till Canceled
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "gtc",
        }
    }
}

/// Order as submitted to the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
}

/// Acknowledgement returned by the broker after placement
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub id: String,
    pub state: String,
}

pub struct OrderBuilder;

impl OrderBuilder {
    /// Create a good-till-cancelled limit order
    pub fn limit_order(symbol: &str, side: OrderSide, quantity: f64, limit_price: f64) -> OrderRequest {
        OrderRequest {
            symbol: symbol.to_ascii_uppercase(),
            side,
            quantity,
            order_type: OrderType::Limit { price: limit_price },
            time_in_force: TimeInForce::default(),
        }
    }
}
