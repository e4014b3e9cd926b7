use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use log::{debug, info, warn};
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use std::collections::HashMap;

use crate::config::BrokerConfig;
use crate::order_types::{OrderRequest, PlacedOrder};
use crate::security_types::SecurityType;

/// Shares per option contract.
pub const OPTION_MULTIPLIER: f64 = 100.0;

/// Public client id of the broker's own web app; required by the token endpoint.
const CLIENT_ID: &str = "c82SH0WZOsabOXGP2sxqcj34FxkvfnWRZBKlBjFS";

#[derive(Debug, Clone, PartialEq)]
pub struct AccountProfile {
    pub account_url: String,
    pub account_number: String,
    pub buying_power: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioProfile {
    pub equity: f64,
    pub previous_close_equity: f64,
}

/// One open position as reported by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Holding {
    pub symbol: String,
    pub instrument: SecurityType,
    pub price: f64,
    pub quantity: f64,
    /// Average cost per unit.
    pub cost: f64,
    /// Percent change against the previous close.
    pub pct_change: f64,
    /// Units controlled per unit held: 100 for option contracts, 1 otherwise.
    pub multiplier: f64,
    /// Contract description such as `450 lC`, for options.
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub symbol: String,
    pub last_trade_price: f64,
    pub last_extended_hours_trade_price: Option<f64>,
    pub previous_close: f64,
    pub updated_at: String,
}

impl Quote {
    /// Latest traded price, extended-hours trades included.
    pub fn market_price(&self) -> f64 {
        self.last_extended_hours_trade_price.unwrap_or(self.last_trade_price)
    }
}

/// Operations the bot needs from the brokerage.
#[automock]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Establish or replace the session.
    async fn login(&mut self) -> Result<()>;
    async fn account_profile(&self) -> Result<AccountProfile>;
    async fn portfolio_profile(&self) -> Result<PortfolioProfile>;
    async fn holdings(&self) -> Result<Vec<Holding>>;
    async fn quote(&self, symbol: &str) -> Result<Quote>;
    async fn place_order(&self, order: &OrderRequest) -> Result<PlacedOrder>;
    /// Cancel every open order of one class; returns how many were cancelled.
    async fn cancel_all_orders(&self, class: SecurityType) -> Result<usize>;
    async fn cancel_order(&self, class: SecurityType, order_id: &str) -> Result<()>;
}

fn de_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let raw = String::deserialize(deserializer)?;
    raw.trim().parse().map_err(serde::de::Error::custom)
}

fn de_opt_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse().map(Some).map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    results: Vec<T>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    mfa_required: bool,
    detail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountRecord {
    url: String,
    account_number: String,
    #[serde(deserialize_with = "de_f64")]
    buying_power: f64,
}

#[derive(Debug, Deserialize)]
struct PortfolioRecord {
    #[serde(deserialize_with = "de_f64")]
    equity: f64,
    #[serde(deserialize_with = "de_f64")]
    adjusted_portfolio_equity_previous_close: f64,
}

#[derive(Debug, Deserialize)]
struct PositionRecord {
    instrument: String,
    #[serde(deserialize_with = "de_f64")]
    quantity: f64,
    #[serde(deserialize_with = "de_f64")]
    average_buy_price: f64,
}

#[derive(Debug, Deserialize)]
struct InstrumentRecord {
    url: String,
    symbol: String,
}

#[derive(Debug, Deserialize)]
struct QuoteRecord {
    symbol: String,
    #[serde(deserialize_with = "de_f64")]
    last_trade_price: f64,
    #[serde(default, deserialize_with = "de_opt_f64")]
    last_extended_hours_trade_price: Option<f64>,
    #[serde(deserialize_with = "de_f64")]
    previous_close: f64,
    #[serde(default)]
    updated_at: String,
}

#[derive(Debug, Deserialize)]
struct OptionPositionRecord {
    chain_symbol: String,
    /// Option instrument URL.
    option: String,
    /// `long` or `short`.
    #[serde(rename = "type")]
    side: String,
    #[serde(deserialize_with = "de_f64")]
    quantity: f64,
    /// Per contract, so 100x the per-share cost.
    #[serde(deserialize_with = "de_f64")]
    average_price: f64,
}

#[derive(Debug, Deserialize)]
struct OptionInstrumentRecord {
    id: String,
    /// `call` or `put`.
    #[serde(rename = "type")]
    kind: String,
    #[serde(deserialize_with = "de_f64")]
    strike_price: f64,
}

#[derive(Debug, Deserialize)]
struct OptionQuoteRecord {
    #[serde(deserialize_with = "de_f64")]
    adjusted_mark_price: f64,
    #[serde(deserialize_with = "de_f64")]
    previous_close_price: f64,
}

#[derive(Debug, Deserialize)]
struct CurrencyCode {
    code: String,
}

#[derive(Debug, Deserialize)]
struct CostBasis {
    #[serde(deserialize_with = "de_f64")]
    direct_cost_basis: f64,
}

#[derive(Debug, Deserialize)]
struct CryptoHoldingRecord {
    currency: CurrencyCode,
    #[serde(deserialize_with = "de_f64")]
    quantity: f64,
    #[serde(default)]
    cost_bases: Vec<CostBasis>,
}

#[derive(Debug, Deserialize)]
struct CurrencyPairRecord {
    id: String,
    asset_currency: CurrencyCode,
}

#[derive(Debug, Deserialize)]
struct CryptoQuoteRecord {
    #[serde(deserialize_with = "de_f64")]
    mark_price: f64,
    #[serde(deserialize_with = "de_f64")]
    open_price: f64,
}

#[derive(Debug, Deserialize)]
struct OrderRecord {
    id: String,
    #[serde(default)]
    state: String,
    /// Equity orders expose `cancel`, options and crypto `cancel_url`.
    #[serde(default, alias = "cancel_url")]
    cancel: Option<String>,
}

fn first_char(text: &str) -> String {
    text.chars().next().map(String::from).unwrap_or_default()
}

fn to_option_holding(
    position: &OptionPositionRecord,
    instrument: &OptionInstrumentRecord,
    quote: &OptionQuoteRecord,
) -> Option<Holding> {
    if position.quantity <= 0.0 {
        return None;
    }
    let price = quote.adjusted_mark_price;
    let pct_change = if quote.previous_close_price > 0.0 {
        (price / quote.previous_close_price - 1.0) * 100.0
    } else {
        0.0
    };
    Some(Holding {
        symbol: position.chain_symbol.clone(),
        instrument: SecurityType::Option,
        price,
        quantity: position.quantity,
        cost: position.average_price / OPTION_MULTIPLIER,
        pct_change,
        multiplier: OPTION_MULTIPLIER,
        description: Some(format!(
            "{} {}{}",
            instrument.strike_price.trunc() as i64,
            first_char(&position.side),
            first_char(&instrument.kind).to_ascii_uppercase()
        )),
    })
}

fn to_crypto_holding(record: &CryptoHoldingRecord, quote: &CryptoQuoteRecord) -> Option<Holding> {
    if record.quantity <= 0.0 {
        return None;
    }
    let basis: f64 = record.cost_bases.iter().map(|c| c.direct_cost_basis).sum();
    Some(Holding {
        symbol: record.currency.code.clone(),
        instrument: SecurityType::Crypto,
        price: quote.mark_price,
        quantity: record.quantity,
        cost: basis / record.quantity,
        pct_change: (quote.mark_price / quote.open_price - 1.0) * 100.0,
        multiplier: 1.0,
        description: None,
    })
}

/// HTTP client for the Robinhood brokerage API.
pub struct RobinhoodClient {
    http: reqwest::Client,
    config: BrokerConfig,
    token: Option<String>,
}

impl RobinhoodClient {
    pub fn new(config: BrokerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("robin-texts/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            config,
            token: None,
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    fn crypto_api(&self, path: &str) -> String {
        format!("{}/{}", self.config.crypto_base.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    fn token(&self) -> Result<&str> {
        self.token.as_deref().ok_or_else(|| anyhow!("broker session not logged in"))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .http
            .get(url)
            .bearer_auth(self.token()?)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?
            .error_for_status()?;
        Ok(response.json::<T>().await?)
    }

    async fn post_json<T: DeserializeOwned>(&self, url: &str, body: &serde_json::Value) -> Result<T> {
        let response = self
            .http
            .post(url)
            .bearer_auth(self.token()?)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?
            .error_for_status()?;
        Ok(response.json::<T>().await?)
    }

    async fn post_empty(&self, url: &str) -> Result<()> {
        self.http
            .post(url)
            .bearer_auth(self.token()?)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?
            .error_for_status()?;
        Ok(())
    }

    /// Follow `next` links until the listing is exhausted.
    async fn get_all<T: DeserializeOwned>(&self, url: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(url.to_string());
        while let Some(url) = next {
            let page: Page<T> = self.get_json(&url).await?;
            items.extend(page.results);
            next = page.next;
        }
        Ok(items)
    }

    async fn first<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let page: Page<T> = self.get_json(url).await?;
        page.results
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("empty result set from {}", url))
    }

    async fn instrument_for_symbol(&self, symbol: &str) -> Result<InstrumentRecord> {
        let url = self.api(&format!("instruments/?symbol={}", symbol.to_ascii_uppercase()));
        self.first(&url)
            .await
            .with_context(|| format!("unknown instrument {}", symbol))
    }

    async fn equity_holdings(&self) -> Result<Vec<Holding>> {
        let positions: Vec<PositionRecord> = self.get_all(&self.api("positions/?nonzero=true")).await?;
        let mut holdings = Vec::with_capacity(positions.len());
        for position in positions {
            let instrument: InstrumentRecord = self.get_json(&position.instrument).await?;
            let quote = self.quote(&instrument.symbol).await?;
            holdings.push(Holding {
                symbol: instrument.symbol,
                instrument: SecurityType::Equity,
                price: quote.last_trade_price,
                quantity: position.quantity,
                cost: position.average_buy_price,
                pct_change: (quote.last_trade_price / quote.previous_close - 1.0) * 100.0,
                multiplier: 1.0,
                description: None,
            });
        }
        Ok(holdings)
    }

    async fn option_holdings(&self) -> Result<Vec<Holding>> {
        let positions: Vec<OptionPositionRecord> = self.get_all(&self.api("options/positions/?nonzero=true")).await?;
        let mut holdings = Vec::with_capacity(positions.len());
        for position in &positions {
            let instrument: OptionInstrumentRecord = self.get_json(&position.option).await?;
            let quote: OptionQuoteRecord = self
                .get_json(&self.api(&format!("marketdata/options/{}/", instrument.id)))
                .await?;
            holdings.extend(to_option_holding(position, &instrument, &quote));
        }
        Ok(holdings)
    }

    async fn crypto_holdings(&self) -> Result<Vec<Holding>> {
        let records: Vec<CryptoHoldingRecord> = self.get_all(&self.crypto_api("holdings/")).await?;
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let pairs: Vec<CurrencyPairRecord> = self.get_all(&self.crypto_api("currency_pairs/")).await?;
        let pair_ids: HashMap<String, String> = pairs
            .into_iter()
            .map(|p| (p.asset_currency.code, p.id))
            .collect();

        let mut holdings = Vec::new();
        for record in &records {
            let Some(pair_id) = pair_ids.get(&record.currency.code) else {
                warn!("No currency pair for {}, skipping", record.currency.code);
                continue;
            };
            let quote: CryptoQuoteRecord = self
                .get_json(&self.api(&format!("marketdata/forex/quotes/{}/", pair_id)))
                .await?;
            holdings.extend(to_crypto_holding(record, &quote));
        }
        Ok(holdings)
    }

    fn orders_url(&self, class: SecurityType) -> String {
        match class {
            SecurityType::Equity => self.api("orders/"),
            SecurityType::Option => self.api("options/orders/"),
            SecurityType::Crypto => self.crypto_api("orders/"),
        }
    }
}

#[async_trait]
impl Broker for RobinhoodClient {
    async fn login(&mut self) -> Result<()> {
        let mut body = json!({
            "client_id": CLIENT_ID,
            "expires_in": 86400,
            "grant_type": "password",
            "scope": "internal",
            "username": self.config.username,
            "password": self.config.password,
        });
        if let Some(device_token) = &self.config.device_token {
            body["device_token"] = json!(device_token);
        }
        if let Some(mfa_code) = &self.config.mfa_code {
            body["mfa_code"] = json!(mfa_code);
        }

        let response: TokenResponse = self
            .http
            .post(self.api("oauth2/token/"))
            .json(&body)
            .send()
            .await
            .context("broker login request failed")?
            .json()
            .await
            .context("broker login returned an unreadable response")?;

        if response.mfa_required {
            bail!("broker login requires an MFA code");
        }
        let token = response.access_token.ok_or_else(|| {
            anyhow!(
                "broker login rejected: {}",
                response.detail.unwrap_or_else(|| "no access token".to_string())
            )
        })?;
        self.token = Some(token);
        info!("Logged in to broker as {}", self.config.username);
        Ok(())
    }

    async fn account_profile(&self) -> Result<AccountProfile> {
        let record: AccountRecord = self.first(&self.api("accounts/")).await?;
        Ok(AccountProfile {
            account_url: record.url,
            account_number: record.account_number,
            buying_power: record.buying_power,
        })
    }

    async fn portfolio_profile(&self) -> Result<PortfolioProfile> {
        let record: PortfolioRecord = self.first(&self.api("portfolios/")).await?;
        Ok(PortfolioProfile {
            equity: record.equity,
            previous_close_equity: record.adjusted_portfolio_equity_previous_close,
        })
    }

    async fn holdings(&self) -> Result<Vec<Holding>> {
        let mut holdings = Vec::new();
        // Each class stands alone; one failing does not hide the others.
        match self.equity_holdings().await {
            Ok(equities) => holdings.extend(equities),
            Err(e) => warn!("Failed to load equity holdings: {:#}", e),
        }
        match self.option_holdings().await {
            Ok(options) => holdings.extend(options),
            Err(e) => warn!("Failed to load option holdings: {:#}", e),
        }
        match self.crypto_holdings().await {
            Ok(crypto) => holdings.extend(crypto),
            Err(e) => warn!("Failed to load crypto holdings: {:#}", e),
        }
        holdings.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        debug!("Loaded {} holdings", holdings.len());
        Ok(holdings)
    }

    async fn quote(&self, symbol: &str) -> Result<Quote> {
        let url = self.api(&format!("quotes/{}/", symbol.to_ascii_uppercase()));
        let record: QuoteRecord = self.get_json(&url).await?;
        Ok(Quote {
            symbol: record.symbol,
            last_trade_price: record.last_trade_price,
            last_extended_hours_trade_price: record.last_extended_hours_trade_price,
            previous_close: record.previous_close,
            updated_at: record.updated_at,
        })
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<PlacedOrder> {
        let account = self.account_profile().await?;
        let instrument = self.instrument_for_symbol(&order.symbol).await?;

        let mut body = json!({
            "account": account.account_url,
            "instrument": instrument.url,
            "symbol": instrument.symbol,
            "quantity": order.quantity,
            "side": order.side.as_str(),
            "type": order.order_type.as_str(),
            "time_in_force": order.time_in_force.as_str(),
            "trigger": "immediate",
            "ref_id": uuid::Uuid::new_v4().to_string(),
            "extended_hours": false,
        });
        if let Some(price) = order.order_type.limit_price() {
            body["price"] = json!(price);
        }

        let record: OrderRecord = self.post_json(&self.api("orders/"), &body).await?;
        info!(
            "Placed {} {} order #{} for {} shares of {}",
            order.order_type.as_str(),
            order.side,
            record.id,
            order.quantity,
            order.symbol
        );
        Ok(PlacedOrder {
            id: record.id,
            state: record.state,
        })
    }

    async fn cancel_all_orders(&self, class: SecurityType) -> Result<usize> {
        let orders: Vec<OrderRecord> = self.get_all(&self.orders_url(class)).await?;
        let mut cancelled = 0;
        // Only open orders still carry a cancel link.
        for order in orders.iter().filter(|o| o.cancel.is_some()) {
            self.cancel_order(class, &order.id).await?;
            cancelled += 1;
        }
        info!("All {} orders cancelled ({})", class, cancelled);
        Ok(cancelled)
    }

    async fn cancel_order(&self, class: SecurityType, order_id: &str) -> Result<()> {
        let url = format!("{}{}/cancel/", self.orders_url(class), order_id);
        self.post_empty(&url).await?;
        debug!("Cancelled {} order {}", class, order_id);
        Ok(())
    }
}
