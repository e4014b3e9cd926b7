//! Holdings report: per-position rows, account aggregates and the HTML email body.

use anyhow::{Result, bail};
use chrono::NaiveDateTime;

use crate::connection::{AccountProfile, Holding, PortfolioProfile};

pub const REPORT_SUBJECT: &str = "[Current]";

/// A holding plus its derived position columns.
#[derive(Debug, Clone, PartialEq)]
pub struct HoldingRow {
    pub holding: Holding,
    pub position_value: f64,
    /// Share of total account equity, percent.
    pub position_pct: f64,
    pub return_dollars: f64,
    pub return_pct: f64,
}

impl HoldingRow {
    pub fn new(holding: Holding, account_equity: f64) -> Self {
        let units = holding.quantity * holding.multiplier;
        let position_value = holding.price * units;
        let return_dollars = (holding.price - holding.cost) * units;
        Self {
            position_pct: ratio_pct(position_value, account_equity),
            return_pct: ratio_pct(holding.price, holding.cost) - 100.0,
            position_value,
            return_dollars,
            holding,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportAggregates {
    pub daily_change: f64,
    pub total_position_value: f64,
    pub total_buying_power: f64,
    pub total_portfolio_value: f64,
    pub total_position_cost: f64,
    pub position_pct: f64,
    pub cash_pct: f64,
    pub return_dollars: f64,
    pub return_pct: f64,
}

fn ratio_pct(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 { 0.0 } else { numerator / denominator * 100.0 }
}

impl ReportAggregates {
    pub fn compute(account: &AccountProfile, portfolio: &PortfolioProfile, rows: &[HoldingRow]) -> Result<Self> {
        if rows.is_empty() {
            bail!("no open positions to report");
        }

        let positions: f64 = rows.iter().map(|r| r.position_value).sum();
        let return_dollars: f64 = rows.iter().map(|r| r.return_dollars).sum();
        let buying_power = account.buying_power;
        let portfolio_value = positions + buying_power;
        let position_cost = positions - return_dollars;

        Ok(Self {
            daily_change: ratio_pct(portfolio_value, portfolio.previous_close_equity) - 100.0,
            total_position_value: positions,
            total_buying_power: buying_power,
            total_portfolio_value: portfolio_value,
            total_position_cost: position_cost,
            position_pct: ratio_pct(positions, portfolio_value),
            cash_pct: ratio_pct(buying_power, portfolio_value),
            return_dollars,
            return_pct: ratio_pct(return_dollars, position_cost),
        })
    }

    /// Labelled, display-formatted figures in report order.
    pub fn formatted(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Daily change %", format_thousands(self.daily_change)),
            ("Portfolio value", format_thousands(self.total_portfolio_value)),
            ("Position value", format_thousands(self.total_position_value)),
            ("Position cost", format_thousands(self.total_position_cost)),
            ("Buying power", format_thousands(self.total_buying_power)),
            ("Positions %", format_thousands(self.position_pct)),
            ("Cash %", format_thousands(self.cash_pct)),
            ("Return $", format_thousands(self.return_dollars)),
            ("Return %", format_thousands(self.return_pct)),
        ]
    }
}

/// Two decimals with comma thousands separators: `1234567.891` -> `1,234,567.89`.
pub fn format_thousands(value: f64) -> String {
    let fixed = format!("{:.2}", value.abs());
    let (int_part, frac_part) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, digit) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    let negative = value < 0.0 && fixed.bytes().any(|b| (b'1'..=b'9').contains(&b));
    format!("{}{}.{}", if negative { "-" } else { "" }, grouped, frac_part)
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

pub fn render_holdings_html(aggregates: &ReportAggregates, rows: &[HoldingRow], generated_at: NaiveDateTime) -> String {
    let mut html = String::new();
    html.push_str("<html><body style=\"font-family: sans-serif\">\n");
    html.push_str(&format!(
        "<h3>Current holdings ({})</h3>\n",
        generated_at.format("%Y-%m-%d %H:%M")
    ));

    html.push_str("<table>\n");
    for (label, value) in aggregates.formatted() {
        html.push_str(&format!("<tr><td>{}</td><td align=\"right\">{}</td></tr>\n", label, value));
    }
    html.push_str("</table>\n<br>\n");

    html.push_str("<table border=\"1\" cellpadding=\"3\" style=\"border-collapse: collapse\">\n");
    html.push_str(
        "<tr><th>Symbol</th><th>Inst</th><th>Price</th><th>Qty</th><th>Chg %</th>\
         <th>Cost</th><th>Pos $</th><th>Pos %</th><th>R $</th><th>R %</th></tr>\n",
    );
    for row in rows {
        let h = &row.holding;
        html.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            escape(&h.symbol),
            escape(h.description.as_deref().unwrap_or(h.instrument.label())),
            format_thousands(h.price),
            format_thousands(h.quantity),
            format_thousands(h.pct_change),
            format_thousands(h.cost),
            format_thousands(row.position_value),
            format_thousands(row.position_pct),
            format_thousands(row.return_dollars),
            format_thousands(row.return_pct),
        ));
    }
    html.push_str("</table>\n</body></html>\n");
    html
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security_types::SecurityType;
    use chrono::NaiveDate;

    fn holding(symbol: &str, price: f64, quantity: f64, cost: f64) -> Holding {
        Holding {
            symbol: symbol.to_string(),
            instrument: SecurityType::Equity,
            price,
            quantity,
            cost,
            pct_change: 1.0,
            multiplier: 1.0,
            description: None,
        }
    }

    fn account(buying_power: f64) -> AccountProfile {
        AccountProfile {
            account_url: "https://api.example.com/accounts/1/".to_string(),
            account_number: "1".to_string(),
            buying_power,
        }
    }

    #[test]
    fn test_format_thousands() {
        assert_eq!(format_thousands(1_234_567.891), "1,234,567.89");
        assert_eq!(format_thousands(999.999), "1,000.00");
        assert_eq!(format_thousands(12.3), "12.30");
        assert_eq!(format_thousands(-4_321.5), "-4,321.50");
        assert_eq!(format_thousands(-0.001), "0.00");
        assert_eq!(format_thousands(0.0), "0.00");
    }

    #[test]
    fn test_row_derivations() {
        let row = HoldingRow::new(holding("AAPL", 110.0, 10.0, 100.0), 5_000.0);
        assert_eq!(row.position_value, 1_100.0);
        assert_eq!(row.return_dollars, 100.0);
        assert!((row.return_pct - 10.0).abs() < 1e-9);
        assert!((row.position_pct - 22.0).abs() < 1e-9);
    }

    #[test]
    fn test_option_rows_scale_by_contract_size() {
        let contract = Holding {
            symbol: "SPY".to_string(),
            instrument: SecurityType::Option,
            price: 4.2,
            quantity: 2.0,
            cost: 3.5,
            pct_change: 20.0,
            multiplier: 100.0,
            description: Some("450 lC".to_string()),
        };
        let row = HoldingRow::new(contract, 10_000.0);
        assert!((row.position_value - 840.0).abs() < 1e-9);
        assert!((row.return_dollars - 140.0).abs() < 1e-9);
        assert!((row.return_pct - 20.0).abs() < 1e-9);
        assert!((row.position_pct - 8.4).abs() < 1e-9);
    }

    #[test]
    fn test_aggregates() {
        let rows = vec![
            HoldingRow::new(holding("AAPL", 110.0, 10.0, 100.0), 3_000.0),
            HoldingRow::new(holding("MSFT", 200.0, 5.0, 220.0), 3_000.0),
        ];
        let portfolio = PortfolioProfile { equity: 3_000.0, previous_close_equity: 2_500.0 };
        let agg = ReportAggregates::compute(&account(900.0), &portfolio, &rows).unwrap();

        assert_eq!(agg.total_position_value, 2_100.0);
        assert_eq!(agg.total_portfolio_value, 3_000.0);
        assert!((agg.daily_change - 20.0).abs() < 1e-9);
        assert!((agg.cash_pct - 30.0).abs() < 1e-9);
        assert!((agg.position_pct - 70.0).abs() < 1e-9);
        assert_eq!(agg.return_dollars, 0.0); // +100 and -100
        assert_eq!(agg.total_position_cost, 2_100.0);
        assert_eq!(agg.return_pct, 0.0);
    }

    #[test]
    fn test_empty_holdings_is_an_error() {
        let portfolio = PortfolioProfile { equity: 0.0, previous_close_equity: 0.0 };
        let err = ReportAggregates::compute(&account(100.0), &portfolio, &[]).unwrap_err();
        assert!(err.to_string().contains("no open positions"));
    }

    #[test]
    fn test_html_labels_option_contracts() {
        let mut contract = holding("SPY", 4.2, 1.0, 3.5);
        contract.instrument = SecurityType::Option;
        contract.multiplier = 100.0;
        contract.description = Some("450 lC".to_string());
        let rows = vec![HoldingRow::new(contract, 1_000.0), HoldingRow::new(holding("F", 12.0, 1.0, 10.0), 1_000.0)];
        let portfolio = PortfolioProfile { equity: 1_000.0, previous_close_equity: 1_000.0 };
        let agg = ReportAggregates::compute(&account(500.0), &portfolio, &rows).unwrap();
        let when = NaiveDate::from_ymd_opt(2021, 3, 2).unwrap().and_hms_opt(9, 30, 0).unwrap();

        let html = render_holdings_html(&agg, &rows, when);
        assert!(html.contains("<td>SPY</td><td>450 lC</td>"));
        assert!(html.contains("<td>F</td><td>equity</td>"));
        assert!(html.contains("<td>420.00</td>")); // position value of one contract
    }

    #[test]
    fn test_html_contains_rows_and_aggregates() {
        let rows = vec![HoldingRow::new(holding("BRK<B>", 1_500.0, 2.0, 1_000.0), 10_000.0)];
        let portfolio = PortfolioProfile { equity: 10_000.0, previous_close_equity: 10_000.0 };
        let agg = ReportAggregates::compute(&account(7_000.0), &portfolio, &rows).unwrap();
        let when = NaiveDate::from_ymd_opt(2021, 3, 2).unwrap().and_hms_opt(9, 30, 0).unwrap();

        let html = render_holdings_html(&agg, &rows, when);
        assert!(html.contains("2021-03-02 09:30"));
        assert!(html.contains("BRK&lt;B&gt;"));
        assert!(html.contains("<td align=\"right\">10,000.00</td>"));
        assert!(html.contains("<td>1,000.00</td>")); // return dollars
    }
}
