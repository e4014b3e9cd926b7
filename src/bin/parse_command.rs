use anyhow::Result;
use robin_texts::commands::{Command, CommandTable, compute_limit_price};
use robin_texts::config::{BotConfig, CommandTriggers};
use std::io::{self, Read};

fn main() -> Result<()> {
    let triggers = match std::env::args().nth(1) {
        Some(path) => BotConfig::load_from_file(path)?.commands,
        None => CommandTriggers::default(),
    };

    let mut body = String::new();
    io::stdin().read_to_string(&mut body)?;

    let table = CommandTable::new(&triggers);
    let commands = table.classify(&body);
    if commands.is_empty() {
        println!("No command matched");
        return Ok(());
    }

    for command in commands {
        println!("{}", command);
        if let Command::LimitOrder { .. } = command {
            match table.order_params(&body) {
                Ok(params) => {
                    println!(
                        "  {} {} {} qty={} symbol={} adjustment={:?} {:?}",
                        params.order_type,
                        params.side,
                        params.instrument,
                        params.quantity,
                        params.symbol.to_ascii_uppercase(),
                        params.adjustment.direction,
                        params.adjustment.pct
                    );
                    println!(
                        "  limit at market 100.00 -> {:.4}",
                        compute_limit_price(100.0, &params.adjustment)
                    );
                }
                Err(e) => println!("  Error - {}", e),
            }
        }
    }
    Ok(())
}
