use anyhow::Result;
use log::{error, info};
use std::env;

use robin_texts::config::BotConfig;
use robin_texts::connection::RobinhoodClient;
use robin_texts::logging;
use robin_texts::mail::MailClient;
use robin_texts::poller::Poller;
use robin_texts::routes::Router;
use robin_texts::session::Sessions;

#[tokio::main]
async fn main() -> Result<()> {
    // Get config file from command line argument or use default
    let args: Vec<String> = env::args().collect();
    let config_file = if args.len() > 1 { &args[1] } else { "config.json" };

    let config = BotConfig::load_from_file(config_file)?;
    logging::init(&config.logging)?;
    info!("Starting robin-texts with configuration from {}: {}", config_file, config.summary());

    let mail = MailClient::new(config.user_info.email.clone());
    let broker = RobinhoodClient::new(config.user_info.broker.clone())?;
    let mut sessions = Sessions::new(mail, broker);
    if let Err(e) = sessions.connect().await {
        error!("Initial connection failed: {:#}", e);
        logging::shutdown();
        return Err(e);
    }

    let router = Router::from_config(&config);
    let mut poller = Poller::new(&config.poll, router, sessions);

    match poller.run(tokio::signal::ctrl_c()).await {
        Ok(()) => {
            info!("Stopped after {} poll cycles", poller.cycles());
            logging::shutdown();
            Ok(())
        }
        Err(e) => {
            error!("Poll loop terminated: {:#}", anyhow::Error::from(e));
            logging::shutdown();
            std::process::exit(1);
        }
    }
}
