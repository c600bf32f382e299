use clap::Parser;
use rucert::cli::{Cli, Commands};
use rucert::config::Config;
use rucert::logging;
use rucert::runner::Runner;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => {
            let mut cfg = match Config::load(&args.config) {
                Ok(cfg) => cfg,
                Err(e) => {
                    eprintln!("config error: {:#}", e);
                    std::process::exit(1);
                }
            };
            if let Some(level) = args.log_level {
                cfg.logging.level = level;
            }
            logging::init(&cfg.logging);

            let code = match Runner::new(cfg).run().await {
                Ok(code) => code,
                Err(e) => {
                    error!("fatal: {:#}", e);
                    1
                }
            };
            std::process::exit(code);
        }
        Commands::Version => {
            println!("rucert {}", env!("CARGO_PKG_VERSION"));
        }
    }
}
