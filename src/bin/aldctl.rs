//! Entry point: loads configuration, picks a terminal role, and runs it
//! under the supervisor's role lock and shutdown handling.

use aldctl::config::Config;
use aldctl::{init_logging, supervisor, terminal};

#[tokio::main]
async fn main() {
    init_logging();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let role = config.terminal;
    supervisor::run_supervised(role, move || terminal::run(config)).await;
}
