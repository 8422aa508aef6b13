mod autoresponder;
mod config;
mod db;
mod error;
mod filter;
mod forward;
mod maildir;
mod message;
mod report;
mod resolver;
mod router;
mod scanner;
mod session;

use log::debug;
use std::env;
use std::path::PathBuf;

fn main() {
    let config_dir = env::var("QBOX_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(config::DEFAULT_CONFIG_DIR));
    let config = config::Config::load(&config_dir);

    let default_level = if config.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();

    debug!("[main] configuration loaded from {}", config_dir.display());

    let code = session::fault_barrier(|| session::run(&config, &mut std::io::stdin().lock()));

    debug!("[main] exiting with {}", code);
    std::process::exit(code);
}
