mod config;
mod error;
mod handlers;
mod http;
mod router;
mod server;

use crate::server::Server;
use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        let program = args.first().map(String::as_str).unwrap_or("webserv");
        eprintln!("Error: Usage: {} <config_file>.conf", program);
        return ExitCode::FAILURE;
    }

    let config = match config::parse_config(&args[1]) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    log::info!(
        "loaded {} server block(s) from {}",
        config.servers.len(),
        args[1]
    );

    let mut server = match Server::new(config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = server.bind() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
