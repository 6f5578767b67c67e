// src/main.rs
use std::process::ExitCode;
use tracing::error;
use webserv::logging::init_logging;
use webserv::{Config, Server};

fn main() -> ExitCode {
    init_logging();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration rejected");
            return ExitCode::FAILURE;
        }
    };

    let mut server = match Server::bind(&config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.install_signal_handler() {
        error!(error = %e, "signal handler");
        return ExitCode::FAILURE;
    }

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "event loop failed");
            ExitCode::FAILURE
        }
    }
}
