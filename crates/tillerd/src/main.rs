//! Binary entry point for the tiller runtime daemon.

use std::process::ExitCode;

use tracing::{error, info};

use tiller_config::ServiceConfig;
use tillerd::ServiceOrchestrator;

fn main() -> ExitCode {
    let config = match ServiceConfig::from_args() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("tillerd: {error}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(error) = tillerd::initialise_telemetry(&config.logging) {
        eprintln!("tillerd: {error}");
        return ExitCode::FAILURE;
    }

    let orchestrator = match ServiceOrchestrator::init(config) {
        Ok(orchestrator) => orchestrator,
        Err(source) => {
            error!(error = %source, "service initialisation failed");
            return ExitCode::FAILURE;
        }
    };

    let code = orchestrator.run();
    info!("tiller runtime stopped");
    code
}
