mod cli;

use std::process::ExitCode;
use tracing::error;

fn main() -> ExitCode {
    match cli::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("CLI error: {}", err);
            eprintln!("tapline: {}", err);
            ExitCode::FAILURE
        }
    }
}
