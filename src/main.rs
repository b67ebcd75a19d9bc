mod cli;
mod commands;
mod error;
mod logging;
mod output;

use crate::cli::Cli;
use crate::commands::{Outcome, Session};
use crate::error::{ErrorKind, Result};
use fastdbfs_config::{Config, LoggingConfig};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_with_rules();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            logging::init_tracing(&LoggingConfig::default().level, cli.verbosity);
            let reason = err.to_string();
            return report(err.raise(ErrorKind::Config(reason)));
        },
    };
    logging::init_tracing(&config.logging.level, cli.verbosity);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cleaning up");
                cancel.cancel();
            }
        }
    });

    match run(cli, &config, cancel).await {
        Ok(Outcome::Complete) => ExitCode::SUCCESS,
        Ok(Outcome::Partial) => ExitCode::FAILURE,
        Err(err) => report(err),
    }
}

async fn run(cli: Cli, config: &Config, cancel: CancellationToken) -> Result<Outcome> {
    let session = Session::open(config, cli.profile.as_deref(), cancel)?;
    session.run(cli.command, cli.rules).await
}

fn report(err: error::Error) -> ExitCode {
    tracing::debug!("{err:?}");
    eprintln!("fastdbfs: {err}");
    ExitCode::FAILURE
}
