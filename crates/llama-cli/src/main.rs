use std::process::ExitCode;

use clap::Parser;
use llama_cli::{run, Cli, RunOutcome};
use tokio_util::sync::CancellationToken;
use tracing::Level;

/// Conventional exit status after SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::WARN })
        .with_writer(std::io::stderr)
        .init();

    // Ctrl-C stops generation at the next token; the partial output is kept.
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping");
            on_interrupt.cancel();
        }
    });

    let command = cli.command;
    let result = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        run(command, cancel, &mut out)
    })
    .await;

    match result {
        Ok(Ok(RunOutcome::Completed)) => ExitCode::SUCCESS,
        Ok(Ok(RunOutcome::Cancelled)) => ExitCode::from(EXIT_INTERRUPTED),
        Ok(Err(e)) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("error: worker task failed: {e}");
            ExitCode::FAILURE
        }
    }
}
