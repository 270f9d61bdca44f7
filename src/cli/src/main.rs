//! Shale CLI entry point.

mod commands;

use clap::Parser;

use commands::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    shale_core::log::init_logging(cli.verbose);

    let code = commands::dispatch(cli).await;
    if code != 0 {
        std::process::exit(code);
    }
}
