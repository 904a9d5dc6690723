use std::process::ExitCode;

use clap::Parser;
use gallery_harvest::app::{self, types::Cli};

#[tokio::main]
async fn main() -> ExitCode {
    app::init_tracing();
    let cli = Cli::parse();
    match app::run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
