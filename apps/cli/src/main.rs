//! pipehub CLI — command hub dispatching named pipelines through a task
//! registry, a queue-fed worker pool, and a service-readiness gate.

mod commands;

use clap::Parser;

use commands::Cli;

#[tokio::main]
async fn main() {
    if let Err(err) = try_main().await {
        eprintln!("Error: {err:?}");
        std::process::exit(commands::exit_code_for(&err));
    }
}

async fn try_main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
