use clap::{Parser, Subcommand};
use keyward_cli::commands::{keys, verify};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "keyward",
    version,
    about = "keyward: verify OIDC ID tokens against the provider's published keys"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify an ID token and print its claims
    Verify(verify::VerifyArgs),
    /// Fetch the provider's JWKS and list the usable signing keys
    Keys(keys::KeysArgs),
}

/// Logs go to stderr so `--json` output stays clean.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Verify(args) => verify::run(args).await,
        Commands::Keys(args) => keys::run(args).await,
    };

    if let Err(e) = result {
        eprintln!("{}", colored::Colorize::red(format!("Error: {e}").as_str()));
        std::process::exit(1);
    }
}
