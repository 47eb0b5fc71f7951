use std::path::{Path, PathBuf};

use clap::Args;
use keyward_security::{Algorithm, Verifier};
use tracing::debug;

use super::render::render_claims;
use super::{parse_algorithm, ProviderArgs};

/// Variable read when no token is given on the command line.
pub const TOKEN_ENV: &str = "KEYWARD_TOKEN";

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// The ID token (falls back to --token-file, then KEYWARD_TOKEN)
    pub token: Option<String>,

    /// Read the token from a file
    #[arg(long, value_name = "PATH")]
    pub token_file: Option<PathBuf>,

    #[command(flatten)]
    pub provider: ProviderArgs,

    /// Accept this algorithm; repeat to accept several (replaces the configured list)
    #[arg(long = "algorithm", value_name = "ALG", value_parser = parse_algorithm)]
    pub algorithms: Vec<Algorithm>,

    /// Print the verified payload as JSON instead of a summary
    #[arg(long)]
    pub json: bool,
}

/// Verify a token and print its claims.
pub async fn run(args: VerifyArgs) -> Result<(), Box<dyn std::error::Error>> {
    let token = read_token(
        args.token.as_deref(),
        args.token_file.as_deref(),
        |key| std::env::var(key).ok(),
    )?;

    let mut config = args.provider.load()?;
    if !args.algorithms.is_empty() {
        config = config.with_allowed_algorithms(args.algorithms.iter().copied());
        config.validate()?;
    }

    let verifier = Verifier::from_config(config)?;
    let claims = verifier.verify(&token).await?;
    debug!(sub = %claims.sub, "Token verified");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&claims.claims)?);
    } else {
        print!("{}", render_claims(&claims));
    }
    Ok(())
}

/// Pick the token from the argument, the file, or the environment, in that
/// order. Surrounding whitespace and a `Bearer ` prefix are dropped.
pub fn read_token(
    arg: Option<&str>,
    file: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<String, Box<dyn std::error::Error>> {
    let raw = match (arg, file) {
        (Some(token), _) => token.to_owned(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read token file {}: {e}", path.display()))?,
        (None, None) => env(TOKEN_ENV).ok_or_else(|| {
            format!("no token given; pass it as an argument, with --token-file, or in {TOKEN_ENV}")
        })?,
    };

    let token = raw.trim();
    let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
    if token.is_empty() {
        return Err("token is empty".into());
    }
    Ok(token.to_owned())
}
