use std::sync::Arc;

use clap::Args;
use keyward_security::{HttpJwksFetcher, KeyResolver};

use super::render::render_keys;
use super::ProviderArgs;

#[derive(Args, Debug)]
pub struct KeysArgs {
    #[command(flatten)]
    pub provider: ProviderArgs,
}

/// Fetch the provider's key set once, through the rate-limited resolver,
/// and list it.
pub async fn run(args: KeysArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.provider.load()?;
    let fetcher = HttpJwksFetcher::new(config.fetch_timeout())?;
    let resolver = KeyResolver::from_config(Arc::new(fetcher), &config)?;
    let set = resolver.key_set(&config.jwks_uri).await?;
    print!("{}", render_keys(&set));
    Ok(())
}
