//! Top-level CLI configuration.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::commands::Command;

#[derive(Debug, Parser)]
#[command(name = "muxrpc", version, about = "Multiplexed RPC over TCP and HTTP CONNECT")]
pub struct CliConfig {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl CliConfig {
    /// Install logging, start the runtime and run the selected command.
    pub fn run(self) -> anyhow::Result<()> {
        init_tracing(self.verbose);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        let result = runtime.block_on(self.command.execute())?;
        println!("{result}");
        Ok(())
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        CliConfig::command().debug_assert();
    }

    #[test]
    fn test_verbose_is_global() {
        let config = CliConfig::try_parse_from(["muxrpc", "serve", "-v"]).unwrap();
        assert!(config.verbose);
    }
}
