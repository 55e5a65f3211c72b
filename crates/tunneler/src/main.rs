mod tunneler;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "tunneler",
    version,
    about = "tunneler - TCP tunnels multiplexed over one WebSocket"
)]
struct Cli {
    /// Path to config file (.yaml/.yml/.toml). If omitted, uses TUNNELER_CONFIG; then auto-detects tunneler.yaml > tunneler.yml > tunneler.toml from CWD; then falls back to the OS default path (Linux: /etc/tunneler/tunneler.yaml; others: user config dir).
    #[arg(long, global = true, env = "TUNNELER_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Raise log verbosity (-v warn, -vv info, -vvv debug, -vvvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: tunneler::app::Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tunneler::run(cli.config, cli.verbose, cli.command).await
}
