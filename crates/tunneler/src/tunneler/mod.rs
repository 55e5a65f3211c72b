pub mod app;
pub mod auth;
pub mod config;
pub mod logging;
pub mod net;
pub mod telemetry;
pub mod tunnel;

pub async fn run(
    config_path: Option<std::path::PathBuf>,
    verbose: u8,
    command: app::Command,
) -> anyhow::Result<()> {
    app::run(config_path, verbose, command).await
}
