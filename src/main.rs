use std::process::ExitCode;

use telemetry_relay::settings;

#[tokio::main]
async fn main() -> ExitCode {
    // RUST_LOG overrides the default level.
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    log::info!("telemetry-relay starting up...");

    let config_path = settings::config_path(std::env::args().nth(1));
    match telemetry_relay::run(config_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("telemetry-relay stopped: {err:#}");
            ExitCode::FAILURE
        }
    }
}
