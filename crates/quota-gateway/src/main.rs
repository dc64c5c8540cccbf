use std::sync::Arc;

use pingora::server::configuration::Opt;
use quota_gateway::configuration::GatewayConfig;
use quota_gateway::metric::Metrics;
use quota_gateway::server::Server;

const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "gateway.yaml";

fn main() {
    let config_path =
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = GatewayConfig::load(&config_path)
        .expect("Failed to load gateway config")
        .with_env_overrides();

    // RUST_LOG still wins over the configured default.
    let default_filter = if config.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
    log::info!("starting gateway with config from {config_path}");

    // Pingora's own flags (-c, -d, -t, ...).
    let opt = Opt::parse_args();

    let mut server = Server::new(Some(opt)).expect("Failed to create server");
    let listen_addr = config.listen.clone();
    server
        .bootstrap(config, &listen_addr, Arc::new(Metrics::new()))
        .expect("Failed to bootstrap server");

    server.run_forever();
}
