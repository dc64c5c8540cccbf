use std::sync::Arc;

use pingora::prelude::*;
use pingora::server::RunArgs;
use pingora::server::Server as PingoraServer;
use pingora::server::configuration::Opt;

use crate::configuration::GatewayConfig;
use crate::gateway::Gateway;
use crate::metric::Metrics;
use crate::quota::QuotaEnforcer;
use crate::relay::Relay;
use crate::resolver::NamespaceResolver;
use crate::store::SqliteStore;
use crate::upstream::Upstream;

pub struct Server {
    server: PingoraServer,
}

impl Server {
    pub fn new(opt: Option<Opt>) -> Result<Self> {
        let server = PingoraServer::new(opt)?;
        Ok(Server { server })
    }

    pub fn bootstrap(
        &mut self,
        config: GatewayConfig,
        listen_addr: &str,
        metrics: Arc<Metrics>,
    ) -> Result<()> {
        self.server.bootstrap();

        config.validate().map_err(|e| {
            Error::explain(
                ErrorType::InternalError,
                format!("invalid gateway config: {e}"),
            )
        })?;

        let store = SqliteStore::open(&config.database).map_err(|e| {
            Error::explain(
                ErrorType::InternalError,
                format!("failed to open database {}: {e}", config.database),
            )
        })?;
        let store = Arc::new(store);
        log::info!("using database {}", config.database);

        let upstream = Upstream::new(&config.upstream).map_err(|e| {
            Error::explain(
                ErrorType::InternalError,
                format!("failed to build upstream client: {e}"),
            )
        })?;
        let upstream = Arc::new(upstream);
        log::info!(
            "relaying to {} with a daily limit of {} requests per namespace",
            config.upstream.base_url,
            config.daily_request_limit
        );

        let gateway = Gateway::new(
            NamespaceResolver::new(store.clone(), upstream.clone()),
            QuotaEnforcer::new(store, config.daily_request_limit),
            Relay::new(upstream),
            metrics,
        );

        let mut gateway_service = http_proxy_service(&self.server.configuration, gateway);
        gateway_service.add_tcp(listen_addr);
        self.server.add_service(gateway_service);
        log::info!("listening on {listen_addr}");

        Ok(())
    }

    pub fn run_forever(self) {
        self.server.run_forever();
    }

    pub fn run(self, args: RunArgs) {
        self.server.run(args);
    }
}
