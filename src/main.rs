use std::sync::Arc;
use std::time::Duration;

use pingora::services::background::background_service;
use pingora_core::server::{configuration::Opt, Server};
use tokio::runtime::Runtime;

use roomscale::{
    cluster::{Cluster, CommandQueue, Controller, Router},
    config::Config,
    core::{ErrorContext, GatewayResult},
    logging::{self, FileLogger},
    middleware::{build_gateway, BuildContext},
    protocol::HttpApiClient,
    service::ApiHttpApp,
    store::{EtcdStore, MemoryStore, Store},
};

/// Timeout of a single backend API call.
const BACKEND_TIMEOUT: Duration = Duration::from_secs(20);

async fn open_store(config: &Config) -> GatewayResult<Arc<dyn Store>> {
    match &config.store.etcd {
        Some(etcd) => {
            log::info!("Connecting to etcd at {:?}...", etcd.host);
            let store = EtcdStore::connect(etcd).await.with_context("connecting etcd")?;
            Ok(Arc::new(store))
        }
        None => {
            log::warn!("No store configured, state is kept in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn seed(config: &Config, store: &dyn Store) -> GatewayResult<()> {
    for seed in &config.backends {
        let existing = store.get_backend(&seed.id).await?;
        store.save_backend(&seed.apply(existing)).await?;
        log::info!(backend = seed.id.as_str(); "Seeded backend");
    }
    for seed in &config.frontends {
        let existing = store.get_frontend(&seed.id).await?;
        store.save_frontend(&seed.apply(existing)).await?;
        log::info!(frontend = seed.id.as_str(); "Seeded frontend");
    }
    Ok(())
}

fn exit_on_error<T>(result: GatewayResult<T>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            log::error!("{what}: {e}");
            eprintln!("{what}: {e}");
            std::process::exit(1);
        }
    }
}

fn main() {
    let cli_options = Opt::parse_args();
    let config = match Config::load_yaml_with_opt_override(&cli_options) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let logger = match &config.log {
        Some(log_cfg) => {
            let logger = FileLogger::new(log_cfg.clone());
            logger.init_env_logger();
            Some(logger)
        }
        None => {
            logging::init_stderr(log::LevelFilter::Info);
            None
        }
    };

    // Keeps driving the store connection for the lifetime of the process.
    let runtime = exit_on_error(
        Runtime::new().with_context("starting setup runtime"),
        "Failed to start",
    );
    let store = exit_on_error(runtime.block_on(open_store(&config)), "Failed to open store");
    exit_on_error(runtime.block_on(seed(&config, store.as_ref())), "Failed to seed store");

    let client = exit_on_error(HttpApiClient::new(BACKEND_TIMEOUT), "Failed to build client");
    let cluster = Cluster::new(store.clone(), Arc::new(client));
    let router = exit_on_error(
        Router::with_filters(cluster.clone(), &config.router.filter_names()),
        "Failed to build router",
    );

    let build = BuildContext {
        router: Arc::new(router),
        server: config.server.clone(),
    };
    let gateway = exit_on_error(
        build_gateway(&config.gateway.pipeline(), &build),
        "Failed to build gateway",
    );

    let queue = CommandQueue::new(
        store.clone(),
        Duration::from_secs(config.controller.queue_wait),
    );
    let controller = Controller::new(cluster, queue)
        .with_refresh_interval(Duration::from_secs(config.controller.refresh_interval))
        .with_command_deadline(chrono::Duration::seconds(
            config.controller.command_deadline as i64,
        ))
        .with_command_retention(chrono::Duration::seconds(
            config.controller.command_retention as i64,
        ));

    let app = exit_on_error(
        ApiHttpApp::new(store, Arc::new(gateway), &config.server),
        "Failed to build API service",
    );
    let api_service = ApiHttpApp::api_http_service(app, &config.server);

    let mut server = Server::new_with_opt_and_conf(Some(cli_options), config.pingora);

    if let Some(log_service) = logger {
        log::info!("Adding log file service...");
        server.add_service(log_service);
    }

    log::info!("Adding controller...");
    server.add_service(background_service("controller", controller));

    log::info!(listen = config.server.listen.to_string().as_str(); "Adding API service...");
    server.add_service(api_service);

    log::info!("Bootstrapping...");
    server.bootstrap();

    log::info!("Starting Server...");
    server.run_forever();
}
