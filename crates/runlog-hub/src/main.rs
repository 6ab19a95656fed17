use runlog_hub::config::load_config;
use runlog_hub::executor::build_executor;
use runlog_hub::logging::init_logging;
use runlog_hub::{http, RunHub};
use runlog_storage::RunStore;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("runlog-hub: {err}");
            std::process::exit(2);
        }
    };
    let log_target = init_logging(&config);

    if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(err) = std::fs::create_dir_all(parent) {
            error!(event = "hub_error", error = %err, path = %parent.display());
            return;
        }
    }
    let store = match RunStore::open(&config.db_path) {
        Ok(store) => store,
        Err(err) => {
            error!(event = "hub_error", error = %err, db = %config.db_path.display());
            return;
        }
    };

    let hub = RunHub::new(
        store,
        build_executor(&config.executor),
        config.event_retention,
    );
    hub.spawn_idle_reaper(config.idle_evict);
    let listener = match tokio::net::TcpListener::bind(config.addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err, addr = %config.addr);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        db = %config.db_path.display(),
        executor = ?config.executor,
        retention = config.event_retention,
        idle_evict_secs = config.idle_evict.as_secs(),
        log_file = ?log_target.file
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown");
    };
    if let Err(err) = http::serve(listener, hub, shutdown).await {
        error!(event = "hub_error", error = %err);
    }
}
