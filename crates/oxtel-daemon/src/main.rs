use anyhow::Result;
use oxtel_common::event::EventBus;
use oxtel_common::types::TrustLevel;
use oxtel_control::artifact::ArtifactStore;
use oxtel_control::{CatalogConfig, PluginCatalog};
use oxtel_daemon::app;
use oxtel_daemon::config::DaemonConfig;
use oxtel_daemon::link::DaemonDelegate;
use oxtel_daemon::state::{AppState, AuthSettings};
use oxtel_plugin::signing::SignatureVerifier;
use oxtel_scheduler::{Scheduler, SchedulerConfig};
use oxtel_tribe::{Tribe, TribeConfig};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  oxteld [config.toml]     Start the telemetry daemon");
    eprintln!();
    eprintln!("Environment: OXTEL_LOG_LEVEL (1-5), OXTEL_LOG_PATH, OXTEL_MAX_CORES,");
    eprintln!("  OXTEL_MAX_PLUGINS, OXTEL_TRUST_LEVEL (0-2), OXTEL_KEYRING_FILES,");
    eprintln!("  OXTEL_CACHE_EXPIRATION, OXTEL_AUTOLOAD_PATH, OXTEL_PASSWORD");
}

fn log_directive(level: i64) -> &'static str {
    match level {
        1 => "oxtel=debug",
        2 => "oxtel=info",
        3 => "oxtel=warn",
        4 => "oxtel=error",
        _ => "oxtel=error",
    }
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config_path = match args.get(1).map(|s| s.as_str()) {
        Some("--help" | "-h") => {
            print_usage();
            return Ok(());
        }
        other => other,
    };

    let config = DaemonConfig::load(config_path)?;
    config.validate()?;

    let filter = EnvFilter::from_default_env()
        .add_directive(log_directive(config.daemon.log_level).parse()?);
    match &config.daemon.log_path {
        Some(dir) => {
            let dir_meta = std::fs::metadata(dir)
                .map_err(|e| anyhow::anyhow!("log path {dir}: {e}"))?;
            if !dir_meta.is_dir() {
                anyhow::bail!("log path provided must be a directory");
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(Path::new(dir).join("oxtel.log"))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|e| anyhow::anyhow!("Failed to install default CryptoProvider: {e:?}"))?;

    let cores = config.effective_cores();
    tracing::info!(cores, "starting oxteld (version: {})", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cores)
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

fn build_verifier(config: &DaemonConfig) -> Result<SignatureVerifier> {
    let trust: TrustLevel = config
        .control
        .plugin_trust_level
        .to_string()
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let mut verifier = SignatureVerifier::new(trust);
    if trust == TrustLevel::Disabled {
        return Ok(verifier);
    }

    for raw in &config.control.keyring_paths {
        let path = Path::new(raw);
        let meta = std::fs::metadata(path)
            .map_err(|e| anyhow::anyhow!("bad keyring file {raw}: {e}"))?;
        if meta.is_dir() {
            tracing::info!(path = raw, "adding keyrings from directory");
            for entry in std::fs::read_dir(path)? {
                let entry = entry?;
                if entry.path().is_file() {
                    verifier
                        .add_keyring_file(&entry.path())
                        .map_err(|e| anyhow::anyhow!("{e}"))?;
                }
            }
        } else {
            tracing::info!(path = raw, "adding keyring file");
            verifier
                .add_keyring_file(path)
                .map_err(|e| anyhow::anyhow!("{e}"))?;
        }
    }
    if verifier.key_count() == 0 {
        anyhow::bail!("need keyring file when trust is on");
    }
    Ok(verifier)
}

async fn run(config: DaemonConfig) -> Result<()> {
    oxtel_common::id::init(1);
    let config = Arc::new(config);

    let verifier = build_verifier(&config)?;
    tracing::info!(
        trust = ?verifier.trust_level(),
        keys = verifier.key_count(),
        "plugin trust configured"
    );

    let events = Arc::new(EventBus::new());
    let artifacts = ArtifactStore::new(None)?;

    let mut catalog_cfg = CatalogConfig {
        cache_ttl: config.cache_ttl(),
        autoload_paths: config
            .control
            .autoload_paths
            .iter()
            .map(Into::into)
            .collect(),
        ..CatalogConfig::default()
    };
    catalog_cfg.pool.max_running = config.control.max_running_plugins;
    let catalog = PluginCatalog::new(catalog_cfg, verifier, events.clone(), artifacts);

    let scheduler_cfg = SchedulerConfig {
        collect_queue_size: config.scheduler.queue_size,
        process_queue_size: config.scheduler.queue_size,
        publish_queue_size: config.scheduler.queue_size,
        collect_workers: config.scheduler.worker_pool_size,
        process_workers: config.scheduler.worker_pool_size,
        publish_workers: config.scheduler.worker_pool_size,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(scheduler_cfg, catalog.clone(), events.clone());
    catalog.set_task_reaper(scheduler.clone());

    let password = config.resolve_password()?;
    if config.rest.auth_enabled && password.is_none() {
        anyhow::bail!("rest auth is enabled but no password is configured");
    }
    let auth = Arc::new(AuthSettings {
        enabled: config.rest.auth_enabled,
        username: config.rest.username.clone(),
        password: password.unwrap_or_default(),
    });

    let tribe = if config.tribe.enabled {
        let bind_addr: SocketAddr = config
            .tribe
            .bind_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("bad tribe bind address: {e}"))?;
        let seed = match &config.tribe.seed {
            Some(seed) => Some(
                seed.parse::<SocketAddr>()
                    .map_err(|e| anyhow::anyhow!("bad tribe seed address: {e}"))?,
            ),
            None => None,
        };
        let node_name = config.tribe.node_name.clone().unwrap_or_else(|| {
            std::env::var("HOSTNAME").unwrap_or_else(|_| "oxtel-node".to_string())
        });
        let rest_addr = format!("{}:{}", bind_addr.ip(), config.rest.port);
        let tribe = Tribe::new(TribeConfig {
            node_name,
            bind_addr,
            seed,
            rest_addr: Some(rest_addr),
            ..TribeConfig::default()
        })
        .await?;
        tribe.set_delegate(DaemonDelegate::new(
            catalog.clone(),
            scheduler.clone(),
            auth.clone(),
        ));
        events.register("tribe", tribe.clone());
        tribe.start();
        Some(tribe)
    } else {
        None
    };

    let sweeper = catalog.start_sweeper();
    catalog.autoload().await;

    let state = AppState {
        catalog: catalog.clone(),
        scheduler: scheduler.clone(),
        tribe: tribe.clone(),
        auth,
        start_time: chrono::Utc::now(),
        config: config.clone(),
    };

    let rest_handle = if config.rest.enabled {
        let addr: SocketAddr = format!("0.0.0.0:{}", config.rest.port).parse()?;
        let app = app::build_http_app(state);
        if config.rest.https {
            let cert = config.rest.cert_path.clone().expect("validated");
            let key = config.rest.key_path.clone().expect("validated");
            let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                .await
                .map_err(|e| anyhow::anyhow!("bad certificate or key file: {e}"))?;
            tracing::info!(%addr, "rest api listening (https)");
            Some(tokio::spawn(async move {
                axum_server::bind_rustls(addr, tls)
                    .serve(app.into_make_service())
                    .await
                    .map_err(anyhow::Error::from)
            }))
        } else {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| anyhow::anyhow!("cannot bind rest listener {addr}: {e}"))?;
            tracing::info!(%addr, "rest api listening");
            Some(tokio::spawn(async move {
                axum::serve(listener, app).await.map_err(anyhow::Error::from)
            }))
        }
    } else {
        tracing::info!("rest api is disabled");
        None
    };

    tracing::info!("oxteld started");

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let server_error: Option<anyhow::Error> = match rest_handle {
        Some(handle) => {
            tokio::select! {
                result = handle => match result {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e),
                    Err(e) => Some(anyhow::anyhow!("rest server panicked: {e}")),
                },
                _ = signal::ctrl_c() => None,
                _ = sigterm.recv() => None,
            }
        }
        None => {
            tokio::select! {
                _ = signal::ctrl_c() => None,
                _ = sigterm.recv() => None,
            }
        }
    };

    // Ordered stop: scheduler first (no new firings), then the catalog
    // (no orphan plugin subprocesses), then tribe (announce departure).
    tracing::info!("shutting down modules");
    scheduler.shutdown().await;
    catalog.shutdown().await;
    if let Some(tribe) = tribe {
        tribe.shutdown().await;
    }
    sweeper.abort();

    match server_error {
        Some(e) => Err(e),
        None => {
            tracing::info!("oxteld stopped");
            Ok(())
        }
    }
}
