//! edgegate-daemon - run orchestration daemon.
//!
//! Responsibilities at startup, in order: load configuration, open the
//! database and artifact store, load key material, resume any runs a
//! previous process left in flight, start the worker pool and the nonce
//! purge loop, then serve the CI ingress.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use edgegate_core::backend::{Backend, MockBackend};
use edgegate_core::cas::FsStore;
use edgegate_core::envelope::{BackendToken, MasterKey, MasterKeyRing};
use edgegate_core::signing::SigningKeyManager;

use edgegate_daemon::config::Config;
use edgegate_daemon::db::Store;
use edgegate_daemon::ingress::{self, IngressState};
use edgegate_daemon::runs::{Dispatcher, PollPolicy, WorkerDeps};
use edgegate_daemon::telemetry;

/// Interval between nonce purge sweeps.
const NONCE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// edgegate-daemon - device-farm CI gating orchestrator
#[derive(Parser, Debug)]
#[command(name = "edgegate-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Worker threads draining the run queue (overrides WORKER_THREADS)
    #[arg(long)]
    workers: Option<usize>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init(&args.log_level);

    let config = Config::from_env().context("loading configuration")?;
    info!(bind = %config.bind_addr, "edgegate-daemon starting");

    let db = Store::open(&config.database_path).context("opening database")?;
    let artifacts =
        Arc::new(FsStore::open(&config.object_store_dir).context("opening artifact store")?);

    let master =
        MasterKey::from_base64(&config.master_key_id, &config.master_key_b64)
            .context("loading master key")?;
    let masters = Arc::new(MasterKeyRing::new(master));

    let signer =
        Arc::new(SigningKeyManager::open(&config.signing_keys_dir).context("opening signing keys")?);
    if signer.current_key_id().is_none() {
        let record = signer.generate(&config.signing_key_id)?;
        info!(key_id = %record.key_id, "generated initial signing key");
    }

    // The vendor SDK adapter plugs in through this factory; without a
    // configured hub the daemon runs against the built-in mock, which is
    // enough for local development and the test suite.
    let backend_base_url = config.backend_base_url.clone();
    let backend_factory = Arc::new(move |_token: &BackendToken| -> Arc<dyn Backend> {
        if let Some(url) = &backend_base_url {
            info!(url = %url, "backend override configured; using mock transport against it");
        }
        Arc::new(MockBackend::single_device())
    });

    let deps = WorkerDeps {
        db: db.clone(),
        artifacts,
        masters: Arc::clone(&masters),
        signer: Arc::clone(&signer),
        backend_factory,
        poll: PollPolicy::default(),
        timeout_override: None,
    };

    let dispatcher = Arc::new(Dispatcher::new(deps));
    dispatcher.recover_interrupted();
    let workers = args.workers.unwrap_or(config.worker_threads);
    let _worker_handles = dispatcher.start(workers);
    info!(workers, "worker pool started");

    // Nonce purge loop.
    {
        let db = db.clone();
        std::thread::Builder::new()
            .name("nonce-purge".to_string())
            .spawn(move || loop {
                std::thread::sleep(NONCE_PURGE_INTERVAL);
                match db.purge_expired_nonces(chrono::Utc::now()) {
                    Ok(0) => {}
                    Ok(purged) => info!(purged, "purged expired nonces"),
                    Err(e) => tracing::warn!(error = %e, "nonce purge failed"),
                }
            })
            .expect("spawn purge thread");
    }

    let state = Arc::new(IngressState {
        db,
        masters,
        signer,
    });
    let router = ingress::router(state);

    // The ingress is the only async surface; give it its own runtime.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(config.bind_addr)
            .await
            .context("binding ingress")?;
        info!(addr = %config.bind_addr, "ingress listening");
        axum::serve(listener, router).await.context("serving")
    })?;

    dispatcher.stop();
    Ok(())
}
