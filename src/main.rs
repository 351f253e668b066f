use std::{
    env,
    error::Error,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use sluice::{
    config::{SluiceConfig, SluiceConfigLoadError},
    logging::SluiceLogger,
    telemetry::oltp::init_meter,
    thread::thread_create,
    worker::{Worker, WorkerOptions},
};

fn config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = dotenvy::var("SLUICE_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    Ok(env::current_dir()?.join("settings.toml"))
}

fn load_config(path: &Path) -> anyhow::Result<SluiceConfig> {
    let config = match SluiceConfig::load(path) {
        Ok(config) => config,
        Err(SluiceConfigLoadError::Io(_)) => {
            let default_config = SluiceConfig::default();
            let _ = default_config.save(path);
            default_config
        }
        Err(SluiceConfigLoadError::Parse(err)) => return Err(err.into()),
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = dotenvy::dotenv();
    #[cfg(debug_assertions)]
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .init();
    #[cfg(not(debug_assertions))]
    env_logger::init();

    let provider = if dotenvy::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        Some(init_meter()?)
    } else {
        None
    };

    let config = load_config(&config_path()?)?;

    // peers closing early must surface as EPIPE, not kill the process
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut workers = Vec::new();
    for index in 0..config.worker_count() {
        let options = WorkerOptions::from_config(index, &config);
        let policies = config.policies()?;
        let nodelay = config.nodelay;
        let stop = stop.clone();
        let handle = thread_create("sluice", index, config.affinity, move || {
            let mut worker = match Worker::bind(options, nodelay, policies, stop) {
                Ok(worker) => worker,
                Err(err) => {
                    SluiceLogger::worker_failed(index, &err);
                    return;
                }
            };
            if let Err(err) = worker.run() {
                SluiceLogger::worker_failed(index, &err);
            }
        })?;
        workers.push(handle);
    }

    {
        use futures::future::{select_all, FutureExt};
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let sigint_fut = sigint.recv().boxed();
        let sigterm_fut = sigterm.recv().boxed();

        let _ = select_all([sigint_fut, sigterm_fut]).await;
        if !stop.swap(true, Ordering::AcqRel) {
            log::info!("Received signal, stopping...");
        }
    }

    let _ = tokio::task::spawn_blocking(move || {
        for handle in workers {
            let _ = handle.join();
        }
    })
    .await;

    if let Some(provider) = provider {
        provider.shutdown()?;
    }
    Ok(())
}
