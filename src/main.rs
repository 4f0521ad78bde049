use std::future::IntoFuture;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use staffetta::{
    cache::{CacheCoordinator, UrlPolicy},
    config,
    deploy::{DeploySequencer, ShellRuntime},
    error::AppError,
    fetch::HttpOriginFetcher,
    infra::{error::InfraError, http, telemetry},
    storage::{FsObjectStore, StorageGateway},
};
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let objects = Arc::new(FsObjectStore::new(
        settings.storage.root.clone(),
        settings.storage.public_base_url.clone(),
    )?);

    let fetcher = Arc::new(
        HttpOriginFetcher::new(settings.origin.clone())
            .map_err(|err| AppError::unexpected(format!("failed to build http client: {err}")))?,
    );

    let coordinator = Arc::new(CacheCoordinator::new(
        settings.cache.clone(),
        fetcher,
        objects.clone(),
    ));
    let loaded = coordinator.warm_start(objects.list().await?);
    info!(loaded, root = %settings.storage.root.display(), "Warm start complete");

    let policy = Arc::new(UrlPolicy::from_settings(&settings.policy)?);
    if settings.webhook.secret.is_none() {
        info!("No webhook secret configured, deploy surface disabled");
    }

    let runtime = Arc::new(ShellRuntime::new(settings.deploy.clone()));
    let sequencer = DeploySequencer::spawn(settings.deploy.clone(), runtime);

    let state = http::AppState {
        coordinator,
        policy,
        objects,
        sequencer,
        webhook_secret: settings.webhook.secret.clone(),
    };
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(InfraError::from)?;
    info!(addr = %settings.server.addr, "Listening");

    serve_http(listener, router, settings.server.graceful_shutdown).await
}

async fn serve_http(
    listener: tokio::net::TcpListener,
    router: axum::Router,
    grace: Duration,
) -> Result<(), AppError> {
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(err) => error!(error = %err, "Failed to listen for shutdown signal"),
        }
        let _ = shutdown_tx.send(());
    });

    let graceful = {
        let mut rx = shutdown_rx.clone();
        async move {
            let _ = rx.changed().await;
        }
    };
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(graceful)
        .into_future();

    // Connections get the grace window to drain, then the process exits.
    let deadline = {
        let mut rx = shutdown_rx;
        async move {
            let _ = rx.changed().await;
            tokio::time::sleep(grace).await;
        }
    };

    tokio::select! {
        result = server => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        () = deadline => {
            warn!(grace_seconds = grace.as_secs(), "Graceful shutdown window elapsed");
        }
    }
    Ok(())
}
