use anyhow::Context;
use tracing::{error, info, warn};

use attackmap_infra::{AppContext, Backends, Settings};
use attackmap_observability::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            attackmap_observability::init(LogFormat::default(), "info");
            return Err(e).context("loading settings");
        }
    };
    attackmap_observability::init(settings.log_format, &settings.log_level);

    let Backends {
        durable,
        cache,
        guard,
    } = Backends::acquire(&settings).await.context("acquiring storage backends")?;

    let grace = settings.shutdown_grace;
    let bind_addr = settings.bind_addr;

    let ctx = AppContext::build(settings, durable, cache).context("building application context")?;

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %listener.local_addr()?, "listening");

    let scheduler = ctx.start_jobs().context("starting scheduled jobs")?;
    let app = attackmap_api::app::build_app(ctx.clone(), scheduler.clone());

    // Stopping jobs and streams lets the server's connection drain finish.
    let served = axum::serve(listener, app)
        .with_graceful_shutdown({
            let ctx = ctx.clone();
            let scheduler = scheduler.clone();
            async move {
                wait_for_signal().await;
                info!("shutdown signal received");
                ctx.shutdown(&scheduler, grace).await;
            }
        })
        .await;

    if let Err(e) = &served {
        error!(error = %e, "http server failed; stopping jobs");
        ctx.shutdown(&scheduler, grace).await;
    }

    guard.release().await;
    served.context("http server")?;
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
