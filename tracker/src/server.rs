use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::database::PgClient;
use crate::router;
use crate::time::SystemTime;
use crate::token::TokenGenerator;

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let tokens = match TokenGenerator::new(&config.token_secret) {
        Ok(tokens) => tokens,
        Err(e) => {
            tracing::error!("unusable token secret: {}", e);
            return;
        }
    };

    let client = match PgClient::new(
        &config.database_url,
        config.max_pg_connections,
        config.database_timeout_ms,
    )
    .await
    {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("failed to connect to postgres: {}", e);
            return;
        }
    };

    if config.run_migrations {
        if let Err(e) = client.run_migrations().await {
            tracing::error!("failed to run migrations: {}", e);
            return;
        }
        tracing::info!("migrations applied");
    }

    let app = router::router(SystemTime {}, Arc::new(client), tokens, &config);

    serve_router(app, listener, shutdown).await
}

pub async fn serve_router<F>(app: Router, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match listener.local_addr() {
        Ok(addr) => tracing::info!("listening on {:?}", addr),
        Err(e) => tracing::warn!("could not read listener address: {}", e),
    }

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        tracing::error!("server stopped with an error: {}", e);
    }
}
