//! Server assembly: wires settings, store, cache, audit sink and engine into
//! the axum application and serves it.

use std::sync::Arc;

use axum::Router;
use miette::{IntoDiagnostic, Result};
use sea_orm::DatabaseConnection;

use crate::audit::AuditSink;
use crate::authz::cache::AuthzCache;
use crate::authz::engine::Engine;
use crate::authz::web::AuthzState;
use crate::settings::Settings;

pub fn build_engine(
    settings: &Settings,
    db: DatabaseConnection,
    cache: Arc<AuthzCache>,
    audit: AuditSink,
) -> Arc<Engine> {
    Arc::new(Engine::new(
        db,
        cache,
        audit,
        settings.authz.item_concurrency,
    ))
}

pub fn build_router(settings: &Settings, engine: Arc<Engine>) -> Router {
    crate::authz::web::router(AuthzState {
        engine,
        request_timeout: settings.request_timeout(),
    })
}

pub async fn serve(settings: Settings, engine: Arc<Engine>) -> Result<()> {
    let router = build_router(&settings, engine);
    let addr = format!("{}:{}", settings.server.host, settings.server.port);

    let listener = tokio::net::TcpListener::bind(&addr).await.into_diagnostic()?;
    tracing::info!("Listening on http://{addr}");
    axum::serve(listener, router).await.into_diagnostic()?;
    Ok(())
}
