//! HTTP server for the pipeline surface

use crate::context::AppContext;
use crate::handlers;
use pulse_common::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

/// HTTP server wrapper over the application context
pub struct Server {
    context: Arc<AppContext>,
}

impl Server {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    /// Serve until `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = format!(
            "{}:{}",
            self.context.config.server.bind_address, self.context.config.server.port
        );
        let app = handlers::create_router(self.context.clone()).layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any)
                        .max_age(Duration::from_secs(3600)),
                ),
        );

        info!("starting server on {}", bind_addr);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| Error::Network(format!("failed to bind {}: {}", bind_addr, e)))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Network(format!("server error: {}", e)))?;

        info!("server stopped");
        Ok(())
    }
}
