mod auth;
mod handlers;

use anyhow::Result;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tracing::info;

use crate::auth::{MaintainerResolver, ProtectionEvaluator};
use crate::provisioning::ProvisioningScheduler;

pub use auth::{AppState, AuthCredentials};
pub use handlers::{PushCheckRequest, ViewerQuery};

pub struct ForgeServer {
    state: AppState,
    addr: String,
}

impl ForgeServer {
    pub fn new(
        maintainers: Arc<MaintainerResolver>,
        protection: Arc<ProtectionEvaluator>,
        addr: String,
    ) -> Self {
        Self {
            state: AppState {
                maintainers,
                protection,
                scheduler: None,
                auth: None,
            },
            addr,
        }
    }

    pub fn with_auth(mut self, username: String, password: String) -> Self {
        self.state.auth = Some(AuthCredentials { username, password });
        self
    }

    /// Expose pending attestations and manual ticks
    pub fn with_scheduler(mut self, scheduler: Arc<ProvisioningScheduler>) -> Self {
        self.state.scheduler = Some(scheduler);
        self
    }

    pub fn router(&self) -> Router {
        // Public endpoints (no auth required)
        let public_routes = Router::new()
            .route("/", get(handlers::serve_root))
            .route("/api/repos/:owner/:repo", get(handlers::repo_info))
            .route("/api/repos/:owner/:repo/protection", get(handlers::repo_protection))
            .route("/api/repos/:owner/:repo/push-check", post(handlers::push_check))
            .with_state(self.state.clone());

        // Protected endpoints (require auth if enabled)
        let protected_routes = Router::new()
            .route("/api/repos/:owner/:repo/invalidate", post(handlers::invalidate))
            .route("/api/attestations", get(handlers::list_attestations))
            .route("/api/tick", post(handlers::run_tick))
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                auth::auth_middleware,
            ))
            .with_state(self.state.clone());

        public_routes.merge(protected_routes)
    }

    pub async fn run(self) -> Result<()> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        info!("Listening on {}", listener.local_addr()?);
        axum::serve(listener, app).await?;

        Ok(())
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}
