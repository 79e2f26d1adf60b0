use axum::{
    body::Body,
    extract::State,
    http::{header, Request, Response, StatusCode},
    middleware::Next,
};
use base64::Engine;
use std::sync::Arc;

use crate::auth::{MaintainerResolver, ProtectionEvaluator};
use crate::provisioning::ProvisioningScheduler;

#[derive(Clone)]
pub struct AppState {
    pub maintainers: Arc<MaintainerResolver>,
    pub protection: Arc<ProtectionEvaluator>,
    pub scheduler: Option<Arc<ProvisioningScheduler>>,
    pub auth: Option<AuthCredentials>,
}

#[derive(Clone)]
pub struct AuthCredentials {
    pub username: String,
    pub password: String,
}

impl AuthCredentials {
    /// Whether an `Authorization` header value carries these credentials
    fn accepts(&self, header_value: &str) -> bool {
        let Some(encoded) = header_value.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        decoded == format!("{}:{}", self.username, self.password)
    }
}

/// Auth middleware - validates HTTP Basic Auth
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    // If auth is not enabled, allow request
    let Some(auth) = &state.auth else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| auth.accepts(v));

    if authorized {
        next.run(request).await
    } else {
        let mut response = Response::new(Body::from("Unauthorized"));
        *response.status_mut() = StatusCode::UNAUTHORIZED;
        response.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            header::HeaderValue::from_static("Basic realm=\"forgestr\""),
        );
        response
    }
}
