//! HTTP middleware

use axum::http::{header, HeaderValue, Method};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::config::CorsConfig;

/// CORS layer for the browser frontend
pub fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let mut cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            header::ORIGIN,
        ])
        .max_age(Duration::from_secs(config.max_age));

    if config.allowed_origins.iter().any(|origin| origin == "*") {
        // Credentials cannot be combined with a wildcard origin
        if config.allow_credentials {
            warn!("CORS: ignoring allow_credentials with wildcard origin");
        }
        cors = cors.allow_origin(Any);
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|origin| match origin.parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("CORS: skipping invalid origin '{}'", origin);
                    None
                }
            })
            .collect();
        cors = cors
            .allow_origin(origins)
            .allow_credentials(config.allow_credentials);
    }

    cors
}
