//! HTTP layer of the cafeteria backend.
//!
//! Translates requests into service calls and service errors into status
//! codes. Admin routes sit behind a real role gate: the acting identity is
//! read from the `x-username` header and checked against the stored role
//! before the handler runs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::rejection::JsonRejection,
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
    Json, Router,
};
use model::{
    Credentials, NewProduct, PlaceOrderRequest, ProductUpdate, RegisterRequest, Role, UserUpdate,
};
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use serde::Deserialize;
use serde_json::json;
use service::{AccountService, CatalogService, OrderService, ServiceError};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

/// Server represents the HTTP front of the ordering backend.
pub struct Server {
    port: u16,
    orders: Arc<dyn OrderService>,
    catalog: Arc<dyn CatalogService>,
    accounts: Arc<dyn AccountService>,
    metrics: Arc<Metrics>,
}

/// Metrics collects and exposes HTTP server metrics.
struct Metrics {
    registry: Registry,
    http_requests_total: CounterVec,
    http_request_duration_seconds: HistogramVec,
    errors_total: CounterVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let http_requests_total = CounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["method", "endpoint", "status"],
        )
        .expect("Failed to create http_requests_total metric");

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "endpoint"],
        )
        .expect("Failed to create http_request_duration_seconds metric");

        let errors_total = CounterVec::new(
            Opts::new("errors_total", "Total number of error responses"),
            &["endpoint"],
        )
        .expect("Failed to create errors_total metric");

        registry
            .register(Box::new(http_requests_total.clone()))
            .expect("Failed to register http_requests_total metric");
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .expect("Failed to register http_request_duration_seconds metric");
        registry
            .register(Box::new(errors_total.clone()))
            .expect("Failed to register errors_total metric");

        Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            errors_total,
        }
    }

    fn record_request(&self, method: &str, endpoint: &str, status: u16, duration: Duration) {
        self.http_requests_total
            .with_label_values(&[method, endpoint, &status.to_string()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, endpoint])
            .observe(duration.as_secs_f64());
        if status >= 400 {
            self.errors_total.with_label_values(&[endpoint]).inc();
        }
    }
}

/// Application state shared between request handlers.
#[derive(Clone)]
struct AppState {
    orders: Arc<dyn OrderService>,
    catalog: Arc<dyn CatalogService>,
    accounts: Arc<dyn AccountService>,
    metrics: Arc<Metrics>,
}

/// Payload of the admin inventory adjustment.
#[derive(Debug, Deserialize)]
struct InventoryPayload {
    new_quantity: i32,
}

/// Payload of the admin activate/retire toggle.
#[derive(Debug, Deserialize)]
struct StatusPayload {
    is_active: bool,
}

impl Server {
    /// Creates a new Server instance over the injected services.
    pub fn new(
        port: u16,
        orders: Arc<dyn OrderService>,
        catalog: Arc<dyn CatalogService>,
        accounts: Arc<dyn AccountService>,
    ) -> Self {
        info!("Initializing HTTP server on port {}", port);

        Self {
            port,
            orders,
            catalog,
            accounts,
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Starts the server and blocks until it's shut down.
    pub async fn start(&self) -> Result<()> {
        let app = self.create_router();

        let listener = TcpListener::bind(format!("0.0.0.0:{}", self.port))
            .await
            .context("Failed to bind to port")?;

        info!("HTTP server listening on port {}", self.port);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Server error")?;

        info!("HTTP server shut down gracefully");
        Ok(())
    }

    fn create_router(&self) -> Router {
        let state = AppState {
            orders: self.orders.clone(),
            catalog: self.catalog.clone(),
            accounts: self.accounts.clone(),
            metrics: self.metrics.clone(),
        };

        let admin = Router::new()
            .route(
                "/api/admin/products/branch/{branch_id}",
                get(Self::handle_admin_products_by_branch),
            )
            .route(
                "/api/admin/products/{branch_id}/{product_id}",
                get(Self::handle_admin_get_product).put(Self::handle_admin_update_product),
            )
            .route("/api/admin/products", post(Self::handle_admin_create_product))
            .route(
                "/api/admin/products/{branch_id}/{product_id}/inventory",
                patch(Self::handle_admin_adjust_inventory),
            )
            .route(
                "/api/admin/products/{branch_id}/{product_id}/status",
                patch(Self::handle_admin_set_status),
            )
            .route("/api/admin/users", get(Self::handle_admin_list_users))
            .route(
                "/api/admin/users/{username}",
                put(Self::handle_admin_update_user).delete(Self::handle_admin_delete_user),
            )
            .layer(middleware::from_fn_with_state(
                state.clone(),
                Self::require_admin,
            ));

        Router::new()
            .route("/api/orders", post(Self::handle_place_order))
            .route(
                "/api/orders/branch/{branch_id}",
                get(Self::handle_orders_by_branch),
            )
            .route(
                "/api/orders/product/{product_name}",
                get(Self::handle_orders_by_product),
            )
            .route("/api/branches", get(Self::handle_branches))
            .route(
                "/api/products/branch/{branch_id}",
                get(Self::handle_products_by_branch),
            )
            .route("/api/catalog/products", get(Self::handle_catalog))
            .route("/api/products", get(Self::handle_all_products))
            .route("/api/auth/login", post(Self::handle_login))
            .route("/api/auth/register", post(Self::handle_register))
            .merge(admin)
            .route("/health", get(Self::handle_health))
            .route("/metrics", get(Self::handle_metrics))
            .layer(middleware::from_fn_with_state(
                state.metrics.clone(),
                Self::metrics_middleware,
            ))
            .with_state(state)
    }

    /// Middleware collecting request count, duration, and error metrics.
    async fn metrics_middleware(
        State(metrics): State<Arc<Metrics>>,
        req: Request,
        next: Next,
    ) -> Response {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let start = std::time::Instant::now();

        let response = next.run(req).await;

        metrics.record_request(&method, &path, response.status().as_u16(), start.elapsed());
        response
    }

    /// Role gate for the admin routes. The claimed identity arrives in the
    /// `x-username` header; the stored account must carry the admin role.
    async fn require_admin(State(state): State<AppState>, req: Request, next: Next) -> Response {
        let username = req
            .headers()
            .get("x-username")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let Some(username) = username else {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "x-username header is required"})),
            )
                .into_response();
        };

        match state.accounts.authorize(&username, Role::Admin).await {
            Ok(()) => next.run(req).await,
            Err(err) => error_response(err),
        }
    }

    async fn handle_place_order(
        State(state): State<AppState>,
        payload: Result<Json<PlaceOrderRequest>, JsonRejection>,
    ) -> Response {
        let Json(req) = match payload {
            Ok(payload) => payload,
            Err(rejection) => return bad_request(rejection.body_text()),
        };

        match state.orders.place_order(&req).await {
            Ok(placed) => (
                StatusCode::CREATED,
                Json(json!({
                    "message": "Order recorded and inventory updated",
                    "new_quantity": placed.new_quantity,
                })),
            )
                .into_response(),
            Err(err) => error_response(err),
        }
    }

    async fn handle_orders_by_branch(
        State(state): State<AppState>,
        Path(branch_id): Path<i32>,
    ) -> Response {
        json_or_error(state.orders.orders_by_branch(branch_id).await)
    }

    async fn handle_orders_by_product(
        State(state): State<AppState>,
        Path(product_name): Path<String>,
    ) -> Response {
        json_or_error(state.orders.orders_by_product(&product_name).await)
    }

    async fn handle_branches(State(state): State<AppState>) -> Response {
        json_or_error(state.orders.branches().await)
    }

    async fn handle_products_by_branch(
        State(state): State<AppState>,
        Path(branch_id): Path<i32>,
    ) -> Response {
        json_or_error(state.catalog.products_by_branch(branch_id).await)
    }

    async fn handle_catalog(State(state): State<AppState>) -> Response {
        json_or_error(state.catalog.catalog().await)
    }

    async fn handle_all_products(State(state): State<AppState>) -> Response {
        json_or_error(state.catalog.all_products().await)
    }

    async fn handle_login(
        State(state): State<AppState>,
        payload: Result<Json<Credentials>, JsonRejection>,
    ) -> Response {
        let Json(creds) = match payload {
            Ok(payload) => payload,
            Err(rejection) => return bad_request(rejection.body_text()),
        };

        json_or_error(state.accounts.login(&creds).await)
    }

    async fn handle_register(
        State(state): State<AppState>,
        payload: Result<Json<RegisterRequest>, JsonRejection>,
    ) -> Response {
        let Json(req) = match payload {
            Ok(payload) => payload,
            Err(rejection) => return bad_request(rejection.body_text()),
        };

        match state.accounts.register(&req).await {
            Ok(()) => (
                StatusCode::CREATED,
                Json(json!({"message": "User registered successfully"})),
            )
                .into_response(),
            Err(err) => error_response(err),
        }
    }

    async fn handle_admin_products_by_branch(
        State(state): State<AppState>,
        Path(branch_id): Path<i32>,
    ) -> Response {
        json_or_error(state.catalog.admin_products_by_branch(branch_id).await)
    }

    async fn handle_admin_get_product(
        State(state): State<AppState>,
        Path((branch_id, product_id)): Path<(i32, String)>,
    ) -> Response {
        json_or_error(state.catalog.admin_get_product(branch_id, &product_id).await)
    }

    async fn handle_admin_create_product(
        State(state): State<AppState>,
        payload: Result<Json<NewProduct>, JsonRejection>,
    ) -> Response {
        let Json(product) = match payload {
            Ok(payload) => payload,
            Err(rejection) => return bad_request(rejection.body_text()),
        };

        match state.catalog.create_product(&product).await {
            Ok(()) => (
                StatusCode::CREATED,
                Json(json!({"message": "Product created successfully"})),
            )
                .into_response(),
            Err(err) => error_response(err),
        }
    }

    async fn handle_admin_update_product(
        State(state): State<AppState>,
        Path((branch_id, product_id)): Path<(i32, String)>,
        payload: Result<Json<ProductUpdate>, JsonRejection>,
    ) -> Response {
        let Json(update) = match payload {
            Ok(payload) => payload,
            Err(rejection) => return bad_request(rejection.body_text()),
        };

        match state
            .catalog
            .update_product(branch_id, &product_id, &update)
            .await
        {
            Ok(()) => message_ok("Product updated successfully"),
            Err(err) => error_response(err),
        }
    }

    async fn handle_admin_adjust_inventory(
        State(state): State<AppState>,
        Path((branch_id, product_id)): Path<(i32, String)>,
        payload: Result<Json<InventoryPayload>, JsonRejection>,
    ) -> Response {
        let Json(payload) = match payload {
            Ok(payload) => payload,
            Err(rejection) => return bad_request(rejection.body_text()),
        };

        match state
            .catalog
            .adjust_inventory(branch_id, &product_id, payload.new_quantity)
            .await
        {
            Ok(()) => message_ok(&format!(
                "Inventory of {product_id} set to {}",
                payload.new_quantity
            )),
            Err(err) => error_response(err),
        }
    }

    async fn handle_admin_set_status(
        State(state): State<AppState>,
        Path((branch_id, product_id)): Path<(i32, String)>,
        payload: Result<Json<StatusPayload>, JsonRejection>,
    ) -> Response {
        let Json(payload) = match payload {
            Ok(payload) => payload,
            Err(rejection) => return bad_request(rejection.body_text()),
        };

        match state
            .catalog
            .set_product_status(branch_id, &product_id, payload.is_active)
            .await
        {
            Ok(()) => {
                let action = if payload.is_active {
                    "activated"
                } else {
                    "retired"
                };
                message_ok(&format!("Product {product_id} {action} successfully"))
            }
            Err(err) => error_response(err),
        }
    }

    async fn handle_admin_list_users(State(state): State<AppState>) -> Response {
        json_or_error(state.accounts.list_users().await)
    }

    async fn handle_admin_update_user(
        State(state): State<AppState>,
        Path(username): Path<String>,
        payload: Result<Json<UserUpdate>, JsonRejection>,
    ) -> Response {
        let Json(update) = match payload {
            Ok(payload) => payload,
            Err(rejection) => return bad_request(rejection.body_text()),
        };

        match state.accounts.update_user(&username, &update).await {
            Ok(()) => message_ok("User updated successfully"),
            Err(err) => error_response(err),
        }
    }

    async fn handle_admin_delete_user(
        State(state): State<AppState>,
        Path(username): Path<String>,
    ) -> Response {
        match state.accounts.delete_user(&username).await {
            Ok(()) => message_ok("User deleted successfully"),
            Err(err) => error_response(err),
        }
    }

    async fn handle_health() -> &'static str {
        "OK"
    }

    async fn handle_metrics(State(state): State<AppState>) -> Response {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&state.metrics.registry.gather(), &mut buffer) {
            error!("Failed to encode metrics: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
                .into_response();
        }

        match String::from_utf8(buffer) {
            Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
            Err(e) => {
                error!("Failed to convert metrics to UTF-8: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Invalid metrics data").into_response()
            }
        }
    }
}

fn message_ok(message: &str) -> Response {
    (StatusCode::OK, Json(json!({"message": message}))).into_response()
}

fn bad_request(detail: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": detail}))).into_response()
}

fn json_or_error<T: serde::Serialize>(result: Result<T, ServiceError>) -> Response {
    match result {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(err) => error_response(err),
    }
}

/// Maps a service error to its HTTP shape. Store failures are logged here
/// and surfaced as a generic 500; expected failures keep their detail.
fn error_response(err: ServiceError) -> Response {
    match err {
        ServiceError::Validation(msg) => {
            (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response()
        }
        ServiceError::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not found"})),
        )
            .into_response(),
        ServiceError::InsufficientStock { available } => (
            StatusCode::CONFLICT,
            Json(json!({"error": "insufficient stock", "available": available})),
        )
            .into_response(),
        ServiceError::Duplicate => (
            StatusCode::CONFLICT,
            Json(json!({"error": "already exists"})),
        )
            .into_response(),
        ServiceError::Unauthorized => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid username or password"})),
        )
            .into_response(),
        ServiceError::Forbidden => (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "admin role required"})),
        )
            .into_response(),
        ServiceError::Db(e) => {
            error!("Storage error: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal server error"})),
            )
                .into_response()
        }
        ServiceError::Unexpected(msg) => {
            error!("Unexpected error: {}", msg);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal server error"})),
            )
                .into_response()
        }
    }
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (
                error_response(ServiceError::Validation("bad".into())),
                StatusCode::BAD_REQUEST,
            ),
            (error_response(ServiceError::NotFound), StatusCode::NOT_FOUND),
            (
                error_response(ServiceError::InsufficientStock { available: 2 }),
                StatusCode::CONFLICT,
            ),
            (error_response(ServiceError::Duplicate), StatusCode::CONFLICT),
            (
                error_response(ServiceError::Unauthorized),
                StatusCode::UNAUTHORIZED,
            ),
            (error_response(ServiceError::Forbidden), StatusCode::FORBIDDEN),
            (
                error_response(ServiceError::Unexpected("boom".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (response, expected) in cases {
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn test_inventory_payload_requires_number() {
        let ok: InventoryPayload = serde_json::from_str(r#"{"new_quantity": 5}"#).unwrap();
        assert_eq!(ok.new_quantity, 5);
        assert!(serde_json::from_str::<InventoryPayload>(r#"{"new_quantity": "5"}"#).is_err());
    }

    #[test]
    fn test_status_payload_requires_boolean() {
        let ok: StatusPayload = serde_json::from_str(r#"{"is_active": false}"#).unwrap();
        assert!(!ok.is_active);
        assert!(serde_json::from_str::<StatusPayload>(r#"{"is_active": "no"}"#).is_err());
    }
}
