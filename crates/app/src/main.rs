/// Cafeteria Ordering Backend
///
/// Entry point for the multi-branch cafeteria ordering service. The
/// application exposes REST API endpoints for browsing branch menus,
/// placing orders against live inventory, and administering products
/// and user accounts.
///
/// # Architecture
///
/// - Repository layer for data access
/// - Service layer for business logic
/// - HTTP layer for the API surface
/// - Metrics for monitoring
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use app_config::AppConfig;
use repository::{PgOrdersRepository, PgProductsRepository, PgUsersRepository};
use server::Server;
use service::{AccountServiceImpl, CatalogServiceImpl, OrderServiceImpl};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("Cafeteria ordering backend starting...");

    let config = AppConfig::load().context("Failed to load configuration")?;

    let db_pool = match db::init_db_pool(&config).await {
        Ok(pool) => {
            info!("Database initialized successfully");
            pool
        }
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            error!("Database connection is required for application to function properly");
            return Err(anyhow::anyhow!("Failed to initialize database"));
        }
    };

    let products_repo = Arc::new(PgProductsRepository::new(db_pool.clone()));
    let orders_repo = Arc::new(PgOrdersRepository::new(db_pool.clone()));
    let users_repo = Arc::new(PgUsersRepository::new(db_pool));

    let order_service = Arc::new(OrderServiceImpl::new(
        products_repo.clone(),
        orders_repo,
    ));
    let catalog_service = Arc::new(CatalogServiceImpl::new(products_repo));
    let account_service = Arc::new(AccountServiceImpl::new(users_repo));

    let http_server = Server::new(
        config.http_port,
        order_service,
        catalog_service,
        account_service,
    );
    http_server.start().await?;

    info!("Application stopped");
    Ok(())
}
