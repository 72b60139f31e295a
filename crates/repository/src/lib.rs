//! # Data Repository Layer
//!
//! Repository traits and PostgreSQL implementations for the three stores:
//! products per branch, the append-only order log, and user accounts.
//! Implementations draw connections from a shared deadpool pool that is
//! injected at construction time; nothing here holds process-wide state.

use async_trait::async_trait;
use deadpool_postgres::{Pool, PoolError};
use model::{OrderLine, Product, ProductUpdate, StoredUser, UserAccount, UserUpdate};
use thiserror::Error;
use tokio_postgres::Row;

/// # RepositoryError
///
/// Error conditions that can arise when interacting with the storage layer.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database-related errors, wrapping the underlying PostgreSQL error
    #[error("Database error: {0}")]
    Db(#[from] tokio_postgres::Error),
    /// Failed to obtain a connection from the pool.
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
    /// No matching row.
    #[error("Not found")]
    NotFound,
    /// A unique key already exists (e.g. registration with a taken username).
    #[error("Duplicate key")]
    Duplicate,
}

/// # ProductsRepository
///
/// Store contract for the per-branch product catalog, keyed by
/// (branch_id, product_id). Covers the two operations the order flow
/// depends on (`get_quantity`, `set_quantity`) plus listings and the
/// administrative CRUD.
///
/// `set_quantity` is a plain overwrite: there is no compare-and-swap here,
/// and callers running a read-check-write sequence are not protected
/// against concurrent writers on the same key.
#[async_trait]
pub trait ProductsRepository: Send + Sync {
    /// Current stock for one product, or `NotFound`.
    async fn get_quantity(&self, branch_id: i32, product_id: &str) -> Result<i32, RepositoryError>;

    /// Overwrite the stock count for one product.
    async fn set_quantity(
        &self,
        branch_id: i32,
        product_id: &str,
        quantity: i32,
    ) -> Result<(), RepositoryError>;

    /// One product row, including inactive ones (admin view).
    async fn get(&self, branch_id: i32, product_id: &str) -> Result<Product, RepositoryError>;

    /// Active, in-stock products of one branch (public view).
    async fn list_available(&self, branch_id: i32) -> Result<Vec<Product>, RepositoryError>;

    /// Every product of one branch, including inactive ones (admin view).
    async fn list_all(&self, branch_id: i32) -> Result<Vec<Product>, RepositoryError>;

    /// Active, in-stock rows across all branches. Deduplication by product_id
    /// is the caller's concern.
    async fn list_available_all_branches(&self) -> Result<Vec<Product>, RepositoryError>;

    /// Every row across all branches, no filters.
    async fn list_all_branches(&self) -> Result<Vec<Product>, RepositoryError>;

    /// Create a product row (always created active). Fails with `Duplicate`
    /// when the (branch, product) key already exists.
    async fn insert(&self, product: &Product) -> Result<(), RepositoryError>;

    /// Update name/category/description/price. Stock and the active flag are
    /// untouched.
    async fn update_details(
        &self,
        branch_id: i32,
        product_id: &str,
        update: &ProductUpdate,
    ) -> Result<(), RepositoryError>;

    /// Activate or retire a product.
    async fn set_active(
        &self,
        branch_id: i32,
        product_id: &str,
        is_active: bool,
    ) -> Result<(), RepositoryError>;
}

/// # OrdersRepository
///
/// Store contract for the append-only order log, keyed by
/// (branch_id, time-ordered order_id). Records are never updated or deleted.
#[async_trait]
pub trait OrdersRepository: Send + Sync {
    /// Append one order line.
    async fn append(&self, line: &OrderLine) -> Result<(), RepositoryError>;

    /// Order lines of one branch, newest first.
    async fn list_by_branch(
        &self,
        branch_id: i32,
        limit: i64,
    ) -> Result<Vec<OrderLine>, RepositoryError>;

    /// Order lines matching a product name, across branches.
    async fn list_by_product(
        &self,
        product_name: &str,
        limit: i64,
    ) -> Result<Vec<OrderLine>, RepositoryError>;

    /// Distinct branch ids that have orders, ascending.
    async fn branches(&self) -> Result<Vec<i32>, RepositoryError>;
}

/// # UsersRepository
///
/// Store contract for user accounts, keyed by globally unique username.
#[async_trait]
pub trait UsersRepository: Send + Sync {
    /// Account plus credential hash, or `NotFound`.
    async fn find_by_username(&self, username: &str) -> Result<StoredUser, RepositoryError>;

    /// Create an account. Fails with `Duplicate` when the username is taken;
    /// callers must be able to tell this apart from other failures.
    async fn insert(&self, user: &StoredUser) -> Result<(), RepositoryError>;

    /// All accounts, without credential hashes.
    async fn list(&self) -> Result<Vec<UserAccount>, RepositoryError>;

    /// Update full name, role, and assigned branch of an account.
    async fn update(&self, username: &str, update: &UserUpdate) -> Result<(), RepositoryError>;

    /// Remove an account.
    async fn delete(&self, username: &str) -> Result<(), RepositoryError>;
}

const PRODUCT_COLUMNS: &str =
    "branch_id, product_id, name, category, description, unit_price, quantity_available, is_active";

fn product_from_row(row: &Row) -> Product {
    Product {
        branch_id: row.get("branch_id"),
        product_id: row.get("product_id"),
        name: row.get("name"),
        category: row.get("category"),
        description: row.get("description"),
        unit_price: row.get("unit_price"),
        quantity_available: row.get("quantity_available"),
        is_active: row.get("is_active"),
    }
}

/// PostgreSQL implementation of [`ProductsRepository`].
pub struct PgProductsRepository {
    pool: Pool,
}

impl PgProductsRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProductsRepository for PgProductsRepository {
    async fn get_quantity(&self, branch_id: i32, product_id: &str) -> Result<i32, RepositoryError> {
        let conn = self.pool.get().await?;
        let query = "SELECT quantity_available FROM products WHERE branch_id = $1 AND product_id = $2";
        let row = conn.query_opt(query, &[&branch_id, &product_id]).await?;
        match row {
            Some(row) => Ok(row.get("quantity_available")),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn set_quantity(
        &self,
        branch_id: i32,
        product_id: &str,
        quantity: i32,
    ) -> Result<(), RepositoryError> {
        let conn = self.pool.get().await?;
        let query =
            "UPDATE products SET quantity_available = $1 WHERE branch_id = $2 AND product_id = $3";
        let updated = conn
            .execute(query, &[&quantity, &branch_id, &product_id])
            .await?;
        if updated == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get(&self, branch_id: i32, product_id: &str) -> Result<Product, RepositoryError> {
        let conn = self.pool.get().await?;
        let query = format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE branch_id = $1 AND product_id = $2"
        );
        let row = conn.query_opt(&query, &[&branch_id, &product_id]).await?;
        match row {
            Some(row) => Ok(product_from_row(&row)),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_available(&self, branch_id: i32) -> Result<Vec<Product>, RepositoryError> {
        let conn = self.pool.get().await?;
        let query = format!(
            "SELECT {PRODUCT_COLUMNS} FROM products \
             WHERE branch_id = $1 AND is_active AND quantity_available > 0 \
             ORDER BY product_id"
        );
        let rows = conn.query(&query, &[&branch_id]).await?;
        Ok(rows.iter().map(product_from_row).collect())
    }

    async fn list_all(&self, branch_id: i32) -> Result<Vec<Product>, RepositoryError> {
        let conn = self.pool.get().await?;
        let query = format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE branch_id = $1 ORDER BY product_id"
        );
        let rows = conn.query(&query, &[&branch_id]).await?;
        Ok(rows.iter().map(product_from_row).collect())
    }

    async fn list_available_all_branches(&self) -> Result<Vec<Product>, RepositoryError> {
        let conn = self.pool.get().await?;
        let query = format!(
            "SELECT {PRODUCT_COLUMNS} FROM products \
             WHERE is_active AND quantity_available > 0 \
             ORDER BY product_id, branch_id"
        );
        let rows = conn.query(&query, &[]).await?;
        Ok(rows.iter().map(product_from_row).collect())
    }

    async fn list_all_branches(&self) -> Result<Vec<Product>, RepositoryError> {
        let conn = self.pool.get().await?;
        let query =
            format!("SELECT {PRODUCT_COLUMNS} FROM products ORDER BY product_id, branch_id");
        let rows = conn.query(&query, &[]).await?;
        Ok(rows.iter().map(product_from_row).collect())
    }

    async fn insert(&self, product: &Product) -> Result<(), RepositoryError> {
        let conn = self.pool.get().await?;
        let query = r#"
            INSERT INTO products (branch_id, product_id, name, category, description, unit_price, quantity_available, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (branch_id, product_id) DO NOTHING
        "#;
        let inserted = conn
            .execute(
                query,
                &[
                    &product.branch_id,
                    &product.product_id,
                    &product.name,
                    &product.category,
                    &product.description,
                    &product.unit_price,
                    &product.quantity_available,
                    &product.is_active,
                ],
            )
            .await?;
        if inserted == 0 {
            return Err(RepositoryError::Duplicate);
        }
        Ok(())
    }

    async fn update_details(
        &self,
        branch_id: i32,
        product_id: &str,
        update: &ProductUpdate,
    ) -> Result<(), RepositoryError> {
        let conn = self.pool.get().await?;
        let query = r#"
            UPDATE products
            SET name = $1, category = $2, description = $3, unit_price = $4
            WHERE branch_id = $5 AND product_id = $6
        "#;
        let updated = conn
            .execute(
                query,
                &[
                    &update.name,
                    &update.category,
                    &update.description,
                    &update.unit_price,
                    &branch_id,
                    &product_id,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn set_active(
        &self,
        branch_id: i32,
        product_id: &str,
        is_active: bool,
    ) -> Result<(), RepositoryError> {
        let conn = self.pool.get().await?;
        let query = "UPDATE products SET is_active = $1 WHERE branch_id = $2 AND product_id = $3";
        let updated = conn
            .execute(query, &[&is_active, &branch_id, &product_id])
            .await?;
        if updated == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}

const ORDER_COLUMNS: &str =
    "branch_id, order_id, placed_at, product_name, category, quantity, unit_price, total, username";

fn order_from_row(row: &Row) -> OrderLine {
    OrderLine {
        branch_id: row.get("branch_id"),
        order_id: row.get("order_id"),
        placed_at: row.get("placed_at"),
        product_name: row.get("product_name"),
        category: row.get("category"),
        quantity: row.get("quantity"),
        unit_price: row.get("unit_price"),
        total: row.get("total"),
        username: row.get("username"),
    }
}

/// PostgreSQL implementation of [`OrdersRepository`].
pub struct PgOrdersRepository {
    pool: Pool,
}

impl PgOrdersRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrdersRepository for PgOrdersRepository {
    async fn append(&self, line: &OrderLine) -> Result<(), RepositoryError> {
        let conn = self.pool.get().await?;
        let query = r#"
            INSERT INTO orders (branch_id, order_id, placed_at, product_name, category, quantity, unit_price, total, username)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#;
        conn.execute(
            query,
            &[
                &line.branch_id,
                &line.order_id,
                &line.placed_at,
                &line.product_name,
                &line.category,
                &line.quantity,
                &line.unit_price,
                &line.total,
                &line.username,
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_by_branch(
        &self,
        branch_id: i32,
        limit: i64,
    ) -> Result<Vec<OrderLine>, RepositoryError> {
        let conn = self.pool.get().await?;
        let query = format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE branch_id = $1 ORDER BY placed_at DESC LIMIT $2"
        );
        let rows = conn.query(&query, &[&branch_id, &limit]).await?;
        Ok(rows.iter().map(order_from_row).collect())
    }

    async fn list_by_product(
        &self,
        product_name: &str,
        limit: i64,
    ) -> Result<Vec<OrderLine>, RepositoryError> {
        let conn = self.pool.get().await?;
        let query = format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE product_name = $1 ORDER BY placed_at DESC LIMIT $2"
        );
        let rows = conn.query(&query, &[&product_name, &limit]).await?;
        Ok(rows.iter().map(order_from_row).collect())
    }

    async fn branches(&self) -> Result<Vec<i32>, RepositoryError> {
        let conn = self.pool.get().await?;
        let query = "SELECT DISTINCT branch_id FROM orders ORDER BY branch_id";
        let rows = conn.query(query, &[]).await?;
        Ok(rows.iter().map(|r| r.get("branch_id")).collect())
    }
}

/// PostgreSQL implementation of [`UsersRepository`].
pub struct PgUsersRepository {
    pool: Pool,
}

impl PgUsersRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsersRepository for PgUsersRepository {
    async fn find_by_username(&self, username: &str) -> Result<StoredUser, RepositoryError> {
        let conn = self.pool.get().await?;
        let query = r#"
            SELECT username, full_name, password_hash, role, assigned_branch
            FROM users WHERE username = $1
        "#;
        let row = conn.query_opt(query, &[&username]).await?;
        match row {
            Some(row) => Ok(StoredUser {
                account: UserAccount {
                    username: row.get("username"),
                    full_name: row.get("full_name"),
                    role: row.get("role"),
                    assigned_branch: row.get("assigned_branch"),
                },
                password_hash: row.get("password_hash"),
            }),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn insert(&self, user: &StoredUser) -> Result<(), RepositoryError> {
        let conn = self.pool.get().await?;
        let query = r#"
            INSERT INTO users (username, full_name, password_hash, role, assigned_branch)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (username) DO NOTHING
        "#;
        let inserted = conn
            .execute(
                query,
                &[
                    &user.account.username,
                    &user.account.full_name,
                    &user.password_hash,
                    &user.account.role,
                    &user.account.assigned_branch,
                ],
            )
            .await?;
        if inserted == 0 {
            return Err(RepositoryError::Duplicate);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<UserAccount>, RepositoryError> {
        let conn = self.pool.get().await?;
        let query =
            "SELECT username, full_name, role, assigned_branch FROM users ORDER BY username";
        let rows = conn.query(query, &[]).await?;
        Ok(rows
            .iter()
            .map(|row| UserAccount {
                username: row.get("username"),
                full_name: row.get("full_name"),
                role: row.get("role"),
                assigned_branch: row.get("assigned_branch"),
            })
            .collect())
    }

    async fn update(&self, username: &str, update: &UserUpdate) -> Result<(), RepositoryError> {
        let conn = self.pool.get().await?;
        let query = r#"
            UPDATE users
            SET full_name = $1, role = $2, assigned_branch = $3
            WHERE username = $4
        "#;
        let updated = conn
            .execute(
                query,
                &[
                    &update.full_name,
                    &update.role,
                    &update.assigned_branch,
                    &username,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, username: &str) -> Result<(), RepositoryError> {
        let conn = self.pool.get().await?;
        let deleted = conn
            .execute("DELETE FROM users WHERE username = $1", &[&username])
            .await?;
        if deleted == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}

// Delegating impls so repositories can be shared behind an Arc between
// services without re-opening a pool handle per consumer.

#[async_trait]
impl<T: ProductsRepository + ?Sized> ProductsRepository for std::sync::Arc<T> {
    async fn get_quantity(&self, branch_id: i32, product_id: &str) -> Result<i32, RepositoryError> {
        (**self).get_quantity(branch_id, product_id).await
    }

    async fn set_quantity(
        &self,
        branch_id: i32,
        product_id: &str,
        quantity: i32,
    ) -> Result<(), RepositoryError> {
        (**self).set_quantity(branch_id, product_id, quantity).await
    }

    async fn get(&self, branch_id: i32, product_id: &str) -> Result<Product, RepositoryError> {
        (**self).get(branch_id, product_id).await
    }

    async fn list_available(&self, branch_id: i32) -> Result<Vec<Product>, RepositoryError> {
        (**self).list_available(branch_id).await
    }

    async fn list_all(&self, branch_id: i32) -> Result<Vec<Product>, RepositoryError> {
        (**self).list_all(branch_id).await
    }

    async fn list_available_all_branches(&self) -> Result<Vec<Product>, RepositoryError> {
        (**self).list_available_all_branches().await
    }

    async fn list_all_branches(&self) -> Result<Vec<Product>, RepositoryError> {
        (**self).list_all_branches().await
    }

    async fn insert(&self, product: &Product) -> Result<(), RepositoryError> {
        (**self).insert(product).await
    }

    async fn update_details(
        &self,
        branch_id: i32,
        product_id: &str,
        update: &ProductUpdate,
    ) -> Result<(), RepositoryError> {
        (**self).update_details(branch_id, product_id, update).await
    }

    async fn set_active(
        &self,
        branch_id: i32,
        product_id: &str,
        is_active: bool,
    ) -> Result<(), RepositoryError> {
        (**self).set_active(branch_id, product_id, is_active).await
    }
}

#[async_trait]
impl<T: OrdersRepository + ?Sized> OrdersRepository for std::sync::Arc<T> {
    async fn append(&self, line: &OrderLine) -> Result<(), RepositoryError> {
        (**self).append(line).await
    }

    async fn list_by_branch(
        &self,
        branch_id: i32,
        limit: i64,
    ) -> Result<Vec<OrderLine>, RepositoryError> {
        (**self).list_by_branch(branch_id, limit).await
    }

    async fn list_by_product(
        &self,
        product_name: &str,
        limit: i64,
    ) -> Result<Vec<OrderLine>, RepositoryError> {
        (**self).list_by_product(product_name, limit).await
    }

    async fn branches(&self) -> Result<Vec<i32>, RepositoryError> {
        (**self).branches().await
    }
}

#[async_trait]
impl<T: UsersRepository + ?Sized> UsersRepository for std::sync::Arc<T> {
    async fn find_by_username(&self, username: &str) -> Result<StoredUser, RepositoryError> {
        (**self).find_by_username(username).await
    }

    async fn insert(&self, user: &StoredUser) -> Result<(), RepositoryError> {
        (**self).insert(user).await
    }

    async fn list(&self) -> Result<Vec<UserAccount>, RepositoryError> {
        (**self).list().await
    }

    async fn update(&self, username: &str, update: &UserUpdate) -> Result<(), RepositoryError> {
        (**self).update(username, update).await
    }

    async fn delete(&self, username: &str) -> Result<(), RepositoryError> {
        (**self).delete(username).await
    }
}
