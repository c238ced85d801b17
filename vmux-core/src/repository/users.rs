//! The `users` table: `id, username, password, email, roles (JSON array),
//! active, created_at, updated_at`. This is the only state the core
//! persists in its own store; everything else is in memory or owned by the
//! hypervisor/container engine.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::FromRow;

use crate::database::DbPool;
use crate::error::{Error, Result};
use crate::model::User;

#[derive(Debug, FromRow)]
struct UserRow {
    id: String,
    username: String,
    password: String,
    email: String,
    roles: String,
    active: bool,
    #[allow(dead_code)]
    created_at: chrono::DateTime<Utc>,
    #[allow(dead_code)]
    updated_at: chrono::DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = Error;

    fn try_from(row: UserRow) -> Result<Self> {
        let roles: Vec<String> = serde_json::from_str(&row.roles)
            .map_err(|e| Error::Internal(format!("corrupt roles column for user '{}': {e}", row.id)))?;
        Ok(User {
            id: row.id,
            username: row.username,
            email: row.email,
            roles,
            active: row.active,
            password_hash: row.password,
        })
    }
}

/// Lookup and provisioning operations on the user store.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>>;
    async fn find_by_id(&self, id: &str) -> Result<Option<User>>;
    async fn create(&self, user: &User) -> Result<()>;
    async fn set_active(&self, id: &str, active: bool) -> Result<()>;
    async fn list(&self) -> Result<Vec<User>>;
}

pub struct SqlUserRepository {
    pool: DbPool,
}

impl SqlUserRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for SqlUserRepository {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        let row: Option<UserRow> = match &self.pool {
            DbPool::Sqlite(pool) => {
                sqlx::query_as("SELECT id, username, password, email, roles, active, created_at, updated_at FROM users WHERE username = ?")
                    .bind(username)
                    .fetch_optional(pool)
                    .await?
            }
            DbPool::Postgres(pool) => {
                sqlx::query_as("SELECT id, username, password, email, roles, active, created_at, updated_at FROM users WHERE username = $1")
                    .bind(username)
                    .fetch_optional(pool)
                    .await?
            }
        };
        row.map(User::try_from).transpose()
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<User>> {
        let row: Option<UserRow> = match &self.pool {
            DbPool::Sqlite(pool) => {
                sqlx::query_as("SELECT id, username, password, email, roles, active, created_at, updated_at FROM users WHERE id = ?")
                    .bind(id)
                    .fetch_optional(pool)
                    .await?
            }
            DbPool::Postgres(pool) => {
                sqlx::query_as("SELECT id, username, password, email, roles, active, created_at, updated_at FROM users WHERE id = $1")
                    .bind(id)
                    .fetch_optional(pool)
                    .await?
            }
        };
        row.map(User::try_from).transpose()
    }

    async fn create(&self, user: &User) -> Result<()> {
        let roles = serde_json::to_string(&user.roles)
            .map_err(|e| Error::Internal(format!("failed to serialize roles: {e}")))?;
        let now = Utc::now();
        match &self.pool {
            DbPool::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO users (id, username, password, email, roles, active, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&user.id)
                .bind(&user.username)
                .bind(&user.password_hash)
                .bind(&user.email)
                .bind(&roles)
                .bind(user.active)
                .bind(now)
                .bind(now)
                .execute(pool)
                .await
            }
            DbPool::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO users (id, username, password, email, roles, active, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                )
                .bind(&user.id)
                .bind(&user.username)
                .bind(&user.password_hash)
                .bind(&user.email)
                .bind(&roles)
                .bind(user.active)
                .bind(now)
                .bind(now)
                .execute(pool)
                .await
            }
        }
        .map_err(|e| match e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Error::AlreadyExists(format!("user '{}' already exists", user.username))
            }
            other => other.into(),
        })?;
        Ok(())
    }

    async fn set_active(&self, id: &str, active: bool) -> Result<()> {
        let now = Utc::now();
        let affected = match &self.pool {
            DbPool::Sqlite(pool) => {
                sqlx::query("UPDATE users SET active = ?, updated_at = ? WHERE id = ?")
                    .bind(active)
                    .bind(now)
                    .bind(id)
                    .execute(pool)
                    .await?
                    .rows_affected()
            }
            DbPool::Postgres(pool) => {
                sqlx::query("UPDATE users SET active = $1, updated_at = $2 WHERE id = $3")
                    .bind(active)
                    .bind(now)
                    .bind(id)
                    .execute(pool)
                    .await?
                    .rows_affected()
            }
        };
        if affected == 0 {
            return Err(Error::NotFound(format!("user '{id}' not found")));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<User>> {
        let rows: Vec<UserRow> = match &self.pool {
            DbPool::Sqlite(pool) => {
                sqlx::query_as("SELECT id, username, password, email, roles, active, created_at, updated_at FROM users ORDER BY username")
                    .fetch_all(pool)
                    .await?
            }
            DbPool::Postgres(pool) => {
                sqlx::query_as("SELECT id, username, password, email, roles, active, created_at, updated_at FROM users ORDER BY username")
                    .fetch_all(pool)
                    .await?
            }
        };
        rows.into_iter().map(User::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;

    async fn repo() -> SqlUserRepository {
        let config = DatabaseConfig {
            driver: "sqlite".into(),
            url: "sqlite::memory:".into(),
            max_connections: 1,
            connection_timeout_secs: 5,
            max_retries: 0,
            retry_delay_secs: 1,
        };
        let pool = DbPool::connect(&config).await.expect("connect");
        pool.migrate().await.expect("migrate");
        SqlUserRepository::new(pool)
    }

    fn sample_user() -> User {
        User {
            id: "u-1".into(),
            username: "alice".into(),
            email: "alice@example.com".into(),
            roles: vec!["admin".into()],
            active: true,
            password_hash: "hash".into(),
        }
    }

    #[tokio::test]
    async fn create_then_find_by_username_round_trips() {
        let repo = repo().await;
        repo.create(&sample_user()).await.unwrap();
        let found = repo.find_by_username("alice").await.unwrap().expect("user present");
        assert_eq!(found.id, "u-1");
        assert_eq!(found.roles, vec!["admin"]);
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let repo = repo().await;
        repo.create(&sample_user()).await.unwrap();
        let err = repo.create(&sample_user()).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn set_active_on_unknown_user_is_not_found() {
        let repo = repo().await;
        let err = repo.set_active("missing", false).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn list_returns_all_users_sorted() {
        let repo = repo().await;
        repo.create(&sample_user()).await.unwrap();
        let users = repo.list().await.unwrap();
        assert_eq!(users.len(), 1);
    }
}
