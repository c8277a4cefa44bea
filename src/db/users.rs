//! User repository.
//!
//! Every call resolves the shard from the current routing marker; callers pick
//! the shard with [`ScopedExecutor::run`](crate::db::ScopedExecutor::run), never
//! by passing a pool. Shards with a cache binding get cache-aside reads.

use crate::db::cache::CacheHandle;
use crate::db::registry::{ResolvedShard, ShardRegistry};
use crate::error::{ShardError, ShardResult};
use crate::models::{NewUser, User};
use std::time::Duration;
use tracing::{debug, warn};

const CREATE_TABLE_SQLITE: &str = "CREATE TABLE IF NOT EXISTS users (\
    id INTEGER PRIMARY KEY AUTOINCREMENT, \
    name TEXT NOT NULL, \
    email TEXT NOT NULL)";
const CREATE_TABLE_POSTGRES: &str = "CREATE TABLE IF NOT EXISTS users (\
    id BIGSERIAL PRIMARY KEY, \
    name VARCHAR(255) NOT NULL, \
    email VARCHAR(255) NOT NULL)";
const CREATE_TABLE_MYSQL: &str = "CREATE TABLE IF NOT EXISTS users (\
    id BIGINT AUTO_INCREMENT PRIMARY KEY, \
    name VARCHAR(255) NOT NULL, \
    email VARCHAR(255) NOT NULL)";

type UserRow = (i64, String, String);

fn cache_key(id: i64) -> String {
    format!("user:{id}")
}

#[derive(Debug, Clone)]
pub struct UserRepository {
    registry: ShardRegistry,
    cache_ttl: Duration,
}

impl UserRepository {
    pub fn new(registry: ShardRegistry, cache_ttl: Duration) -> Self {
        Self {
            registry,
            cache_ttl,
        }
    }

    fn shard(&self) -> ShardResult<ResolvedShard> {
        self.registry.resolve_current()
    }

    /// Create the `users` table on the current shard if it is missing.
    pub async fn ensure_schema(&self) -> ShardResult<()> {
        let shard = self.shard()?;
        impl_db_dispatch!(&shard.pool, {
            Postgres(p) => sqlx::query(CREATE_TABLE_POSTGRES).execute(p).await.map(|_| ()),
            MySql(p) => sqlx::query(CREATE_TABLE_MYSQL).execute(p).await.map(|_| ()),
            Sqlite(p) => sqlx::query(CREATE_TABLE_SQLITE).execute(p).await.map(|_| ()),
        })?;
        debug!(shard = %shard.key, "User schema ensured");
        Ok(())
    }

    pub async fn create(&self, new_user: &NewUser) -> ShardResult<User> {
        new_user.validate()?;
        let shard = self.shard()?;

        let id: i64 = impl_db_dispatch!(&shard.pool, {
            Postgres(p) => sqlx::query_scalar::<_, i64>("INSERT INTO users (name, email) VALUES ($1, $2) RETURNING id")
                .bind(&new_user.name)
                .bind(&new_user.email)
                .fetch_one(p)
                .await?,
            MySql(p) => {
                let result = sqlx::query("INSERT INTO users (name, email) VALUES (?, ?)")
                    .bind(&new_user.name)
                    .bind(&new_user.email)
                    .execute(p)
                    .await?;
                i64::try_from(result.last_insert_id())
                    .map_err(|_| ShardError::internal("Inserted id does not fit in i64"))?
            },
            Sqlite(p) => sqlx::query("INSERT INTO users (name, email) VALUES (?, ?)")
                .bind(&new_user.name)
                .bind(&new_user.email)
                .execute(p)
                .await?
                .last_insert_rowid(),
        });

        let user = User {
            id,
            name: new_user.name.clone(),
            email: new_user.email.clone(),
        };
        debug!(shard = %shard.key, user_id = id, "User created");
        if let Some(cache) = &shard.cache {
            self.cache_put(cache, &user).await;
        }
        Ok(user)
    }

    /// All users on the current shard, ordered by id.
    pub async fn list(&self) -> ShardResult<Vec<User>> {
        let shard = self.shard()?;
        const SQL: &str = "SELECT id, name, email FROM users ORDER BY id";
        let rows: Vec<UserRow> = impl_db_dispatch!(&shard.pool, {
            Postgres(p) => sqlx::query_as(SQL).fetch_all(p).await?,
            MySql(p) => sqlx::query_as(SQL).fetch_all(p).await?,
            Sqlite(p) => sqlx::query_as(SQL).fetch_all(p).await?,
        });
        Ok(rows.into_iter().map(User::from).collect())
    }

    /// Look up one user, reading through the shard's cache when it has one.
    pub async fn find_by_id(&self, id: i64) -> ShardResult<User> {
        let shard = self.shard()?;

        if let Some(cache) = &shard.cache {
            if let Some(user) = self.cache_get(cache, id).await {
                debug!(shard = %shard.key, user_id = id, "User served from cache");
                return Ok(user);
            }
        }

        let user = fetch_user(&shard, id)
            .await?
            .ok_or_else(|| ShardError::not_found("user", id.to_string()))?;

        if let Some(cache) = &shard.cache {
            self.cache_put(cache, &user).await;
        }
        Ok(user)
    }

    pub async fn update(&self, id: i64, changes: &NewUser) -> ShardResult<User> {
        changes.validate()?;
        let shard = self.shard()?;

        let affected = impl_db_dispatch!(&shard.pool, {
            Postgres(p) => sqlx::query("UPDATE users SET name = $1, email = $2 WHERE id = $3")
                .bind(&changes.name)
                .bind(&changes.email)
                .bind(id)
                .execute(p)
                .await?
                .rows_affected(),
            MySql(p) => sqlx::query("UPDATE users SET name = ?, email = ? WHERE id = ?")
                .bind(&changes.name)
                .bind(&changes.email)
                .bind(id)
                .execute(p)
                .await?
                .rows_affected(),
            Sqlite(p) => sqlx::query("UPDATE users SET name = ?, email = ? WHERE id = ?")
                .bind(&changes.name)
                .bind(&changes.email)
                .bind(id)
                .execute(p)
                .await?
                .rows_affected(),
        });

        // MySQL counts only changed rows, so an unchanged update reports zero
        if affected == 0 && fetch_user(&shard, id).await?.is_none() {
            return Err(ShardError::not_found("user", id.to_string()));
        }

        let user = User {
            id,
            name: changes.name.clone(),
            email: changes.email.clone(),
        };
        if let Some(cache) = &shard.cache {
            self.cache_put(cache, &user).await;
        }
        Ok(user)
    }

    pub async fn delete(&self, id: i64) -> ShardResult<()> {
        let shard = self.shard()?;

        let affected = impl_db_dispatch!(&shard.pool, {
            Postgres(p) => sqlx::query("DELETE FROM users WHERE id = $1")
                .bind(id)
                .execute(p)
                .await?
                .rows_affected(),
            MySql(p) => sqlx::query("DELETE FROM users WHERE id = ?")
                .bind(id)
                .execute(p)
                .await?
                .rows_affected(),
            Sqlite(p) => sqlx::query("DELETE FROM users WHERE id = ?")
                .bind(id)
                .execute(p)
                .await?
                .rows_affected(),
        });

        if let Some(cache) = &shard.cache {
            if let Err(e) = cache.delete(&cache_key(id)).await {
                warn!(shard = %shard.key, user_id = id, error = %e, "Failed to evict cached user");
            }
        }

        if affected == 0 {
            return Err(ShardError::not_found("user", id.to_string()));
        }
        Ok(())
    }

    async fn cache_get(&self, cache: &CacheHandle, id: i64) -> Option<User> {
        match cache.get(&cache_key(id)).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(user) => Some(user),
                Err(e) => {
                    warn!(user_id = id, error = %e, "Discarding unreadable cached user");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(cache = %cache.endpoint(), user_id = id, error = %e, "Cache read failed");
                None
            }
        }
    }

    async fn cache_put(&self, cache: &CacheHandle, user: &User) {
        let json = match serde_json::to_string(user) {
            Ok(json) => json,
            Err(e) => {
                warn!(user_id = user.id, error = %e, "Failed to serialize user for cache");
                return;
            }
        };
        if let Err(e) = cache
            .set_with_ttl(&cache_key(user.id), &json, self.cache_ttl)
            .await
        {
            warn!(cache = %cache.endpoint(), user_id = user.id, error = %e, "Cache write failed");
        }
    }
}

async fn fetch_user(shard: &ResolvedShard, id: i64) -> ShardResult<Option<User>> {
    let row: Option<UserRow> = impl_db_dispatch!(&shard.pool, {
        Postgres(p) => sqlx::query_as("SELECT id, name, email FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(p)
            .await?,
        MySql(p) => sqlx::query_as("SELECT id, name, email FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(p)
            .await?,
        Sqlite(p) => sqlx::query_as("SELECT id, name, email FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(p)
            .await?,
    });
    Ok(row.map(User::from))
}
