use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::repo_types::{NewUser, ProfileImage, User};

/// Persistence for user records.
///
/// Writes touching a single field (`set_refresh_token`, `set_password_hash`)
/// do not re-validate the rest of the record.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Find a user whose username OR email matches. `None` filters are ignored.
    async fn find_by_username_or_email(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> anyhow::Result<Option<User>>;

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>>;

    async fn create(&self, new_user: NewUser) -> anyhow::Result<User>;

    /// Returns the updated record, `None` if the user is gone.
    async fn update_account_details(
        &self,
        id: Uuid,
        full_name: &str,
        email: &str,
    ) -> anyhow::Result<Option<User>>;

    async fn update_image(
        &self,
        id: Uuid,
        slot: ProfileImage,
        url: &str,
    ) -> anyhow::Result<Option<User>>;

    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> anyhow::Result<()>;

    /// Replace the stored refresh token only if it still equals `current`.
    /// Returns `false` when another write got there first.
    async fn swap_refresh_token(&self, id: Uuid, current: &str, next: &str)
        -> anyhow::Result<bool>;

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> anyhow::Result<()>;
}

const USER_COLUMNS: &str = "id, username, email, full_name, avatar, cover_image, \
                            password_hash, refresh_token, created_at, updated_at";

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_username_or_email(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            SELECT {USER_COLUMNS}
            FROM users
            WHERE ($1::text IS NOT NULL AND username = $1)
               OR ($2::text IS NOT NULL AND email = $2)
            LIMIT 1
            "#
        ))
        .bind(username)
        .bind(email)
        .fetch_optional(&self.db)
        .await
        .context("find user by username or email")?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .context("find user by id")?;
        Ok(user)
    }

    async fn create(&self, new_user: NewUser) -> anyhow::Result<User> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (id, username, email, full_name, avatar, cover_image, password_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&new_user.username)
        .bind(&new_user.email)
        .bind(&new_user.full_name)
        .bind(&new_user.avatar)
        .bind(&new_user.cover_image)
        .bind(&new_user.password_hash)
        .fetch_one(&self.db)
        .await
        .context("insert user")?;
        Ok(user)
    }

    async fn update_account_details(
        &self,
        id: Uuid,
        full_name: &str,
        email: &str,
    ) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users
               SET full_name = $2, email = $3, updated_at = now()
             WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(full_name)
        .bind(email)
        .fetch_optional(&self.db)
        .await
        .context("update account details")?;
        Ok(user)
    }

    async fn update_image(
        &self,
        id: Uuid,
        slot: ProfileImage,
        url: &str,
    ) -> anyhow::Result<Option<User>> {
        let column = match slot {
            ProfileImage::Avatar => "avatar",
            ProfileImage::CoverImage => "cover_image",
        };
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users
               SET {column} = $2, updated_at = now()
             WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(url)
        .fetch_optional(&self.db)
        .await
        .with_context(|| format!("update {column}"))?;
        Ok(user)
    }

    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> anyhow::Result<()> {
        sqlx::query("UPDATE users SET refresh_token = $2 WHERE id = $1")
            .bind(id)
            .bind(token)
            .execute(&self.db)
            .await
            .context("set refresh token")?;
        Ok(())
    }

    async fn swap_refresh_token(
        &self,
        id: Uuid,
        current: &str,
        next: &str,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "UPDATE users SET refresh_token = $3 WHERE id = $1 AND refresh_token = $2",
        )
        .bind(id)
        .bind(current)
        .bind(next)
        .execute(&self.db)
        .await
        .context("swap refresh token")?;
        Ok(res.rows_affected() == 1)
    }

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(password_hash)
            .execute(&self.db)
            .await
            .context("set password hash")?;
        Ok(())
    }
}

/// True when the error chain carries a Postgres unique-constraint violation.
pub fn is_unique_violation(e: &anyhow::Error) -> bool {
    e.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .is_some_and(|db| db.is_unique_violation())
}
