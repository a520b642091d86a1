//! In-process `UserStore` used by tests and `AppState::fake`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::repo::UserStore;
use super::repo_types::{NewUser, ProfileImage, User};

#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<Uuid, User>>,
    reject_creates: AtomicBool,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    /// Makes every later `create` fail, as if the database went away.
    pub fn reject_creates(&self) {
        self.reject_creates.store(true, Ordering::SeqCst);
    }

    /// Raw record, secrets included.
    pub async fn get(&self, id: Uuid) -> Option<User> {
        self.users.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_username_or_email(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> anyhow::Result<Option<User>> {
        let users = self.users.read().await;
        Ok(users
            .values()
            .find(|u| {
                username.is_some_and(|n| u.username == n) || email.is_some_and(|e| u.email == e)
            })
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn create(&self, new_user: NewUser) -> anyhow::Result<User> {
        anyhow::ensure!(
            !self.reject_creates.load(Ordering::SeqCst),
            "connection refused"
        );
        let mut users = self.users.write().await;
        anyhow::ensure!(
            !users
                .values()
                .any(|u| u.username == new_user.username || u.email == new_user.email),
            "duplicate key value violates unique constraint"
        );
        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            username: new_user.username,
            email: new_user.email,
            full_name: new_user.full_name,
            avatar: new_user.avatar,
            cover_image: new_user.cover_image,
            password_hash: new_user.password_hash,
            refresh_token: None,
            created_at: now,
            updated_at: now,
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn update_account_details(
        &self,
        id: Uuid,
        full_name: &str,
        email: &str,
    ) -> anyhow::Result<Option<User>> {
        let mut users = self.users.write().await;
        Ok(users.get_mut(&id).map(|u| {
            u.full_name = full_name.to_string();
            u.email = email.to_string();
            u.updated_at = OffsetDateTime::now_utc();
            u.clone()
        }))
    }

    async fn update_image(
        &self,
        id: Uuid,
        slot: ProfileImage,
        url: &str,
    ) -> anyhow::Result<Option<User>> {
        let mut users = self.users.write().await;
        Ok(users.get_mut(&id).map(|u| {
            match slot {
                ProfileImage::Avatar => u.avatar = url.to_string(),
                ProfileImage::CoverImage => u.cover_image = Some(url.to_string()),
            }
            u.updated_at = OffsetDateTime::now_utc();
            u.clone()
        }))
    }

    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> anyhow::Result<()> {
        if let Some(u) = self.users.write().await.get_mut(&id) {
            u.refresh_token = token.map(str::to_string);
        }
        Ok(())
    }

    async fn swap_refresh_token(
        &self,
        id: Uuid,
        current: &str,
        next: &str,
    ) -> anyhow::Result<bool> {
        let mut users = self.users.write().await;
        match users.get_mut(&id) {
            Some(u) if u.refresh_token.as_deref() == Some(current) => {
                u.refresh_token = Some(next.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> anyhow::Result<()> {
        if let Some(u) = self.users.write().await.get_mut(&id) {
            u.password_hash = password_hash.to_string();
            u.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(username: &str, email: &str) -> NewUser {
        NewUser {
            username: username.into(),
            email: email.into(),
            full_name: "Test User".into(),
            avatar: "https://cdn/a.png".into(),
            cover_image: None,
            password_hash: "hash".into(),
        }
    }

    #[tokio::test]
    async fn finds_by_either_field() {
        let store = MemoryUserStore::new();
        let user = store.create(new_user("bob", "bob@x.com")).await.unwrap();

        let by_name = store.find_by_username_or_email(Some("bob"), None).await.unwrap();
        let by_mail = store
            .find_by_username_or_email(Some("nobody"), Some("bob@x.com"))
            .await
            .unwrap();
        let neither = store.find_by_username_or_email(None, None).await.unwrap();

        assert_eq!(by_name.unwrap().id, user.id);
        assert_eq!(by_mail.unwrap().id, user.id);
        assert!(neither.is_none());
    }

    #[tokio::test]
    async fn rejects_duplicate_keys() {
        let store = MemoryUserStore::new();
        store.create(new_user("bob", "bob@x.com")).await.unwrap();
        assert!(store.create(new_user("bob", "other@x.com")).await.is_err());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn swap_only_succeeds_against_current_value() {
        let store = MemoryUserStore::new();
        let user = store.create(new_user("bob", "bob@x.com")).await.unwrap();
        store.set_refresh_token(user.id, Some("t1")).await.unwrap();

        assert!(!store.swap_refresh_token(user.id, "stale", "t2").await.unwrap());
        assert!(store.swap_refresh_token(user.id, "t1", "t2").await.unwrap());
        assert!(!store.swap_refresh_token(user.id, "t1", "t3").await.unwrap());
        assert_eq!(store.get(user.id).await.unwrap().refresh_token.as_deref(), Some("t2"));
    }
}
