use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{Role, User, UserStatus};
use crate::roles::{assert_permission, Permission};
use crate::store::{BlobStore, USERS_KEY};

/// Working set of users, write-through to the blob store on every
/// successful mutation.
pub struct UserRegistry {
    store: Arc<dyn BlobStore>,
    users: RwLock<Vec<User>>,
}

impl UserRegistry {
    pub async fn load(store: Arc<dyn BlobStore>) -> Result<Self> {
        let users: Vec<User> = match store.read(USERS_KEY).await? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };

        Ok(UserRegistry {
            store,
            users: RwLock::new(users),
        })
    }

    /// A fresh deployment has nobody who could grant roles, so the first
    /// start seeds a single owner account.
    pub async fn ensure_owner(&self) -> Result<()> {
        let mut users = self.users.write().await;
        if !users.is_empty() {
            return Ok(());
        }

        let owner = User {
            id: Uuid::new_v4().to_string(),
            name: "Site Owner".to_string(),
            email: "owner@example.com".to_string(),
            status: UserStatus::Active,
            role: Role::Owner,
            registration_date: Utc::now(),
            library_count: 0,
        };
        log::info!("seeding initial owner account {}", owner.email);
        users.push(owner);
        self.persist(&users).await
    }

    async fn persist(&self, users: &[User]) -> Result<()> {
        let raw = serde_json::to_string(users)?;
        self.store.write(USERS_KEY, &raw).await
    }

    pub async fn list(&self) -> Vec<User> {
        self.users.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<User> {
        self.users.read().await.iter().find(|u| u.id == id).cloned()
    }

    /// Case-insensitive substring match on name and email; an empty or
    /// whitespace query returns the full list in insertion order.
    pub async fn search(&self, query: &str) -> Vec<User> {
        let users = self.users.read().await;
        let query = query.trim();
        if query.is_empty() {
            return users.clone();
        }

        let needle = query.to_lowercase();
        users
            .iter()
            .filter(|u| {
                u.name.to_lowercase().contains(&needle) || u.email.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect()
    }

    pub async fn create(&self, actor: Role, name: &str, email: &str, role: Role) -> Result<User> {
        assert_permission(actor, Permission::ManageUsers)?;
        validate_identity(name, email)?;

        let mut users = self.users.write().await;
        ensure_unique_email(&users, email, None)?;

        let user = User {
            id: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            email: email.trim().to_string(),
            status: UserStatus::Active,
            role,
            registration_date: Utc::now(),
            library_count: 0,
        };
        users.push(user.clone());
        self.persist(&users).await?;
        Ok(user)
    }

    pub async fn update(
        &self,
        actor: Role,
        id: &str,
        name: &str,
        email: &str,
        status: Option<UserStatus>,
    ) -> Result<User> {
        assert_permission(actor, Permission::ManageUsers)?;
        validate_identity(name, email)?;

        let mut users = self.users.write().await;
        ensure_unique_email(&users, email, Some(id))?;

        let user = users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or_else(|| AppError::NotFound(format!("user {id}")))?;
        user.name = name.trim().to_string();
        user.email = email.trim().to_string();
        if let Some(status) = status {
            user.status = status;
        }
        let updated = user.clone();

        self.persist(&users).await?;
        Ok(updated)
    }

    /// active <-> inactive; a pending account only ever moves forward to
    /// active, nothing toggles back to pending.
    pub async fn toggle_status(&self, actor: Role, id: &str) -> Result<User> {
        assert_permission(actor, Permission::ManageUsers)?;

        let mut users = self.users.write().await;
        let user = users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or_else(|| AppError::NotFound(format!("user {id}")))?;
        user.status = match user.status {
            UserStatus::Active => UserStatus::Inactive,
            UserStatus::Inactive | UserStatus::Pending => UserStatus::Active,
        };
        let updated = user.clone();

        self.persist(&users).await?;
        Ok(updated)
    }

    pub async fn update_role(&self, actor: Role, id: &str, new_role: Role) -> Result<User> {
        assert_permission(actor, Permission::ManageRoles)?;

        let mut users = self.users.write().await;
        let user = users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or_else(|| AppError::NotFound(format!("user {id}")))?;
        user.role = new_role;
        let updated = user.clone();

        self.persist(&users).await?;
        Ok(updated)
    }

    pub async fn delete(&self, actor: Role, id: &str) -> Result<()> {
        assert_permission(actor, Permission::ManageUsers)?;

        let mut users = self.users.write().await;
        let position = users
            .iter()
            .position(|u| u.id == id)
            .ok_or_else(|| AppError::NotFound(format!("user {id}")))?;
        users.remove(position);

        self.persist(&users).await
    }

    /// Bookkeeping for the denormalized libraryCount column.
    pub async fn adjust_library_count(&self, owner_email: &str, delta: i64) -> Result<()> {
        let mut users = self.users.write().await;
        let Some(user) = users
            .iter_mut()
            .find(|u| u.email.eq_ignore_ascii_case(owner_email))
        else {
            // Library ownership is by convention; an unknown email is not an error.
            return Ok(());
        };

        user.library_count = if delta < 0 {
            user.library_count.saturating_sub(delta.unsigned_abs() as usize)
        } else {
            user.library_count.saturating_add(delta as usize)
        };

        self.persist(&users).await
    }
}

fn validate_identity(name: &str, email: &str) -> Result<()> {
    if name.trim().is_empty() || email.trim().is_empty() {
        return Err(AppError::Validation(
            "name and email are required".to_string(),
        ));
    }
    Ok(())
}

fn ensure_unique_email(users: &[User], email: &str, skip_id: Option<&str>) -> Result<()> {
    let email = email.trim();
    let taken = users
        .iter()
        .any(|u| Some(u.id.as_str()) != skip_id && u.email.eq_ignore_ascii_case(email));
    if taken {
        return Err(AppError::DuplicateEmail(email.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn registry() -> UserRegistry {
        UserRegistry::load(Arc::new(MemoryStore::new())).await.unwrap()
    }

    async fn seed(registry: &UserRegistry, name: &str, email: &str) -> User {
        registry
            .create(Role::Owner, name, email, Role::User)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn search_matches_name_and_email_case_insensitively() {
        let registry = registry().await;
        seed(&registry, "Alice Archer", "alice@example.com").await;
        seed(&registry, "Bob Brook", "bob@example.com").await;
        seed(&registry, "Carol Malicet", "carol@example.com").await;

        let hits = registry.search("ALIC").await;
        let names: Vec<&str> = hits.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["Alice Archer", "Carol Malicet"]);

        let by_email = registry.search("bob@").await;
        assert_eq!(by_email.len(), 1);
        assert_eq!(by_email[0].name, "Bob Brook");
    }

    #[tokio::test]
    async fn blank_search_returns_the_full_list() {
        let registry = registry().await;
        seed(&registry, "Alice", "alice@example.com").await;
        seed(&registry, "Bob", "bob@example.com").await;

        assert_eq!(registry.search("").await.len(), 2);
        assert_eq!(registry.search("   ").await.len(), 2);
    }

    #[tokio::test]
    async fn toggle_status_is_an_involution_on_active_inactive() {
        let registry = registry().await;
        let user = seed(&registry, "Alice", "alice@example.com").await;
        assert_eq!(user.status, UserStatus::Active);

        let flipped = registry.toggle_status(Role::Admin, &user.id).await.unwrap();
        assert_eq!(flipped.status, UserStatus::Inactive);

        let back = registry.toggle_status(Role::Admin, &user.id).await.unwrap();
        assert_eq!(back.status, UserStatus::Active);
    }

    #[tokio::test]
    async fn role_change_touches_exactly_one_user() {
        let registry = registry().await;
        let first = seed(&registry, "Alice", "alice@example.com").await;
        let second = seed(&registry, "Bob", "bob@example.com").await;
        let third = seed(&registry, "Carol", "carol@example.com").await;

        registry
            .update_role(Role::Owner, &second.id, Role::Admin)
            .await
            .unwrap();

        let after = registry.list().await;
        let ids: Vec<&str> = after.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec![&first.id, &second.id, &third.id]);
        assert_eq!(after[0].role, Role::User);
        assert_eq!(after[1].role, Role::Admin);
        assert_eq!(after[2].role, Role::User);
    }

    #[tokio::test]
    async fn role_change_requires_the_owner_role() {
        let registry = registry().await;
        let user = seed(&registry, "Alice", "alice@example.com").await;

        let err = registry
            .update_role(Role::Admin, &user.id, Role::Moderator)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PermissionDenied { .. }));

        let unchanged = registry.get(&user.id).await.unwrap();
        assert_eq!(unchanged.role, Role::User);
    }

    #[tokio::test]
    async fn duplicate_emails_are_rejected_on_create_and_update() {
        let registry = registry().await;
        seed(&registry, "Alice", "alice@example.com").await;
        let bob = seed(&registry, "Bob", "bob@example.com").await;

        let err = registry
            .create(Role::Owner, "Impostor", "Alice@Example.com", Role::User)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicateEmail(_)));

        let err = registry
            .update(Role::Owner, &bob.id, "Bob", "alice@example.com", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicateEmail(_)));

        // Keeping your own email on edit is not a collision.
        registry
            .update(Role::Owner, &bob.id, "Robert", "bob@example.com", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_name_or_email_is_rejected() {
        let registry = registry().await;
        let err = registry
            .create(Role::Owner, "  ", "a@example.com", Role::User)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = registry
            .create(Role::Owner, "Alice", "", Role::User)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn pending_accounts_toggle_forward_to_active() {
        let registry = registry().await;
        let user = seed(&registry, "Alice", "alice@example.com").await;
        registry
            .update(Role::Owner, &user.id, "Alice", "alice@example.com", Some(UserStatus::Pending))
            .await
            .unwrap();

        let toggled = registry.toggle_status(Role::Admin, &user.id).await.unwrap();
        assert_eq!(toggled.status, UserStatus::Active);
    }

    #[tokio::test]
    async fn state_survives_a_reload_through_the_store() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        {
            let registry = UserRegistry::load(store.clone()).await.unwrap();
            registry
                .create(Role::Owner, "Alice", "alice@example.com", Role::Admin)
                .await
                .unwrap();
        }

        let reloaded = UserRegistry::load(store).await.unwrap();
        let users = reloaded.list().await;
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].email, "alice@example.com");
        assert_eq!(users[0].role, Role::Admin);
    }
}
