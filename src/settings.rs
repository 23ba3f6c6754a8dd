use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{MaintenanceSettings, Role, SocialLink};
use crate::roles::{assert_permission, Permission};
use crate::store::{BlobStore, SITE_SETTINGS_KEY, SOCIAL_LINKS_KEY};

/// Site-wide settings: the maintenance singleton and the social links
/// list, both saved wholesale.
pub struct SiteSettings {
    store: Arc<dyn BlobStore>,
    maintenance: RwLock<MaintenanceSettings>,
    social: RwLock<Vec<SocialLink>>,
}

impl SiteSettings {
    pub async fn load(store: Arc<dyn BlobStore>) -> Result<Self> {
        let maintenance: MaintenanceSettings = match store.read(SITE_SETTINGS_KEY).await? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => MaintenanceSettings::default(),
        };
        let social: Vec<SocialLink> = match store.read(SOCIAL_LINKS_KEY).await? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };

        Ok(SiteSettings {
            store,
            maintenance: RwLock::new(maintenance),
            social: RwLock::new(social),
        })
    }

    pub async fn maintenance(&self) -> MaintenanceSettings {
        self.maintenance.read().await.clone()
    }

    pub async fn save_maintenance(
        &self,
        actor: Role,
        settings: MaintenanceSettings,
    ) -> Result<MaintenanceSettings> {
        assert_permission(actor, Permission::MaintenanceMode)?;

        let mut maintenance = self.maintenance.write().await;
        *maintenance = settings;
        if maintenance.enabled {
            log::warn!("maintenance mode enabled: {}", maintenance.message);
        }

        let raw = serde_json::to_string(&*maintenance)?;
        self.store.write(SITE_SETTINGS_KEY, &raw).await?;
        Ok(maintenance.clone())
    }

    pub async fn social_links(&self) -> Vec<SocialLink> {
        self.social.read().await.clone()
    }

    pub async fn replace_social_links(
        &self,
        actor: Role,
        mut links: Vec<SocialLink>,
    ) -> Result<Vec<SocialLink>> {
        assert_permission(actor, Permission::ManageSettings)?;

        for link in &mut links {
            if link.id.is_empty() {
                link.id = Uuid::new_v4().to_string();
            }
        }

        let mut social = self.social.write().await;
        *social = links;

        let raw = serde_json::to_string(&*social)?;
        self.store.write(SOCIAL_LINKS_KEY, &raw).await?;
        Ok(social.clone())
    }
}
