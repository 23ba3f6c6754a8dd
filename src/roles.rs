use crate::error::{AppError, Result};
use crate::models::Role;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ManageUsers,
    ManageRoles,
    ManageTickets,
    ManageLibraries,
    ManageSettings,
    MaintenanceMode,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::ManageUsers => "manage_users",
            Permission::ManageRoles => "manage_roles",
            Permission::ManageTickets => "manage_tickets",
            Permission::ManageLibraries => "manage_libraries",
            Permission::ManageSettings => "manage_settings",
            Permission::MaintenanceMode => "maintenance_mode",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoleEntry {
    pub role: Role,
    pub label: &'static str,
    pub description: &'static str,
    pub permissions: &'static [Permission],
}

const OWNER_PERMISSIONS: &[Permission] = &[
    Permission::ManageUsers,
    Permission::ManageRoles,
    Permission::ManageTickets,
    Permission::ManageLibraries,
    Permission::ManageSettings,
    Permission::MaintenanceMode,
];

const ADMIN_PERMISSIONS: &[Permission] = &[
    Permission::ManageUsers,
    Permission::ManageTickets,
    Permission::ManageLibraries,
    Permission::ManageSettings,
    Permission::MaintenanceMode,
];

const MODERATOR_PERMISSIONS: &[Permission] = &[Permission::ManageTickets];

const USER_PERMISSIONS: &[Permission] = &[];

pub const ROLE_TABLE: &[RoleEntry] = &[
    RoleEntry {
        role: Role::Owner,
        label: "Owner",
        description: "Full control of the site, including other users' roles",
        permissions: OWNER_PERMISSIONS,
    },
    RoleEntry {
        role: Role::Admin,
        label: "Administrator",
        description: "Manages users, libraries, tickets and site settings",
        permissions: ADMIN_PERMISSIONS,
    },
    RoleEntry {
        role: Role::Moderator,
        label: "Moderator",
        description: "Handles support tickets",
        permissions: MODERATOR_PERMISSIONS,
    },
    RoleEntry {
        role: Role::User,
        label: "User",
        description: "Manages their own libraries and tickets",
        permissions: USER_PERMISSIONS,
    },
];

pub fn permissions_for(role: Role) -> &'static [Permission] {
    match role {
        Role::Owner => OWNER_PERMISSIONS,
        Role::Admin => ADMIN_PERMISSIONS,
        Role::Moderator => MODERATOR_PERMISSIONS,
        Role::User => USER_PERMISSIONS,
    }
}

pub fn has_permission(role: Role, permission: Permission) -> bool {
    permissions_for(role).contains(&permission)
}

/// Every restricted mutation calls this before touching state, so the
/// rule holds no matter which surface the call came through.
pub fn assert_permission(role: Role, permission: Permission) -> Result<()> {
    if has_permission(role, permission) {
        Ok(())
    } else {
        Err(AppError::PermissionDenied { role, permission })
    }
}
