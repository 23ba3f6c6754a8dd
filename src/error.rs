use crate::models::{Role, TicketStatus};
use crate::roles::Permission;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("a user with email {0} already exists")]
    DuplicateEmail(String),
    #[error("role {role} is not allowed to {permission}")]
    PermissionDenied { role: Role, permission: Permission },
    #[error("cannot move ticket from {from} to {to}")]
    InvalidTransition {
        from: TicketStatus,
        to: TicketStatus,
    },
    #[error("ticket is closed")]
    TicketClosed,
    #[error("maintenance mode is enabled")]
    Maintenance,
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
