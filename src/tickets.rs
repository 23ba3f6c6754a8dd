use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{Role, Ticket, TicketPriority, TicketResponse, TicketStatus, User};
use crate::roles::{assert_permission, Permission};
use crate::store::{BlobStore, TICKETS_KEY};

/// Support tickets. Status changes go through the transition table; the
/// original accepted any value unconditionally, which is the gap this
/// container closes.
pub struct TicketDesk {
    store: Arc<dyn BlobStore>,
    tickets: RwLock<Vec<Ticket>>,
}

impl TicketDesk {
    pub async fn load(store: Arc<dyn BlobStore>) -> Result<Self> {
        let tickets: Vec<Ticket> = match store.read(TICKETS_KEY).await? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Vec::new(),
        };

        Ok(TicketDesk {
            store,
            tickets: RwLock::new(tickets),
        })
    }

    async fn persist(&self, tickets: &[Ticket]) -> Result<()> {
        let raw = serde_json::to_string(tickets)?;
        self.store.write(TICKETS_KEY, &raw).await
    }

    pub async fn list(&self, filter: Option<TicketStatus>) -> Vec<Ticket> {
        let tickets = self.tickets.read().await;
        match filter {
            Some(status) => tickets
                .iter()
                .filter(|t| t.status == status)
                .cloned()
                .collect(),
            None => tickets.clone(),
        }
    }

    pub async fn get(&self, id: &str) -> Option<Ticket> {
        self.tickets
            .read()
            .await
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    /// Tickets are born open.
    pub async fn create(
        &self,
        requester: &User,
        subject: &str,
        description: &str,
        priority: TicketPriority,
        kind: &str,
    ) -> Result<Ticket> {
        if subject.trim().is_empty() || description.trim().is_empty() {
            return Err(AppError::Validation(
                "ticket subject and description are required".to_string(),
            ));
        }

        let now = Utc::now();
        let ticket = Ticket {
            id: Uuid::new_v4().to_string(),
            subject: subject.trim().to_string(),
            description: description.trim().to_string(),
            status: TicketStatus::Open,
            priority,
            kind: kind.trim().to_string(),
            user_id: requester.id.clone(),
            user_name: requester.name.clone(),
            user_email: requester.email.clone(),
            created_at: now,
            updated_at: now,
            responses: Vec::new(),
        };

        let mut tickets = self.tickets.write().await;
        tickets.push(ticket.clone());
        self.persist(&tickets).await?;
        Ok(ticket)
    }

    pub async fn update_status(
        &self,
        actor: Role,
        id: &str,
        next: TicketStatus,
    ) -> Result<Ticket> {
        assert_permission(actor, Permission::ManageTickets)?;

        let mut tickets = self.tickets.write().await;
        let ticket = tickets
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| AppError::NotFound(format!("ticket {id}")))?;

        if !ticket.status.can_transition_to(next) {
            return Err(AppError::InvalidTransition {
                from: ticket.status,
                to: next,
            });
        }

        ticket.status = next;
        ticket.updated_at = Utc::now();
        let updated = ticket.clone();

        self.persist(&tickets).await?;
        Ok(updated)
    }

    /// Appends one response. The requester may reply to their own ticket,
    /// staff to any open one; a staff reply moves a fresh ticket into
    /// in-progress.
    pub async fn reply(&self, actor: &User, id: &str, message: &str) -> Result<Ticket> {
        if message.trim().is_empty() {
            return Err(AppError::Validation("reply message is required".to_string()));
        }

        let mut tickets = self.tickets.write().await;
        let ticket = tickets
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| AppError::NotFound(format!("ticket {id}")))?;

        if ticket.user_id != actor.id && !actor.role.is_staff() {
            return Err(AppError::PermissionDenied {
                role: actor.role,
                permission: Permission::ManageTickets,
            });
        }
        if ticket.status == TicketStatus::Closed {
            return Err(AppError::TicketClosed);
        }

        let is_admin = actor.role.is_staff();
        let now = Utc::now();
        ticket.responses.push(TicketResponse {
            id: Uuid::new_v4().to_string(),
            ticket_id: ticket.id.clone(),
            message: message.trim().to_string(),
            user_id: actor.id.clone(),
            user_name: actor.name.clone(),
            is_admin,
            created_at: now,
        });

        if is_admin && ticket.status == TicketStatus::Open {
            ticket.status = TicketStatus::InProgress;
        }
        ticket.updated_at = now;
        let updated = ticket.clone();

        self.persist(&tickets).await?;
        Ok(updated)
    }

    pub async fn delete(&self, actor: Role, id: &str) -> Result<()> {
        assert_permission(actor, Permission::ManageTickets)?;

        let mut tickets = self.tickets.write().await;
        let position = tickets
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| AppError::NotFound(format!("ticket {id}")))?;
        tickets.remove(position);

        self.persist(&tickets).await
    }
}
