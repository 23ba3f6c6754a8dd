use std::convert::Infallible;
use std::sync::Arc;

use serde::Serialize;
use warp::http::StatusCode;
use warp::reply::{json, with_status, Json, WithStatus};
use warp::{Filter, Rejection};

use crate::api::{
    BookInput, CreateTicketRequest, CreateUserRequest, ErrorBody, LibraryInput, OwnerQuery,
    ReplyRequest, SearchQuery, StatusQuery, UpdateRoleRequest, UpdateTicketStatusRequest,
    UpdateUserRequest,
};
use crate::error::{AppError, Result};
use crate::libraries::LibraryCatalog;
use crate::models::{MaintenanceSettings, Role, SocialLink, TicketStatus, User};
use crate::roles::{has_permission, Permission, ROLE_TABLE};
use crate::settings::SiteSettings;
use crate::store::BlobStore;
use crate::tickets::TicketDesk;
use crate::users::UserRegistry;

type HandlerResult = std::result::Result<WithStatus<Json>, Infallible>;

pub struct Server {
    pub users: UserRegistry,
    pub libraries: LibraryCatalog,
    pub tickets: TicketDesk,
    pub settings: SiteSettings,
}

impl Server {
    pub async fn load(store: Arc<dyn BlobStore>) -> Result<Self> {
        Ok(Server {
            users: UserRegistry::load(store.clone()).await?,
            libraries: LibraryCatalog::load(store.clone()).await?,
            tickets: TicketDesk::load(store.clone()).await?,
            settings: SiteSettings::load(store).await?,
        })
    }

    /// The acting user comes from the x-user-id header; there is no
    /// credential handling here, identification only.
    async fn require_actor(&self, actor_id: Option<&str>) -> Result<User> {
        let id = actor_id
            .ok_or_else(|| AppError::Validation("missing x-user-id header".to_string()))?;
        self.users
            .get(id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("user {id}")))
    }

    /// Every mutation crosses this; reads stay open during maintenance.
    async fn maintenance_gate(&self, actor: &User) -> Result<()> {
        let maintenance = self.settings.maintenance().await;
        if maintenance.enabled && !has_permission(actor.role, Permission::MaintenanceMode) {
            return Err(AppError::Maintenance);
        }
        Ok(())
    }
}

fn json_ok<T: Serialize>(value: &T) -> WithStatus<Json> {
    with_status(json(value), StatusCode::OK)
}

fn error_reply(err: &AppError) -> WithStatus<Json> {
    let status = match err {
        AppError::Validation(_) => StatusCode::BAD_REQUEST,
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::DuplicateEmail(_)
        | AppError::InvalidTransition { .. }
        | AppError::TicketClosed => StatusCode::CONFLICT,
        AppError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
        AppError::Maintenance => StatusCode::SERVICE_UNAVAILABLE,
        AppError::Storage(_) | AppError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        log::error!("request failed: {err}");
    }
    with_status(
        json(&ErrorBody {
            error: err.to_string(),
        }),
        status,
    )
}

fn respond<T: Serialize>(result: Result<T>) -> HandlerResult {
    match result {
        Ok(value) => Ok(json_ok(&value)),
        Err(err) => Ok(error_reply(&err)),
    }
}

fn parse_status_filter(raw: Option<&str>) -> Result<Option<TicketStatus>> {
    match raw.map(str::trim) {
        None | Some("") | Some("all") => Ok(None),
        Some("open") => Ok(Some(TicketStatus::Open)),
        Some("in-progress") => Ok(Some(TicketStatus::InProgress)),
        Some("closed") => Ok(Some(TicketStatus::Closed)),
        Some(other) => Err(AppError::Validation(format!(
            "unknown status filter: {other}"
        ))),
    }
}

fn deleted() -> serde_json::Value {
    serde_json::json!({ "deleted": true })
}

// -- user handlers ---------------------------------------------------------

async fn search_users(query: SearchQuery, server: Arc<Server>) -> HandlerResult {
    let users = server.users.search(query.q.as_deref().unwrap_or("")).await;
    respond(Ok(users))
}

async fn create_user(
    body: CreateUserRequest,
    actor_id: Option<String>,
    server: Arc<Server>,
) -> HandlerResult {
    let result = async {
        let actor = server.require_actor(actor_id.as_deref()).await?;
        server.maintenance_gate(&actor).await?;
        server
            .users
            .create(
                actor.role,
                &body.name,
                &body.email,
                body.role.unwrap_or(Role::User),
            )
            .await
    }
    .await;
    respond(result)
}

async fn update_user(
    id: String,
    body: UpdateUserRequest,
    actor_id: Option<String>,
    server: Arc<Server>,
) -> HandlerResult {
    let result = async {
        let actor = server.require_actor(actor_id.as_deref()).await?;
        server.maintenance_gate(&actor).await?;
        server
            .users
            .update(actor.role, &id, &body.name, &body.email, body.status)
            .await
    }
    .await;
    respond(result)
}

async fn toggle_user_status(
    id: String,
    actor_id: Option<String>,
    server: Arc<Server>,
) -> HandlerResult {
    let result = async {
        let actor = server.require_actor(actor_id.as_deref()).await?;
        server.maintenance_gate(&actor).await?;
        server.users.toggle_status(actor.role, &id).await
    }
    .await;
    respond(result)
}

async fn update_user_role(
    id: String,
    body: UpdateRoleRequest,
    actor_id: Option<String>,
    server: Arc<Server>,
) -> HandlerResult {
    let result = async {
        let actor = server.require_actor(actor_id.as_deref()).await?;
        server.maintenance_gate(&actor).await?;
        server.users.update_role(actor.role, &id, body.role).await
    }
    .await;
    respond(result)
}

async fn delete_user(id: String, actor_id: Option<String>, server: Arc<Server>) -> HandlerResult {
    let result = async {
        let actor = server.require_actor(actor_id.as_deref()).await?;
        server.maintenance_gate(&actor).await?;
        server.users.delete(actor.role, &id).await
    }
    .await
    .map(|()| deleted());
    respond(result)
}

// -- library handlers ------------------------------------------------------

async fn list_libraries(query: OwnerQuery, server: Arc<Server>) -> HandlerResult {
    let libraries = server.libraries.list(query.owner.as_deref()).await;
    respond(Ok(libraries))
}

async fn get_library(id: String, server: Arc<Server>) -> HandlerResult {
    let result = server
        .libraries
        .get(&id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("library {id}")));
    respond(result)
}

async fn create_library(
    body: LibraryInput,
    actor_id: Option<String>,
    server: Arc<Server>,
) -> HandlerResult {
    let result = async {
        let actor = server.require_actor(actor_id.as_deref()).await?;
        server.maintenance_gate(&actor).await?;
        let library = server
            .libraries
            .create(&actor, &body.name, &body.description)
            .await?;
        server
            .users
            .adjust_library_count(&library.owner_email, 1)
            .await?;
        Ok(library)
    }
    .await;
    respond(result)
}

async fn update_library(
    id: String,
    body: LibraryInput,
    actor_id: Option<String>,
    server: Arc<Server>,
) -> HandlerResult {
    let result = async {
        let actor = server.require_actor(actor_id.as_deref()).await?;
        server.maintenance_gate(&actor).await?;
        server
            .libraries
            .update(&actor, &id, &body.name, &body.description)
            .await
    }
    .await;
    respond(result)
}

async fn delete_library(
    id: String,
    actor_id: Option<String>,
    server: Arc<Server>,
) -> HandlerResult {
    let result = async {
        let actor = server.require_actor(actor_id.as_deref()).await?;
        server.maintenance_gate(&actor).await?;
        let removed = server.libraries.delete(&actor, &id).await?;
        server
            .users
            .adjust_library_count(&removed.owner_email, -1)
            .await?;
        Ok(deleted())
    }
    .await;
    respond(result)
}

async fn search_books(id: String, query: SearchQuery, server: Arc<Server>) -> HandlerResult {
    let result = server
        .libraries
        .search_books(&id, query.q.as_deref().unwrap_or(""))
        .await;
    respond(result)
}

async fn add_book(
    id: String,
    body: BookInput,
    actor_id: Option<String>,
    server: Arc<Server>,
) -> HandlerResult {
    let result = async {
        let actor = server.require_actor(actor_id.as_deref()).await?;
        server.maintenance_gate(&actor).await?;
        server.libraries.add_book(&actor, &id, body).await
    }
    .await;
    respond(result)
}

async fn update_book(
    id: String,
    book_id: String,
    body: BookInput,
    actor_id: Option<String>,
    server: Arc<Server>,
) -> HandlerResult {
    let result = async {
        let actor = server.require_actor(actor_id.as_deref()).await?;
        server.maintenance_gate(&actor).await?;
        server
            .libraries
            .update_book(&actor, &id, &book_id, body)
            .await
    }
    .await;
    respond(result)
}

async fn delete_book(
    id: String,
    book_id: String,
    actor_id: Option<String>,
    server: Arc<Server>,
) -> HandlerResult {
    let result = async {
        let actor = server.require_actor(actor_id.as_deref()).await?;
        server.maintenance_gate(&actor).await?;
        server.libraries.delete_book(&actor, &id, &book_id).await
    }
    .await
    .map(|()| deleted());
    respond(result)
}

// -- ticket handlers -------------------------------------------------------

async fn list_tickets(query: StatusQuery, server: Arc<Server>) -> HandlerResult {
    let result = async {
        let filter = parse_status_filter(query.status.as_deref())?;
        Ok(server.tickets.list(filter).await)
    }
    .await;
    respond(result)
}

async fn create_ticket(
    body: CreateTicketRequest,
    actor_id: Option<String>,
    server: Arc<Server>,
) -> HandlerResult {
    let result = async {
        let actor = server.require_actor(actor_id.as_deref()).await?;
        server.maintenance_gate(&actor).await?;
        server
            .tickets
            .create(
                &actor,
                &body.subject,
                &body.description,
                body.priority,
                &body.kind,
            )
            .await
    }
    .await;
    respond(result)
}

async fn update_ticket_status(
    id: String,
    body: UpdateTicketStatusRequest,
    actor_id: Option<String>,
    server: Arc<Server>,
) -> HandlerResult {
    let result = async {
        let actor = server.require_actor(actor_id.as_deref()).await?;
        server.maintenance_gate(&actor).await?;
        server
            .tickets
            .update_status(actor.role, &id, body.status)
            .await
    }
    .await;
    respond(result)
}

async fn reply_to_ticket(
    id: String,
    body: ReplyRequest,
    actor_id: Option<String>,
    server: Arc<Server>,
) -> HandlerResult {
    let result = async {
        let actor = server.require_actor(actor_id.as_deref()).await?;
        server.maintenance_gate(&actor).await?;
        server.tickets.reply(&actor, &id, &body.message).await
    }
    .await;
    respond(result)
}

async fn delete_ticket(id: String, actor_id: Option<String>, server: Arc<Server>) -> HandlerResult {
    let result = async {
        let actor = server.require_actor(actor_id.as_deref()).await?;
        server.maintenance_gate(&actor).await?;
        server.tickets.delete(actor.role, &id).await
    }
    .await
    .map(|()| deleted());
    respond(result)
}

// -- settings handlers -----------------------------------------------------

async fn get_maintenance(server: Arc<Server>) -> HandlerResult {
    respond(Ok(server.settings.maintenance().await))
}

async fn save_maintenance(
    body: MaintenanceSettings,
    actor_id: Option<String>,
    server: Arc<Server>,
) -> HandlerResult {
    let result = async {
        let actor = server.require_actor(actor_id.as_deref()).await?;
        server.maintenance_gate(&actor).await?;
        server.settings.save_maintenance(actor.role, body).await
    }
    .await;
    respond(result)
}

async fn get_social_links(server: Arc<Server>) -> HandlerResult {
    respond(Ok(server.settings.social_links().await))
}

async fn save_social_links(
    body: Vec<SocialLink>,
    actor_id: Option<String>,
    server: Arc<Server>,
) -> HandlerResult {
    let result = async {
        let actor = server.require_actor(actor_id.as_deref()).await?;
        server.maintenance_gate(&actor).await?;
        server.settings.replace_social_links(actor.role, body).await
    }
    .await;
    respond(result)
}

// -- routing ---------------------------------------------------------------

fn with_server(
    server: Arc<Server>,
) -> impl Filter<Extract = (Arc<Server>,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}

fn actor_header() -> impl Filter<Extract = (Option<String>,), Error = Rejection> + Clone {
    warp::header::optional::<String>("x-user-id")
}

pub fn routes(
    server: Arc<Server>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Rejection> + Clone {
    let users_search = warp::path!("api" / "users")
        .and(warp::get())
        .and(warp::query::<SearchQuery>())
        .and(with_server(server.clone()))
        .and_then(search_users);

    let users_create = warp::path!("api" / "users")
        .and(warp::post())
        .and(warp::body::json())
        .and(actor_header())
        .and(with_server(server.clone()))
        .and_then(create_user);

    let users_update = warp::path!("api" / "users" / String)
        .and(warp::put())
        .and(warp::body::json())
        .and(actor_header())
        .and(with_server(server.clone()))
        .and_then(update_user);

    let users_toggle = warp::path!("api" / "users" / String / "toggle-status")
        .and(warp::post())
        .and(actor_header())
        .and(with_server(server.clone()))
        .and_then(toggle_user_status);

    let users_role = warp::path!("api" / "users" / String / "role")
        .and(warp::put())
        .and(warp::body::json())
        .and(actor_header())
        .and(with_server(server.clone()))
        .and_then(update_user_role);

    let users_delete = warp::path!("api" / "users" / String)
        .and(warp::delete())
        .and(actor_header())
        .and(with_server(server.clone()))
        .and_then(delete_user);

    let roles_list = warp::path!("api" / "roles")
        .and(warp::get())
        .map(|| json_ok(&ROLE_TABLE));

    let libraries_list = warp::path!("api" / "libraries")
        .and(warp::get())
        .and(warp::query::<OwnerQuery>())
        .and(with_server(server.clone()))
        .and_then(list_libraries);

    let libraries_create = warp::path!("api" / "libraries")
        .and(warp::post())
        .and(warp::body::json())
        .and(actor_header())
        .and(with_server(server.clone()))
        .and_then(create_library);

    let libraries_get = warp::path!("api" / "libraries" / String)
        .and(warp::get())
        .and(with_server(server.clone()))
        .and_then(get_library);

    let libraries_update = warp::path!("api" / "libraries" / String)
        .and(warp::put())
        .and(warp::body::json())
        .and(actor_header())
        .and(with_server(server.clone()))
        .and_then(update_library);

    let libraries_delete = warp::path!("api" / "libraries" / String)
        .and(warp::delete())
        .and(actor_header())
        .and(with_server(server.clone()))
        .and_then(delete_library);

    let books_search = warp::path!("api" / "libraries" / String / "books")
        .and(warp::get())
        .and(warp::query::<SearchQuery>())
        .and(with_server(server.clone()))
        .and_then(search_books);

    let books_add = warp::path!("api" / "libraries" / String / "books")
        .and(warp::post())
        .and(warp::body::json())
        .and(actor_header())
        .and(with_server(server.clone()))
        .and_then(add_book);

    let books_update = warp::path!("api" / "libraries" / String / "books" / String)
        .and(warp::put())
        .and(warp::body::json())
        .and(actor_header())
        .and(with_server(server.clone()))
        .and_then(update_book);

    let books_delete = warp::path!("api" / "libraries" / String / "books" / String)
        .and(warp::delete())
        .and(actor_header())
        .and(with_server(server.clone()))
        .and_then(delete_book);

    let tickets_list = warp::path!("api" / "tickets")
        .and(warp::get())
        .and(warp::query::<StatusQuery>())
        .and(with_server(server.clone()))
        .and_then(list_tickets);

    let tickets_create = warp::path!("api" / "tickets")
        .and(warp::post())
        .and(warp::body::json())
        .and(actor_header())
        .and(with_server(server.clone()))
        .and_then(create_ticket);

    let tickets_status = warp::path!("api" / "tickets" / String / "status")
        .and(warp::put())
        .and(warp::body::json())
        .and(actor_header())
        .and(with_server(server.clone()))
        .and_then(update_ticket_status);

    let tickets_reply = warp::path!("api" / "tickets" / String / "responses")
        .and(warp::post())
        .and(warp::body::json())
        .and(actor_header())
        .and(with_server(server.clone()))
        .and_then(reply_to_ticket);

    let tickets_delete = warp::path!("api" / "tickets" / String)
        .and(warp::delete())
        .and(actor_header())
        .and(with_server(server.clone()))
        .and_then(delete_ticket);

    let maintenance_get = warp::path!("api" / "settings" / "maintenance")
        .and(warp::get())
        .and(with_server(server.clone()))
        .and_then(get_maintenance);

    let maintenance_save = warp::path!("api" / "settings" / "maintenance")
        .and(warp::put())
        .and(warp::body::json())
        .and(actor_header())
        .and(with_server(server.clone()))
        .and_then(save_maintenance);

    let social_get = warp::path!("api" / "settings" / "social")
        .and(warp::get())
        .and(with_server(server.clone()))
        .and_then(get_social_links);

    let social_save = warp::path!("api" / "settings" / "social")
        .and(warp::put())
        .and(warp::body::json())
        .and(actor_header())
        .and(with_server(server))
        .and_then(save_social_links);

    users_search
        .or(users_create)
        .or(users_update)
        .or(users_toggle)
        .or(users_role)
        .or(users_delete)
        .or(roles_list)
        .or(libraries_list)
        .or(libraries_create)
        .or(libraries_get)
        .or(libraries_update)
        .or(libraries_delete)
        .or(books_search)
        .or(books_add)
        .or(books_update)
        .or(books_delete)
        .or(tickets_list)
        .or(tickets_create)
        .or(tickets_status)
        .or(tickets_reply)
        .or(tickets_delete)
        .or(maintenance_get)
        .or(maintenance_save)
        .or(social_get)
        .or(social_save)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Ticket, UserStatus};
    use crate::store::MemoryStore;

    async fn test_server() -> Arc<Server> {
        let server = Server::load(Arc::new(MemoryStore::new())).await.unwrap();
        server.users.ensure_owner().await.unwrap();
        Arc::new(server)
    }

    async fn owner_id(server: &Arc<Server>) -> String {
        server.users.list().await[0].id.clone()
    }

    #[tokio::test]
    async fn mutations_without_an_actor_header_are_rejected() {
        let server = test_server().await;
        let api = routes(server);

        let res = warp::test::request()
            .method("POST")
            .path("/api/users")
            .json(&serde_json::json!({ "name": "Alice", "email": "alice@example.com" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["error"], "missing x-user-id header");
    }

    #[tokio::test]
    async fn unknown_actors_get_a_404() {
        let server = test_server().await;
        let api = routes(server);

        let res = warp::test::request()
            .method("POST")
            .path("/api/users")
            .header("x-user-id", "nobody")
            .json(&serde_json::json!({ "name": "Alice", "email": "alice@example.com" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn user_search_round_trips_over_http() {
        let server = test_server().await;
        let owner = owner_id(&server).await;
        let api = routes(server);

        let res = warp::test::request()
            .method("POST")
            .path("/api/users")
            .header("x-user-id", &owner)
            .json(&serde_json::json!({ "name": "Alice Archer", "email": "alice@example.com" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);

        let res = warp::test::request()
            .method("GET")
            .path("/api/users?q=archer")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let users: Vec<User> = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].status, UserStatus::Active);
    }

    #[tokio::test]
    async fn maintenance_locks_out_plain_users_but_not_staff() {
        let server = test_server().await;
        let owner = owner_id(&server).await;
        let bob = server
            .users
            .create(Role::Owner, "Bob", "bob@example.com", Role::User)
            .await
            .unwrap();
        let api = routes(server);

        let res = warp::test::request()
            .method("PUT")
            .path("/api/settings/maintenance")
            .header("x-user-id", &owner)
            .json(&serde_json::json!({ "enabled": true, "message": "back soon" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);

        let ticket = serde_json::json!({
            "subject": "locked out",
            "description": "cannot work",
            "priority": "high",
            "type": "support"
        });

        let res = warp::test::request()
            .method("POST")
            .path("/api/tickets")
            .header("x-user-id", &bob.id)
            .json(&ticket)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

        let res = warp::test::request()
            .method("POST")
            .path("/api/tickets")
            .header("x-user-id", &owner)
            .json(&ticket)
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let created: Ticket = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(created.status, TicketStatus::Open);
    }

    #[tokio::test]
    async fn bad_status_filters_are_a_400() {
        let server = test_server().await;
        let api = routes(server);

        let res = warp::test::request()
            .method("GET")
            .path("/api/tickets?status=resolved")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = warp::test::request()
            .method("GET")
            .path("/api/tickets?status=all")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn the_role_table_is_published() {
        let server = test_server().await;
        let api = routes(server);

        let res = warp::test::request()
            .method("GET")
            .path("/api/roles")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);

        let table: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(table.as_array().unwrap().len(), 4);
        assert_eq!(table[0]["role"], "owner");
        assert!(table[0]["permissions"]
            .as_array()
            .unwrap()
            .contains(&serde_json::json!("manage_roles")));
    }
}
