//! Library management service: users, personal libraries of books,
//! support tickets, roles and site settings over a JSON blob store.

pub mod api;
pub mod error;
pub mod libraries;
pub mod models;
pub mod roles;
pub mod server;
pub mod settings;
pub mod store;
pub mod tickets;
pub mod users;
