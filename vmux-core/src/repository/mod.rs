//! Persistence for the one relational entity this core owns: users.

pub mod users;

pub use users::{SqlUserRepository, UserRepository};
