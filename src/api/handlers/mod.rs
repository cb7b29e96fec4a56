pub mod auth;
pub mod credentials;
pub mod health;
pub mod jwks;
pub mod track;
pub mod types;
pub mod user;
