pub mod health;
pub mod permissions;
pub mod sessions;
pub mod settings;
