pub mod analytics;
pub mod config;
pub mod lorawan;
pub mod proxy;
pub mod semtech;
