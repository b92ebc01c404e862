pub mod api;
pub mod reservation_manager;
pub mod settings;

#[cfg(any(feature = "server", test))]
pub mod app_config;

#[cfg(any(feature = "server", test))]
mod handlers;
