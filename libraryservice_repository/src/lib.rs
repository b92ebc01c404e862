pub mod api;
pub mod credentials;
pub mod records_repository;
