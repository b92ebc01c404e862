pub mod catalog_fetcher;
pub mod crawl_scheduler;
pub mod settings;
