//! Actix-web middleware.

mod http_logger;

pub use http_logger::HttpLogger;
