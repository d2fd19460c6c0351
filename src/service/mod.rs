//! HTTP front door

pub mod http;

pub use self::http::ApiHttpApp;
