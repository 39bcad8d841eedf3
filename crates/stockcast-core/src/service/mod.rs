pub mod activity;
pub mod auth;
pub mod catalog;
pub mod market;
pub mod model;
pub mod prediction;
pub mod sentiment;
pub mod usage;

#[cfg(feature = "http-api")]
pub mod http;
