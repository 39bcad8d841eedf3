pub mod error;
pub mod config;
pub mod store;
pub mod session;
pub mod service;
pub mod util;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Short commit hash the binary was built from.
pub const GIT_HASH: &str = env!("GIT_HASH");
