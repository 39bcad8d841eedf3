use once_cell::sync::Lazy;
use reqwest::blocking::Client;
use std::time::Duration;

/// Global blocking HTTP client with connection pooling and keep-alive.
///
/// Built on first use, which must happen off the async executor threads.
static HTTP_CLIENT: Lazy<Option<Client>> = Lazy::new(|| {
    match Client::builder()
        .timeout(Duration::from_secs(15))
        .connect_timeout(Duration::from_secs(5))
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(30))
        .user_agent(concat!("stockcast/", env!("CARGO_PKG_VERSION")))
        .build()
    {
        Ok(client) => Some(client),
        Err(e) => {
            tracing::error!("Failed to create HTTP client: {}", e);
            None
        }
    }
});

/// Get the global HTTP client, if it could be built.
pub fn client() -> Option<&'static Client> {
    HTTP_CLIENT.as_ref()
}
