use std::time::Duration;

/// The user agent sent with every outgoing request.
pub const USER_AGENT: &str = concat!("crashmon/", env!("CARGO_PKG_VERSION"));

/// The timeout for establishing a connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Creates a [`reqwest::Client`] whose requests time out after `timeout` in total.
pub fn create_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .user_agent(USER_AGENT)
        .gzip(true)
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}
