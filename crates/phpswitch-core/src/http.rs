use std::time::Duration;

use log::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Independent endpoints tried in order before any catalog request.
pub const DEFAULT_PROBE_URLS: [&str; 3] = [
    "https://www.google.com",
    "https://windows.php.net",
    "https://www.microsoft.com",
];

/// Build the shared HTTP client. `timeout` bounds a whole request, body included.
///
/// # Errors
/// Returns an error when the TLS backend cannot be initialised.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(CONNECT_TIMEOUT.min(timeout))
        .user_agent(format!("phpswitch/{}", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Send a HEAD request to each endpoint in turn and succeed on the first answer.
///
/// Any HTTP response counts as reachable; only transport failures move on.
pub async fn probe_connectivity<S: AsRef<str>>(
    client: &reqwest::Client,
    urls: &[S],
    timeout: Duration,
) -> bool {
    for url in urls {
        let url = url.as_ref();
        match client.head(url).timeout(timeout).send().await {
            Ok(response) => {
                debug!("Connectivity probe {url} answered {}", response.status());
                return true;
            }
            Err(error) => debug!("Connectivity probe {url} failed: {error}"),
        }
    }
    false
}
