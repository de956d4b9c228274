use once_cell::sync::Lazy;
use reqwest::Client;

use crate::config::CONFIG;

// Upper bound only; each model call is raced against its own deadline.
static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(CONFIG.http_timeout())
        .build()
        .expect("Failed to build HTTP client")
});

pub fn get_http_client() -> &'static Client {
    &HTTP_CLIENT
}
