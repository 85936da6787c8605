use std::env;
use std::time::Duration;

use url::Url;

const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8000";
const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";

/// Client configuration: socket/REST endpoints plus the timing policy
/// shared by every manager (connect timeout, offer retry, dedup window).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base `ws(s)://` URL of the relay serving both socket scopes.
    pub relay_base: Url,
    /// Base `http(s)://` URL of the REST backend.
    pub api_base: Url,
    /// Bound on every socket open attempt.
    pub connect_timeout: Duration,
    /// Bounded retry for the call-initiate send only.
    pub offer_send_attempts: u32,
    /// Linear backoff step between offer send attempts.
    pub offer_backoff_step: Duration,
    /// Tolerance used to identify duplicate message deliveries.
    pub dedup_window: Duration,
}

impl ClientConfig {
    pub fn new(relay_base: Url, api_base: Url) -> Self {
        Self {
            relay_base,
            api_base,
            connect_timeout: Duration::from_secs(10),
            offer_send_attempts: 3,
            offer_backoff_step: Duration::from_millis(500),
            dedup_window: Duration::from_millis(2000),
        }
    }

    /// Load configuration from `CONSULT_RELAY_URL` / `CONSULT_API_URL`,
    /// falling back to localhost defaults on absent or unparsable values.
    pub fn from_env() -> Self {
        let relay = parse_or_default("CONSULT_RELAY_URL", DEFAULT_RELAY_URL);
        let api = parse_or_default("CONSULT_API_URL", DEFAULT_API_URL);
        Self::new(relay, api)
    }

    /// Socket URL for the chat scope of one consultation.
    pub fn chat_socket_url(&self, consultation_id: i64) -> Url {
        let mut url = self.relay_base.clone();
        url.set_path(&format!("consultations/ws/chat/{consultation_id}"));
        url
    }

    /// Socket URL for the user-wide call-signaling scope.
    pub fn signaling_socket_url(&self, user_id: &str) -> Url {
        let mut url = self.relay_base.clone();
        url.set_path(&format!("consultations/ws/create_signaling/{user_id}"));
        url
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(
            Url::parse(DEFAULT_RELAY_URL).expect("default relay url"),
            Url::parse(DEFAULT_API_URL).expect("default api url"),
        )
    }
}

fn parse_or_default(var: &str, default: &str) -> Url {
    let fallback = || Url::parse(default).expect("default url");
    match env::var(var) {
        Ok(value) => Url::parse(&value).unwrap_or_else(|err| {
            tracing::warn!(var, error = %err, "invalid url in environment; using default");
            fallback()
        }),
        Err(_) => fallback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_values() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.offer_send_attempts, 3);
        assert_eq!(config.offer_backoff_step, Duration::from_millis(500));
        assert_eq!(config.dedup_window, Duration::from_millis(2000));
    }

    #[test]
    fn builds_scope_urls() {
        let config = ClientConfig::default();
        assert_eq!(
            config.chat_socket_url(42).as_str(),
            "ws://127.0.0.1:8000/consultations/ws/chat/42"
        );
        assert_eq!(
            config.signaling_socket_url("u-7").as_str(),
            "ws://127.0.0.1:8000/consultations/ws/create_signaling/u-7"
        );
    }

    #[test]
    fn scope_urls_keep_custom_host() {
        let config = ClientConfig::new(
            Url::parse("wss://relay.example.com").expect("url"),
            Url::parse("https://api.example.com").expect("url"),
        );
        assert_eq!(
            config.chat_socket_url(7).as_str(),
            "wss://relay.example.com/consultations/ws/chat/7"
        );
    }
}
