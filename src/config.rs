use std::sync::OnceLock;

/// Backend connection settings, read once at startup and never mutated.
///
/// The identity, database and serverless function endpoints all hang off
/// `base_url`, the usual hosted-backend layout.
#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    /// Anonymous API key sent with every request to the hosted backend.
    pub anon_key: String,
    /// Where the authority redirects the browser after email confirmation,
    /// password recovery and third-party sign-in.
    pub site_url: String,
    /// When set, aggregator fetches may substitute deterministic synthetic
    /// data on persistent failure. Results carry an explicit flag.
    pub offline_fallback: bool,
}

static CONFIG: OnceLock<Config> = OnceLock::new();

impl Config {
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            anon_key: anon_key.into(),
            site_url: "http://localhost:3000".to_string(),
            offline_fallback: false,
        }
    }

    pub fn from_env() -> Self {
        Self {
            base_url: env("BUDGETEER_BASE_URL")
                .unwrap_or_else(|| "http://localhost:54321".to_string()),
            anon_key: env("BUDGETEER_ANON_KEY").unwrap_or_default(),
            site_url: env("BUDGETEER_SITE_URL")
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
            offline_fallback: env("BUDGETEER_OFFLINE_FALLBACK")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    fn root(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn identity_url(&self) -> String {
        format!("{}/auth/v1", self.root())
    }

    pub fn rest_url(&self) -> String {
        format!("{}/rest/v1", self.root())
    }

    pub fn functions_url(&self) -> String {
        format!("{}/functions/v1", self.root())
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

/// Process-wide configuration, initialized on first use.
pub fn init() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}
