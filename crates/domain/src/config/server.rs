use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Environment variable holding the API bearer token. Unset or empty
    /// env var means dev mode (no auth enforced).
    #[serde(default = "d_api_token_env")]
    pub api_token_env: String,
    #[serde(default)]
    pub cors: CorsConfig,
    /// Optional per-IP rate limiting for the control API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
            api_token_env: d_api_token_env(),
            cors: CorsConfig::default(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Origins allowed for CORS. Defaults to localhost-only.
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: d_cors_origins(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "d_rps")]
    pub requests_per_second: u64,
    #[serde(default = "d_burst")]
    pub burst_size: u32,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_port() -> u16 {
    3100
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_api_token_env() -> String {
    "VOX_API_TOKEN".into()
}
fn d_cors_origins() -> Vec<String> {
    vec!["http://localhost:*".into(), "http://127.0.0.1:*".into()]
}
fn d_rps() -> u64 {
    20
}
fn d_burst() -> u32 {
    40
}
