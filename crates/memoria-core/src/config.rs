//! Process configuration loaded from the environment.
//!
//! Recognized variables (spec §6):
//!
//! | Env | Default | Description |
//! |-----|---------|--------------|
//! | `APP_ENV` | `development` | Runtime mode switch. |
//! | `DATABASE_URL` / `MEMORIA_DATA_DIR` | `./data` | Datastore connection / per-tenant SQLite file directory. |
//! | `SESSION_SECRET` | none | HMAC key for OAuth state and cookie signing (≥32 bytes). |
//! | `EMBEDDING_PROVIDER_KEY` | none | Absence disables embedding; memory writes route to the pending-vector queue. |
//! | `MCP_ENABLE_LEGACY_REST_ENDPOINTS` | `false` | Gates the `/mcp/call/:tool` REST shim. |
//! | `MCP_ENABLE_LEGACY_TOOL_TRANSLATION` | `true` | Enables legacy tool-name translation on `tools/call`. |
//! | `RUN_LOAD_TESTS` | `false` | Test-harness gate; extends the request deadline to 45s. |
//! | `RATE_LIMIT_*` | see [`RateLimitConfig`] | Per-principal bucket sizes. |
//! | `MEMORIA_TICK_RATE_SECS` | `5` | Daemon enrichment poll interval. |

use std::time::Duration;

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub unauth_per_min: u32,
    pub free_per_min: u32,
    pub paid_per_min: u32,
    pub mcp_per_min: u32,
    pub expensive_per_min: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            unauth_per_min: 20,
            free_per_min: 100,
            paid_per_min: 1000,
            mcp_per_min: 500,
            expensive_per_min: 100,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            unauth_per_min: env_u32("RATE_LIMIT_UNAUTH_PER_MIN", d.unauth_per_min),
            free_per_min: env_u32("RATE_LIMIT_FREE_PER_MIN", d.free_per_min),
            paid_per_min: env_u32("RATE_LIMIT_PAID_PER_MIN", d.paid_per_min),
            mcp_per_min: env_u32("RATE_LIMIT_MCP_PER_MIN", d.mcp_per_min),
            expensive_per_min: env_u32("RATE_LIMIT_EXPENSIVE_PER_MIN", d.expensive_per_min),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app_env: String,
    pub data_dir: std::path::PathBuf,
    pub session_secret: Option<String>,
    pub embedding_provider_key: Option<String>,
    pub legacy_rest_endpoints_enabled: bool,
    pub legacy_tool_translation_enabled: bool,
    pub load_tests_enabled: bool,
    pub rate_limit: RateLimitConfig,
    pub tick_rate: Duration,
}

impl Config {
    /// Loads configuration from the process environment. Call after `dotenvy::dotenv()`.
    pub fn load() -> Self {
        let data_dir = std::env::var("MEMORIA_DATA_DIR")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .unwrap_or_else(|_| "./data".to_string());
        let tick_rate_secs = env_u32("MEMORIA_TICK_RATE_SECS", 5).max(1) as u64;
        Self {
            app_env: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
            data_dir: std::path::PathBuf::from(data_dir),
            session_secret: std::env::var("SESSION_SECRET").ok(),
            embedding_provider_key: std::env::var("EMBEDDING_PROVIDER_KEY").ok(),
            legacy_rest_endpoints_enabled: env_bool("MCP_ENABLE_LEGACY_REST_ENDPOINTS", false),
            legacy_tool_translation_enabled: env_bool("MCP_ENABLE_LEGACY_TOOL_TRANSLATION", true),
            load_tests_enabled: env_bool("RUN_LOAD_TESTS", false),
            rate_limit: RateLimitConfig::from_env(),
            tick_rate: Duration::from_secs(tick_rate_secs),
        }
    }

    pub fn request_deadline(&self) -> Duration {
        if self.load_tests_enabled {
            Duration::from_secs(45)
        } else {
            Duration::from_secs(30)
        }
    }

    pub fn tenants_registry_path(&self) -> std::path::PathBuf {
        self.data_dir.join("tenants.db")
    }

    pub fn tenant_db_path(&self, namespace: &str) -> std::path::PathBuf {
        self.data_dir.join("tenants").join(format!("{namespace}.db"))
    }
}
