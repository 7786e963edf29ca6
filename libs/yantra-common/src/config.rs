// Connection settings shared by the worker and the CLI

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_STAGING_ROOT: &str = "/var/lib/yantra/staging";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub redis_url: String,
    pub staging_root: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()),
            staging_root: std::env::var("YANTRA_STAGING_ROOT")
                .unwrap_or_else(|_| DEFAULT_STAGING_ROOT.to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            staging_root: DEFAULT_STAGING_ROOT.to_string(),
        }
    }
}
