use crate::error::{ConfigError, Result};
use std::env;

const DEFAULT_RPC_URL_TEMPLATE: &str = "https://{network}.g.alchemy.com/v2/{key}";
const DEFAULT_DATABASE_PATH: &str = "trust.db";

/// Process-level configuration. Loaded once at startup; missing or malformed
/// required values abort before any network or database work begins.
pub struct Config {
    pub rpc_url_template: String,
    pub rpc_api_key: String,
    pub database_path: String,
    pub api_port: Option<u16>,
}

fn validate_http_url(name: &str, raw: &str) -> Result<()> {
    let parsed = raw.parse::<reqwest::Url>().map_err(|e| {
        ConfigError::Invalid(format!("{name} must be a valid URL, got `{raw}`: {e}"))
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::Invalid(format!(
            "{name} must use http(s) scheme, got `{other}`"
        ))
        .into()),
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let rpc_api_key = env::var("RPC_API_KEY")
            .map_err(|_| ConfigError::Missing("RPC_API_KEY must be set".to_string()))?;
        if rpc_api_key.trim().is_empty() {
            return Err(ConfigError::Invalid("RPC_API_KEY is empty".to_string()).into());
        }

        let rpc_url_template = env::var("RPC_URL_TEMPLATE")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_RPC_URL_TEMPLATE.to_string());
        if !rpc_url_template.contains("{network}") || !rpc_url_template.contains("{key}") {
            return Err(ConfigError::Invalid(format!(
                "RPC_URL_TEMPLATE must contain {{network}} and {{key}} placeholders, got `{rpc_url_template}`"
            ))
            .into());
        }
        // Probe-expand once so a malformed template fails at startup, not mid-scan.
        let probe = rpc_url_template
            .replace("{network}", "eth-mainnet")
            .replace("{key}", &rpc_api_key);
        validate_http_url("RPC_URL_TEMPLATE", &probe)?;

        let database_path = env::var("DATABASE_PATH")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string());

        let api_port = match env::var("API_PORT") {
            Ok(raw) => Some(raw.trim().parse::<u16>().map_err(|_| {
                ConfigError::Invalid(format!("API_PORT must be a valid u16, got `{raw}`"))
            })?),
            Err(_) => None,
        };

        Ok(Self {
            rpc_url_template,
            rpc_api_key,
            database_path,
            api_port,
        })
    }

    /// Expand the provider URL for one chain's network slug.
    pub fn rpc_url(&self, network: &str) -> String {
        self.rpc_url_template
            .replace("{network}", network)
            .replace("{key}", &self.rpc_api_key)
    }
}
