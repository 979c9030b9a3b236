use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment override for the state directory (config.yaml, context.json).
pub const HOME_ENV: &str = "FABRIC_GATEWAY_HOME";
/// Environment override for an explicit config file path.
pub const CONFIG_ENV: &str = "FABRIC_GATEWAY_CONFIG";

/// Resource limits that keep tool output small enough for an agent's context window.
///
/// Loaded once per process and never mutated afterwards. Every listing or sampling
/// operation clamps to these values, whatever the caller asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_dax_rows: usize,
    pub max_tables_in_context: usize,
    pub max_columns_per_table: usize,
    pub sample_rows: usize,
    pub max_sql_result_rows: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_dax_rows: 1000,
            max_tables_in_context: 50,
            max_columns_per_table: 100,
            sample_rows: 10,
            max_sql_result_rows: 500,
        }
    }
}

impl Limits {
    /// Clamp a caller-requested row count to `cap`. `None` means "as many as allowed".
    pub fn clamp(requested: Option<u64>, cap: usize) -> usize {
        match requested {
            Some(n) => (n.min(cap as u64) as usize).max(1),
            None => cap,
        }
    }
}

/// Which credential sources are consulted for bearer tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    /// Environment variables first, then the Azure CLI.
    Chain,
    Env,
    AzureCli,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub provider: CredentialSource,
    /// Passed to `az account get-access-token --tenant` when set.
    pub tenant_id: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            provider: CredentialSource::Chain,
            tenant_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Upper bound for any single remote call (HTTP round-trip, SQL connect, SQL query).
    pub timeout_secs: u64,
    pub powerbi_api_base: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            powerbi_api_base: "https://api.powerbi.com/v1.0/myorg".to_string(),
        }
    }
}

/// XMLA write-back. Disabled by default: many capacities reject XMLA over plain
/// HTTPS, in which case write tools still return the generated TMSL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct XmlaConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    pub port: u16,
    pub trust_server_certificate: bool,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            port: 1433,
            trust_server_certificate: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub auth: AuthConfig,
    pub limits: Limits,
    pub network: NetworkConfig,
    pub xmla: XmlaConfig,
    pub warehouse: WarehouseConfig,
}

/// `$FABRIC_GATEWAY_HOME`, or `~/.fabric-gateway`.
pub fn state_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fabric-gateway")
}

fn config_candidates(cwd: &Path, state_dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        out.push(PathBuf::from(p));
    }
    out.push(cwd.join("config.yaml"));
    out.push(state_dir.join("config.yaml"));
    out
}

/// Load the first config.yaml found. A missing or unparsable file yields defaults
/// so the server can always start and report problems through its tools.
pub fn load_config(cwd: &Path, state_dir: &Path) -> Config {
    for path in config_candidates(cwd, state_dir) {
        let Ok(text) = std::fs::read_to_string(&path) else { continue };
        match serde_yaml::from_str::<Config>(&text) {
            Ok(cfg) => {
                tracing::debug!(path = %path.display(), "loaded config");
                return cfg;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unparsable config");
                return Config::default();
            }
        }
    }
    Config::default()
}
