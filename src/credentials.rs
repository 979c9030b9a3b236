//! Bearer tokens per named scope.
//!
//! Interactive sign-in is someone else's job: these providers only read tokens
//! that already exist (environment, or an `az login` session).

use serde::Deserialize;
use std::collections::HashMap;
use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::{AuthConfig, CredentialSource};

pub const SEMANTIC_TOKEN_ENV: &str = "FABRIC_GATEWAY_SEMANTIC_TOKEN";
pub const SQL_TOKEN_ENV: &str = "FABRIC_GATEWAY_SQL_TOKEN";

/// Tokens are refreshed this long before they expire.
const EXPIRY_SKEW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenScope {
    /// Power BI REST + XMLA.
    SemanticQuery,
    /// Warehouse SQL endpoint.
    TabularQuery,
}

impl TokenScope {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenScope::SemanticQuery => "semantic-query",
            TokenScope::TabularQuery => "tabular-query",
        }
    }

    pub fn resource(self) -> &'static str {
        match self {
            TokenScope::SemanticQuery => "https://analysis.windows.net/powerbi/api",
            TokenScope::TabularQuery => "https://database.windows.net",
        }
    }

    fn env_var(self) -> &'static str {
        match self {
            TokenScope::SemanticQuery => SEMANTIC_TOKEN_ENV,
            TokenScope::TabularQuery => SQL_TOKEN_ENV,
        }
    }
}

pub trait CredentialProvider {
    fn token(&self, scope: TokenScope) -> Option<String>;

    /// Token packed as a pre-connect attribute: u32 LE byte length + UTF-16LE text.
    fn binary_token(&self, scope: TokenScope) -> Option<Vec<u8>> {
        self.token(scope).map(|t| encode_access_token(&t))
    }
}

pub fn encode_access_token(token: &str) -> Vec<u8> {
    let wide: Vec<u8> = token.encode_utf16().flat_map(u16::to_le_bytes).collect();
    let mut out = Vec::with_capacity(4 + wide.len());
    out.extend_from_slice(&(wide.len() as u32).to_le_bytes());
    out.extend_from_slice(&wide);
    out
}

/// Static tokens from `FABRIC_GATEWAY_SEMANTIC_TOKEN` / `FABRIC_GATEWAY_SQL_TOKEN`.
#[derive(Debug, Default)]
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn token(&self, scope: TokenScope) -> Option<String> {
        std::env::var(scope.env_var())
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzTokenResponse {
    access_token: String,
    /// Unix seconds; present on az >= 2.54.
    expires_on: Option<i64>,
}

/// Shells out to `az account get-access-token`. Tokens are cached per scope
/// until shortly before expiry.
#[derive(Debug, Default)]
pub struct AzureCliCredentials {
    tenant_id: Option<String>,
    cache: Mutex<HashMap<TokenScope, (String, SystemTime)>>,
}

impl AzureCliCredentials {
    pub fn new(tenant_id: Option<String>) -> Self {
        Self {
            tenant_id,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn fetch(&self, scope: TokenScope) -> Option<(String, SystemTime)> {
        let mut cmd = Command::new("az");
        cmd.args(["account", "get-access-token", "--resource", scope.resource(), "-o", "json"]);
        if let Some(tenant) = self.tenant_id.as_deref() {
            cmd.args(["--tenant", tenant]);
        }
        let output = match cmd.output() {
            Ok(o) => o,
            Err(e) => {
                tracing::debug!(error = %e, "az CLI not available");
                return None;
            }
        };
        if !output.status.success() {
            tracing::warn!(
                scope = scope.as_str(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "az account get-access-token failed"
            );
            return None;
        }
        let parsed: AzTokenResponse = serde_json::from_slice(&output.stdout).ok()?;
        let expires = parsed
            .expires_on
            .and_then(|s| u64::try_from(s).ok())
            .map(|s| UNIX_EPOCH + Duration::from_secs(s))
            .unwrap_or_else(|| SystemTime::now() + Duration::from_secs(30 * 60));
        Some((parsed.access_token, expires))
    }
}

impl CredentialProvider for AzureCliCredentials {
    fn token(&self, scope: TokenScope) -> Option<String> {
        let now = SystemTime::now();
        if let Ok(cache) = self.cache.lock() {
            if let Some((token, expires)) = cache.get(&scope) {
                if now + EXPIRY_SKEW < *expires {
                    return Some(token.clone());
                }
            }
        }
        let (token, expires) = self.fetch(scope)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(scope, (token.clone(), expires));
        }
        Some(token)
    }
}

/// First provider that yields a token wins.
pub struct ChainCredentials {
    providers: Vec<Box<dyn CredentialProvider + Send + Sync>>,
}

impl ChainCredentials {
    pub fn new(providers: Vec<Box<dyn CredentialProvider + Send + Sync>>) -> Self {
        Self { providers }
    }
}

impl CredentialProvider for ChainCredentials {
    fn token(&self, scope: TokenScope) -> Option<String> {
        self.providers.iter().find_map(|p| p.token(scope))
    }
}

pub fn provider_from_config(cfg: &AuthConfig) -> Box<dyn CredentialProvider + Send + Sync> {
    match cfg.provider {
        CredentialSource::Env => Box::new(EnvCredentials),
        CredentialSource::AzureCli => Box::new(AzureCliCredentials::new(cfg.tenant_id.clone())),
        CredentialSource::Chain => Box::new(ChainCredentials::new(vec![
            Box::new(EnvCredentials),
            Box::new(AzureCliCredentials::new(cfg.tenant_id.clone())),
        ])),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Fixed tokens for tests.
    pub struct StaticCredentials(pub Option<&'static str>);

    impl CredentialProvider for StaticCredentials {
        fn token(&self, _scope: TokenScope) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    #[test]
    fn binary_token_is_length_prefixed_utf16le() {
        let bytes = encode_access_token("ab");
        assert_eq!(bytes, vec![4, 0, 0, 0, b'a', 0, b'b', 0]);
    }

    #[test]
    fn binary_token_defaults_through_token() {
        let creds = StaticCredentials(Some("xyz"));
        let bytes = creds.binary_token(TokenScope::TabularQuery).unwrap();
        assert_eq!(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 6);
        assert_eq!(bytes.len(), 10);
        assert!(StaticCredentials(None).binary_token(TokenScope::TabularQuery).is_none());
    }

    #[test]
    fn chain_returns_first_hit() {
        let chain = ChainCredentials::new(vec![
            Box::new(StaticCredentials(None)),
            Box::new(StaticCredentials(Some("second"))),
            Box::new(StaticCredentials(Some("third"))),
        ]);
        assert_eq!(chain.token(TokenScope::SemanticQuery).as_deref(), Some("second"));
    }
}
