use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::connection::ReconnectPolicy;
use crate::correlator::CorrelatorConfig;
use crate::scanner::ScanTokens;
use crate::telemetry::DEFAULT_LOG_CAPACITY;
use crate::types::SourceLocator;

/// Client settings, read from `eserver.json`. Every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// `host:port` of the remote executor.
    pub endpoint: String,
    /// Locators scanned at startup (and on every rescan).
    pub sources: Vec<String>,
    pub register_timeout_ms: u64,
    pub execute_timeout_ms: u64,
    pub reconnect: ReconnectConfig,
    pub rescan_interval_ms: Option<u64>,
    pub log_capacity: usize,
    pub max_outstanding: Option<usize>,
    pub tokens: ScanTokens,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectConfig {
    pub delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:7420".to_string(),
            sources: Vec::new(),
            register_timeout_ms: 5000,
            execute_timeout_ms: 10_000,
            reconnect: ReconnectConfig::default(),
            rescan_interval_ms: None,
            log_capacity: DEFAULT_LOG_CAPACITY,
            max_outstanding: None,
            tokens: ScanTokens::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay_ms: 3000,
            multiplier: 1.0,
            max_delay_ms: 30_000,
        }
    }
}

impl ClientConfig {
    /// Load from the resolved config file, or defaults when there is none.
    pub fn load() -> anyhow::Result<Self> {
        match resolve_config_path() {
            Some(path) => Self::from_path(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let cfg: ClientConfig = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg.expand())
    }

    fn validate(&self) -> anyhow::Result<()> {
        let tokens = [
            ("registerNextLine", &self.tokens.register_next_line),
            ("begin", &self.tokens.begin),
            ("end", &self.tokens.end),
        ];
        for (name, token) in tokens {
            if token.trim().is_empty() {
                anyhow::bail!("scan token `{}` must not be empty", name);
            }
        }
        Ok(())
    }

    fn expand(mut self) -> Self {
        self.endpoint = expand_env_vars(&self.endpoint);
        self.sources = self.sources.into_iter().map(|s| expand_env_vars(&s)).collect();
        self
    }

    pub fn source_locators(&self) -> Vec<SourceLocator> {
        self.sources.iter().map(|s| SourceLocator::new(s.as_str())).collect()
    }

    pub fn correlator(&self) -> CorrelatorConfig {
        CorrelatorConfig {
            register_timeout: Duration::from_millis(self.register_timeout_ms),
            execute_timeout: Duration::from_millis(self.execute_timeout_ms),
            max_outstanding: self.max_outstanding,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_millis(self.reconnect.delay_ms),
            multiplier: self.reconnect.multiplier,
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
        }
    }

    pub fn rescan_interval(&self) -> Option<Duration> {
        self.rescan_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// `ESERVER_CONFIG`, then `$XDG_CONFIG_HOME/eserver/eserver.json`, then `./eserver.json`.
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("ESERVER_CONFIG") {
        return Some(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("eserver").join("eserver.json");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let candidate = PathBuf::from("eserver.json");
    candidate.exists().then_some(candidate)
}

/// Replace `${NAME}` with the environment value; unknown names are left as-is.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}
