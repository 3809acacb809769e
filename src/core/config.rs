use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_presence_ttl_seconds() -> u64 {
    660
}

fn default_renewal_interval_seconds() -> u64 {
    220
}

fn default_prune_interval_seconds() -> u64 {
    30
}

fn default_reconnect_backoff_seconds() -> u64 {
    1
}

/// Tuning knobs for a presence manager.
///
/// Defaults give an eleven minute record TTL renewed three times per window,
/// which keeps a crashed manager's records from outliving it by more than a
/// TTL while the pruner usually reclaims them within seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    /// TTL applied to every presence record this manager writes.
    #[serde(default = "default_presence_ttl_seconds")]
    pub presence_ttl_seconds: u64,
    /// Period of the background job refreshing TTLs for local presences.
    #[serde(default = "default_renewal_interval_seconds")]
    pub renewal_interval_seconds: u64,
    /// Period of the dead-peer pruner.
    #[serde(default = "default_prune_interval_seconds")]
    pub prune_interval_seconds: u64,
    /// Delay before re-opening a dropped pub/sub session.
    #[serde(default = "default_reconnect_backoff_seconds")]
    pub reconnect_backoff_seconds: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            presence_ttl_seconds: default_presence_ttl_seconds(),
            renewal_interval_seconds: default_renewal_interval_seconds(),
            prune_interval_seconds: default_prune_interval_seconds(),
            reconnect_backoff_seconds: default_reconnect_backoff_seconds(),
        }
    }
}

impl PresenceConfig {
    /// Load configuration from a path resolved via ROSTER_CONFIG or defaults to
    /// `config/roster.toml`. Applies ROSTER_* field overrides after parsing.
    pub fn load_from_env() -> Result<Self> {
        let path = env_config_path();
        let mut cfg = Self::load(&path)?;
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        if is_json(path_ref) {
            Ok(serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?)
        } else {
            Ok(toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?)
        }
    }

    /// Validate schema-level invariants before startup.
    pub fn validate(&self) -> Result<()> {
        if self.presence_ttl_seconds == 0 {
            bail!("presence_ttl_seconds must be > 0");
        }
        if self.renewal_interval_seconds == 0 {
            bail!("renewal_interval_seconds must be > 0");
        }
        if self.renewal_interval_seconds >= self.presence_ttl_seconds {
            bail!("renewal_interval_seconds must be shorter than presence_ttl_seconds");
        }
        if self.prune_interval_seconds == 0 {
            bail!("prune_interval_seconds must be > 0");
        }
        if self.reconnect_backoff_seconds == 0 {
            bail!("reconnect_backoff_seconds must be > 0");
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(ttl) = std::env::var("ROSTER_PRESENCE_TTL_SECONDS") {
            self.presence_ttl_seconds = ttl
                .parse()
                .context("ROSTER_PRESENCE_TTL_SECONDS must be an integer")?;
        }
        if let Ok(renewal) = std::env::var("ROSTER_RENEWAL_INTERVAL_SECONDS") {
            self.renewal_interval_seconds = renewal
                .parse()
                .context("ROSTER_RENEWAL_INTERVAL_SECONDS must be an integer")?;
        }
        if let Ok(prune) = std::env::var("ROSTER_PRUNE_INTERVAL_SECONDS") {
            self.prune_interval_seconds = prune
                .parse()
                .context("ROSTER_PRUNE_INTERVAL_SECONDS must be an integer")?;
        }
        if let Ok(backoff) = std::env::var("ROSTER_RECONNECT_BACKOFF_SECONDS") {
            self.reconnect_backoff_seconds = backoff
                .parse()
                .context("ROSTER_RECONNECT_BACKOFF_SECONDS must be an integer")?;
        }
        Ok(())
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_seconds)
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_seconds)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_seconds)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_seconds)
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("ROSTER_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from("config/roster.toml")
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}
