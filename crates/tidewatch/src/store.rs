use crate::{
    config::{is_builtin_chain, TidewatchConfig},
    paths::TidewatchPaths,
};
use eyre::Context as _;
use std::{fs, path::PathBuf};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

const RPC_ENV_PREFIX: &str = "TIDEWATCH_RPC_";

/// Apply environment overrides (API keys, price endpoint, per-chain RPC URLs).
///
/// `TIDEWATCH_RPC_<CHAIN>` sets the primary RPC of chain `<chain>` (lowercased, `_` -> `-`).
fn apply_env_overrides(cfg: &mut TidewatchConfig, vars: impl IntoIterator<Item = (String, String)>) {
    for (k, v) in vars {
        let v = v.trim();
        if v.is_empty() {
            continue;
        }
        match k.as_str() {
            "TIDEWATCH_EXPLORER_API_KEY" => cfg.http.explorer_api_key = Some(v.to_owned()),
            "TIDEWATCH_PRICE_API_KEY" => cfg.http.price_api_key = Some(v.to_owned()),
            "TIDEWATCH_PRICE_BASE_URL" => v.clone_into(&mut cfg.http.price_api_base_url),
            other => {
                if let Some(chain) = other.strip_prefix(RPC_ENV_PREFIX) {
                    let chain = chain.to_ascii_lowercase().replace('_', "-");
                    // An env var alone cannot define a chain (it needs an id and a native
                    // currency), so it only retargets chains that already exist.
                    if !is_builtin_chain(&chain) && !cfg.chains.contains_key(&chain) {
                        warn!(env = other, %chain, "ignoring rpc override for unknown chain");
                        continue;
                    }
                    cfg.chains.entry(chain).or_default().rpc_url = Some(v.to_owned());
                }
            }
        }
    }
}

impl ConfigStore {
    pub fn new(paths: &TidewatchPaths) -> Self {
        Self {
            path: paths.config_file(),
        }
    }

    /// Load `config.toml`, writing the defaults on first run. Environment overrides are applied
    /// after loading and are never written back.
    pub fn load_or_init_default(&self) -> eyre::Result<TidewatchConfig> {
        let mut cfg = if self.path.exists() {
            let s = fs::read_to_string(&self.path).context("read config.toml")?;
            toml::from_str(&s).context("parse config.toml")?
        } else {
            let cfg = TidewatchConfig::default();
            self.save(&cfg)?;
            cfg
        };
        apply_env_overrides(&mut cfg, std::env::vars());
        Ok(cfg)
    }

    pub fn save(&self, cfg: &TidewatchConfig) -> eyre::Result<()> {
        let s = toml::to_string_pretty(cfg).context("serialize config.toml")?;
        crate::fsutil::write_atomic(&self.path, &s).context("write config.toml")
    }
}
