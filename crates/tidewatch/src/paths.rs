use directories::ProjectDirs;
use eyre::ContextCompat as _;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct TidewatchPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_file: PathBuf,
}

const LOG_FILE_NAME: &str = "tidewatch.log.jsonl";

impl TidewatchPaths {
    pub fn discover() -> eyre::Result<Self> {
        Self::from_overrides(
            std::env::var_os("TIDEWATCH_CONFIG_DIR").map(PathBuf::from),
            std::env::var_os("TIDEWATCH_DATA_DIR").map(PathBuf::from),
        )
    }

    /// Explicit directories win; whichever is missing comes from the platform defaults
    /// (`~/.config/tidewatch` on Linux, `~/Library/Application Support/tidewatch` on macOS).
    pub fn from_overrides(
        config_dir: Option<PathBuf>,
        data_dir: Option<PathBuf>,
    ) -> eyre::Result<Self> {
        let (config_dir, data_dir) = match (config_dir, data_dir) {
            (Some(c), Some(d)) => (c, d),
            (c, d) => {
                let proj = ProjectDirs::from("", "", "tidewatch")
                    .context("failed to resolve project dirs")?;
                (
                    c.unwrap_or_else(|| proj.config_dir().to_path_buf()),
                    d.unwrap_or_else(|| proj.data_dir().to_path_buf()),
                )
            }
        };
        let log_file = data_dir.join(LOG_FILE_NAME);
        Ok(Self {
            config_dir,
            data_dir,
            log_file,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dirs_are_used_verbatim() -> eyre::Result<()> {
        let p = TidewatchPaths::from_overrides(
            Some(PathBuf::from("/tmp/tw-cfg")),
            Some(PathBuf::from("/tmp/tw-data")),
        )?;
        assert_eq!(p.config_file(), PathBuf::from("/tmp/tw-cfg/config.toml"));
        assert_eq!(p.log_file, PathBuf::from("/tmp/tw-data/tidewatch.log.jsonl"));
        Ok(())
    }
}
