use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};

use crate::error::BuildError;

use super::BuildConfig;

pub const CONFIG_FILE_NAME: &str = "simetrio.toml";

/// `$XDG_CONFIG_HOME/simetrio/simetrio.toml`, used when no config file is given explicitly.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("simetrio").join(CONFIG_FILE_NAME))
}

/// Load the build config from `path`, or from the default location, or fall back to built-in defaults.
pub async fn load_config(path: Option<&Path>) -> Result<BuildConfig> {
    match path {
        Some(path) => {
            if !path.exists() {
                return Err(BuildError::NotFound(path.to_owned()).into());
            }
            load_config_from_file(path).await
        }
        None => match default_config_path() {
            Some(path) if path.exists() => load_config_from_file(&path).await,
            _ => {
                tracing::debug!("No config file found, using built-in defaults");
                Ok(BuildConfig::default())
            }
        },
    }
}

pub async fn load_config_from_file(path: &Path) -> Result<BuildConfig> {
    tracing::debug!("Loading build config from: {path:?}");

    let config = tokio::fs::read_to_string(path)
        .await
        .map_err(anyhow::Error::from)
        .and_then(|content| {
            toml::from_str::<BuildConfig>(&content).context("Failed to parse content as TOML")
        })
        .with_context(|| format!("Failed to load build config from: {path:?}"))?;

    // Relative paths in a config file are relative to the file, not to wherever we were started from.
    let base = path.parent().unwrap_or(Path::new("."));
    Ok(config.resolve_relative_to(base))
}

impl BuildConfig {
    pub fn resolve_relative_to(mut self, base: &Path) -> Self {
        if self.rootfs.is_relative() {
            self.rootfs = base.join(&self.rootfs);
        }
        if self.image.path.is_relative() {
            self.image.path = base.join(&self.image.path);
        }
        self
    }
}

#[cfg(test)]
pub mod tests {
    use anyhow::Result;

    use crate::config::Architecture;

    use super::*;

    #[tokio::test]
    async fn test_load_config_from_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(
            &path,
            r#"
arch = "arm64"
rootfs = "build/rootfs"

[image]
path = "/abs/out.img"
"#,
        )
        .await?;

        let config = load_config(Some(&path)).await?;
        assert_eq!(config.arch, Architecture::Arm64);
        assert_eq!(config.rootfs, dir.path().join("build/rootfs"));
        assert_eq!(config.image.path, PathBuf::from("/abs/out.img"));
        Ok(())
    }

    #[tokio::test]
    async fn test_load_missing_config() {
        let error = load_config(Some(Path::new("/nonexistent/simetrio.toml")))
            .await
            .unwrap_err();
        assert!(matches!(
            BuildError::find(&error),
            Some(BuildError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_load_broken_config() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(&path, "arch = [").await?;

        let error = load_config(Some(&path)).await.unwrap_err();
        assert!(format!("{error:#}").contains("Failed to load build config"));
        Ok(())
    }
}
