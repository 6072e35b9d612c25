use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

use serde::Deserialize;
use serde::Serialize;
use tokio::fs::create_dir_all;
use tokio::fs::OpenOptions;
use tracing::warn;

use crate::{error::Error, picker::END_GAME_THRESHOLD};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Downloading pieces above which end game starts.
    pub end_game_threshold: usize,
    /// How many blocks are requested from a peer at once.
    pub request_queue: usize,
    /// Seconds without an answer before a peer's requests are aborted.
    pub block_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            end_game_threshold: END_GAME_THRESHOLD,
            request_queue: 3,
            block_timeout_secs: 60,
        }
    }
}

impl Config {
    /// Path of the configuration file, at the user's config folder, which we
    /// get from their environmental variables.
    ///
    /// # Errors
    ///
    /// If the user does not have a home folder, or if we can't create the
    /// config folder inside of it.
    pub async fn config_path() -> Result<PathBuf, Error> {
        let dotfile =
            ProjectDirs::from("", "", "Asino").ok_or(Error::HomeInvalid)?;
        let mut config_path = dotfile.config_dir().to_path_buf();

        if !config_path.exists() {
            create_dir_all(&config_path).await.map_err(|_| {
                Error::FolderOpenError(config_path.display().to_string())
            })?
        }

        config_path.push("config.toml");

        Ok(config_path)
    }

    /// Load the configuration file at the default path.
    pub async fn load() -> Result<Self, Error> {
        let path = Self::config_path().await?;
        Self::load_from(path).await
    }

    /// Load the configuration file and transform it into Self.
    /// If the file does not exist, is empty or is not valid toml, it is
    /// written again with the default configuration.
    pub async fn load_from(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;

        let mut dst = String::new();
        file.read_to_string(&mut dst).await?;

        if !dst.trim().is_empty() {
            match toml::from_str::<Config>(&dst) {
                Ok(config) => return Ok(config),
                Err(e) => warn!("invalid config file, writing defaults: {e}"),
            }
        }

        let config = Config::default();
        tokio::fs::write(path, toml::to_string(&config)?).await?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{distributions::Alphanumeric, Rng};

    fn tmp_path() -> PathBuf {
        let name: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        std::env::temp_dir().join(format!("asino-{name}.toml"))
    }

    #[tokio::test]
    async fn writes_defaults_when_missing() -> Result<(), Error> {
        let path = tmp_path();

        let config = Config::load_from(&path).await?;
        assert_eq!(config, Config::default());

        let written = tokio::fs::read_to_string(&path).await?;
        assert!(written.contains("end_game_threshold = 4"));

        tokio::fs::remove_file(&path).await?;
        Ok(())
    }

    #[tokio::test]
    async fn partial_file_uses_defaults_for_the_rest() -> Result<(), Error> {
        let path = tmp_path();
        tokio::fs::write(&path, "request_queue = 8\n").await?;

        let config = Config::load_from(&path).await?;
        assert_eq!(config.request_queue, 8);
        assert_eq!(config.end_game_threshold, END_GAME_THRESHOLD);

        tokio::fs::remove_file(&path).await?;
        Ok(())
    }

    #[tokio::test]
    async fn invalid_file_is_replaced() -> Result<(), Error> {
        let path = tmp_path();
        tokio::fs::write(&path, "request_queue = [not toml").await?;

        let config = Config::load_from(&path).await?;
        assert_eq!(config, Config::default());

        let again = Config::load_from(&path).await?;
        assert_eq!(again, Config::default());

        tokio::fs::remove_file(&path).await?;
        Ok(())
    }
}
