use std::path::PathBuf;

use crate::paths;

pub const DEFAULT_MAX_LOG_ENTRIES: usize = 100;
pub const DEFAULT_WORKERS: usize = 2;

#[derive(Clone, Default, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub daemon: Option<DaemonConfig>,
    pub downloader: Option<DownloaderConfig>,
}

#[derive(Clone, Default, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DaemonConfig {
    #[serde(default)]
    pub debug: bool,
    pub workers: Option<usize>,
    pub max_log_entries: Option<usize>,
}

#[derive(Clone, Default, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DownloaderConfig {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub default_format: Option<String>,
    pub download_dir: Option<PathBuf>,
}

impl Config {
    /// Retention bound: how many non-running historical jobs to keep.
    pub fn max_log_entries(&self) -> usize {
        self.daemon
            .as_ref()
            .and_then(|d| d.max_log_entries)
            .unwrap_or(DEFAULT_MAX_LOG_ENTRIES)
    }

    pub fn workers(&self) -> usize {
        self.daemon
            .as_ref()
            .and_then(|d| d.workers)
            .unwrap_or(DEFAULT_WORKERS)
            .max(1)
    }

    pub fn downloader_command(&self) -> &str {
        self.downloader
            .as_ref()
            .and_then(|d| d.command.as_deref())
            .unwrap_or("yt-dlp")
    }

    pub fn downloader_args(&self) -> &[String] {
        self.downloader
            .as_ref()
            .map(|d| d.args.as_slice())
            .unwrap_or(&[])
    }

    pub fn default_format(&self) -> &str {
        self.downloader
            .as_ref()
            .and_then(|d| d.default_format.as_deref())
            .unwrap_or("")
    }

    pub fn download_dir(&self) -> anyhow::Result<PathBuf> {
        match self.downloader.as_ref().and_then(|d| d.download_dir.clone()) {
            Some(dir) => Ok(dir),
            None => paths::download_dir(),
        }
    }
}

pub fn load() -> anyhow::Result<Config> {
    let path = paths::config_dir()?.join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_sections_absent() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.max_log_entries(), DEFAULT_MAX_LOG_ENTRIES);
        assert_eq!(config.workers(), DEFAULT_WORKERS);
        assert_eq!(config.downloader_command(), "yt-dlp");
        assert_eq!(config.default_format(), "");
    }

    #[test]
    fn parses_kebab_case_keys() {
        let config: Config = toml::from_str(
            r#"
            [daemon]
            workers = 4
            max-log-entries = 25

            [downloader]
            command = "youtube-dl"
            args = ["--no-color"]
            default-format = "bestvideo"
            "#,
        )
        .unwrap();

        assert_eq!(config.workers(), 4);
        assert_eq!(config.max_log_entries(), 25);
        assert_eq!(config.downloader_command(), "youtube-dl");
        assert_eq!(config.downloader_args(), ["--no-color".to_string()]);
        assert_eq!(config.default_format(), "bestvideo");
    }

    #[test]
    fn workers_floor_is_one() {
        let config: Config = toml::from_str("[daemon]\nworkers = 0\n").unwrap();
        assert_eq!(config.workers(), 1);
    }
}
