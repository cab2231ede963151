use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use directories::ProjectDirs;

pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
    pub remote: Option<RemoteSettings>,
}

/// Where the authoritative store lives and the public key used to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSettings {
    pub url: String,
    pub anon_key: String,
}

impl RemoteSettings {
    /// Both halves or neither; half a configuration is a mistake worth
    /// reporting rather than silently running offline.
    pub fn from_parts(url: Option<String>, anon_key: Option<String>) -> Result<Option<Self>> {
        let url = url.filter(|u| !u.trim().is_empty());
        let anon_key = anon_key.filter(|k| !k.trim().is_empty());
        match (url, anon_key) {
            (None, None) => Ok(None),
            (Some(url), Some(anon_key)) => {
                let url = url.trim().trim_end_matches('/').to_string();
                if !(url.starts_with("https://") || url.starts_with("http://")) {
                    bail!("Remote URL must start with http:// or https://, got '{url}'");
                }
                Ok(Some(Self {
                    url,
                    anon_key: anon_key.trim().to_string(),
                }))
            }
            (Some(_), None) => bail!("FIELDSYNC_ANON_KEY (--anon-key) is required with a remote URL"),
            (None, Some(_)) => bail!("FIELDSYNC_REMOTE_URL (--remote-url) is required with an anon key"),
        }
    }
}

impl Config {
    pub fn load(
        db_override: Option<PathBuf>,
        remote_url: Option<String>,
        anon_key: Option<String>,
    ) -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "fieldsync").context("Could not determine home directory")?;

        let data_dir = proj_dirs.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let db_path = db_override.unwrap_or_else(|| data_dir.join("fieldsync.db"));
        let remote = RemoteSettings::from_parts(remote_url, anon_key)?;

        Ok(Config {
            db_path,
            data_dir,
            remote,
        })
    }
}
