use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::relay::Rule;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

/// Precedence: explicit `--config` flag, then `RELAYD_CONFIG`, then a
/// `relaykit.{toml,yaml,yml}` discovered in the current directory, then the
/// OS's per-user config directory.
pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os("RELAYD_CONFIG") {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }
    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for candidate in ["relaykit.toml", "relaykit.yaml", "relaykit.yml"] {
        let p = dir.join(candidate);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no relaykit.* found in {}", dir.display())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    let proj = ProjectDirs::from("io", "relaykit", "relaykit")
        .context("config: resolve user config dir")?;
    Ok(proj.config_dir().join("relaykit.toml"))
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let text = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&text).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&text).with_context(|| format!("parse yaml {}", path.display()))?
        }
        other => anyhow::bail!("config: unsupported config extension {other:?}"),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub rules: Vec<Rule>,
    pub logging: LoggingConfig,
    pub metrics_addr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let logging = fc.logging.unwrap_or_default();
        Ok(Config {
            rules: fc.rules,
            logging: LoggingConfig {
                level: logging.level.unwrap_or_else(|| "info".to_string()),
                format: logging.format.unwrap_or_else(|| "pretty".to_string()),
                output: logging.output.unwrap_or_else(|| "stderr".to_string()),
            },
            metrics_addr: fc.metrics_addr,
        })
    }
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    #[serde(default)]
    rules: Vec<Rule>,
    logging: Option<FileLogging>,
    metrics_addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RuleProtocol;

    #[test]
    fn from_file_config_applies_defaults() {
        let fc = FileConfig {
            rules: vec![Rule {
                id: "r1".into(),
                name: "r1".into(),
                src: ":8080".into(),
                dst: "127.0.0.1:80".into(),
                protocol: RuleProtocol::Tcp,
                enabled: true,
            }],
            logging: None,
            metrics_addr: None,
        };
        let cfg = Config::from_file_config(fc).unwrap();
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.rules.len(), 1);
    }
}
