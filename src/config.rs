//! Configuration: INI server file plus command-line overrides
//!
//! The file carries the stable parts (identity, servers, sizing); the
//! command line carries the per-run parts (inputs, subject, groups).
//! Everything is validated before the engine starts.

use config::{File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

use crate::cli::Cli;
use crate::error::{ConfigError, Result};

/// File consulted when `--config` is not given, relative to `$HOME`.
pub const DEFAULT_CONFIG_FILE: &str = ".ul-nzb.conf";

const DEFAULT_MSGID_DOMAIN: &str = "ul-nzb";
const DEFAULT_MAX_RETRIES: u32 = 3;

/// How to reach one news server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls: bool,
    pub verify_certs: bool,
    pub connections: usize,
}

// Field names follow the lowercased form the config crate produces;
// aliases keep the file's natural capitalization working either way.
#[derive(Debug, Deserialize)]
struct GlobalSection {
    #[serde(alias = "From")]
    from: String,
    #[serde(alias = "ArticleSize")]
    articlesize: usize,
    #[serde(alias = "ArticleQueueSize")]
    articlequeuesize: usize,
    #[serde(alias = "OperationTimeout")]
    operationtimeout: u64,
    #[serde(alias = "MsgIdDomain")]
    msgiddomain: Option<String>,
    #[serde(alias = "MaxRetries")]
    maxretries: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    #[serde(alias = "Address")]
    address: String,
    #[serde(alias = "Port")]
    port: u16,
    #[serde(alias = "Username")]
    username: String,
    #[serde(alias = "Password")]
    password: String,
    #[serde(alias = "TLS")]
    tls: bool,
    #[serde(alias = "Connections")]
    connections: usize,
    #[serde(alias = "VerifyCerts")]
    verifycerts: Option<bool>,
}

/// Everything read from the INI file.
#[derive(Debug, Clone)]
pub struct FileConfig {
    pub from: String,
    pub article_size: usize,
    pub queue_size: usize,
    pub operation_timeout: Duration,
    pub msgid_domain: String,
    pub max_retries: u32,
    pub servers: Vec<ServerConfig>,
}

impl FileConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()).into());
        }

        let settings = config::Config::builder()
            .add_source(File::from(path).format(FileFormat::Ini))
            .build()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let mut root: config::Map<String, config::Value> = settings
            .try_deserialize()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let global_key = root
            .keys()
            .find(|name| name.eq_ignore_ascii_case("global"))
            .cloned()
            .ok_or(ConfigError::MissingGlobalSection)?;
        let global: GlobalSection = root
            .remove(&global_key)
            .expect("key taken from the map")
            .try_deserialize()
            .map_err(|e| ConfigError::ParseError(format!("[global]: {e}")))?;

        let mut names: Vec<String> = root
            .keys()
            .filter(|name| name.to_ascii_lowercase().starts_with("server"))
            .cloned()
            .collect();
        names.sort();

        let mut servers = Vec::with_capacity(names.len());
        for name in names {
            let section: ServerSection = root
                .remove(&name)
                .expect("key taken from the map")
                .try_deserialize()
                .map_err(|e| ConfigError::ParseError(format!("[{name}]: {e}")))?;

            if section.port == 0 {
                return Err(ConfigError::InvalidPort {
                    server: section.address,
                    port: section.port,
                }
                .into());
            }
            if section.connections == 0 {
                return Err(ConfigError::InvalidConnections {
                    server: section.address,
                    count: section.connections,
                }
                .into());
            }

            servers.push(ServerConfig {
                host: section.address,
                port: section.port,
                username: section.username,
                password: section.password,
                tls: section.tls,
                verify_certs: section.verifycerts.unwrap_or(false),
                connections: section.connections,
            });
        }

        if servers.is_empty() {
            return Err(ConfigError::NoServers.into());
        }
        if global.articlesize == 0 {
            return Err(ConfigError::Invalid {
                field: "ArticleSize".to_string(),
                reason: "must be at least 1 byte".to_string(),
            }
            .into());
        }
        if global.operationtimeout == 0 {
            return Err(ConfigError::Invalid {
                field: "OperationTimeout".to_string(),
                reason: "must be at least 1 second".to_string(),
            }
            .into());
        }

        Ok(Self {
            from: global.from,
            article_size: global.articlesize,
            queue_size: global.articlequeuesize,
            operation_timeout: Duration::from_secs(global.operationtimeout),
            msgid_domain: global
                .msgiddomain
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| DEFAULT_MSGID_DOMAIN.to_string()),
            max_retries: global.maxretries.unwrap_or(DEFAULT_MAX_RETRIES),
            servers,
        })
    }
}

/// The fully merged and validated configuration for one posting run.
#[derive(Debug, Clone)]
pub struct PostConfig {
    pub from: String,
    pub subject: String,
    pub article_size: usize,
    pub queue_size: usize,
    pub operation_timeout: Duration,
    pub msgid_domain: String,
    pub max_retries: u32,
    pub io_threads: usize,
    pub validate: bool,
    pub groups: Vec<String>,
    pub files: Vec<PathBuf>,
    pub nzb_output: Option<PathBuf>,
    pub servers: Vec<ServerConfig>,
}

impl PostConfig {
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = match &cli.config {
            Some(path) => path.clone(),
            None => default_config_path()?,
        };
        let file = FileConfig::load(&config_path)?;
        tracing::debug!("loaded configuration from {}", config_path.display());

        if cli.groups.is_empty() {
            return Err(ConfigError::NoGroups.into());
        }
        if !cli.raw {
            return Err(ConfigError::Invalid {
                field: "raw".to_string(),
                reason: "only raw yEnc posting is implemented".to_string(),
            }
            .into());
        }

        let subject = derive_subject(cli)?;
        let files = expand_inputs(&cli.files)?;

        Ok(Self {
            from: file.from,
            subject,
            article_size: cli.article_size.unwrap_or(file.article_size),
            queue_size: file.queue_size,
            operation_timeout: file.operation_timeout,
            msgid_domain: file.msgid_domain,
            max_retries: file.max_retries,
            io_threads: cli.iothreads.max(1),
            validate: cli.validate,
            groups: cli.groups.clone(),
            files,
            nzb_output: cli.output.clone(),
            servers: file.servers,
        })
    }
}

fn default_config_path() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_CONFIG_FILE))
        .ok_or_else(|| {
            ConfigError::Invalid {
                field: "config".to_string(),
                reason: "could not determine the home directory".to_string(),
            }
            .into()
        })
}

/// Without `--subject`, a single input lends its name; multiple inputs
/// need an explicit subject to identify the grouping.
fn derive_subject(cli: &Cli) -> Result<String> {
    if let Some(subject) = &cli.subject {
        return Ok(subject.clone());
    }
    if let [only] = cli.files.as_slice() {
        if let Some(name) = only.file_name() {
            return Ok(name.to_string_lossy().into_owned());
        }
    }
    Err(ConfigError::NoSubject.into())
}

/// Expand positional arguments: directories are walked recursively in
/// name order, regular files pass through, anything else is an error.
fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path).sort_by_file_name() {
                let entry = entry.map_err(|e| ConfigError::Invalid {
                    field: "file".to_string(),
                    reason: e.to_string(),
                })?;
                if entry.file_type().is_file() {
                    files.push(entry.into_path());
                }
            }
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            return Err(ConfigError::InputNotFound(path.clone()).into());
        }
    }
    Ok(files)
}
