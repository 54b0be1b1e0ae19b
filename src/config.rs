//! Configuration file handling for the archiver.

use crate::error::Error;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Whole archiver configuration: a `[global]` section plus one section per stage.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: Global,
    #[serde(default)]
    pub archive: Option<StageSettings>,
    #[serde(default)]
    pub storage: Option<StageSettings>,
}

/// Settings shared by every stage.
#[derive(Debug, Clone, Deserialize)]
pub struct Global {
    #[serde(default = "Global::default_loglevel")]
    pub loglevel: String,
    #[serde(default)]
    pub hostname: Option<String>,
    /// Skip the drain gate on shutdown.
    #[serde(default)]
    pub nowait: bool,
    /// Seconds a relay socket operation may block.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Seconds between two coordinator polls of the stage threads.
    #[serde(default = "Global::default_granularity")]
    pub granularity: u64,
    /// Use the Date header instead of the receive time when it parses.
    #[serde(default)]
    pub trustdate: bool,
    #[serde(default, deserialize_with = "deserialize_sequence")]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub quotafile: Option<PathBuf>,
    #[serde(default)]
    pub virtualmap: Option<PathBuf>,
    #[serde(default)]
    pub aliasesmap: Option<PathBuf>,
    /// Seconds between two reloads of the quota and mailbox tables.
    #[serde(default = "Global::default_refresh")]
    pub refresh: u64,
    #[serde(default = "Global::default_max_message_size")]
    pub max_message_size: usize,
    /// Days a dedup record is kept; 0 keeps records forever.
    #[serde(default = "Global::default_retention")]
    pub retention: u64,
}

impl Default for Global {
    fn default() -> Self {
        Self {
            loglevel: Self::default_loglevel(),
            hostname: None,
            nowait: false,
            timeout: None,
            granularity: Self::default_granularity(),
            trustdate: false,
            whitelist: Vec::new(),
            quotafile: None,
            virtualmap: None,
            aliasesmap: None,
            refresh: Self::default_refresh(),
            max_message_size: Self::default_max_message_size(),
            retention: Self::default_retention(),
        }
    }
}

impl Global {
    fn default_loglevel() -> String {
        "info".to_string()
    }
    const fn default_granularity() -> u64 {
        10
    }
    const fn default_refresh() -> u64 {
        300
    }
    const fn default_max_message_size() -> usize {
        31457280
    }
    const fn default_retention() -> u64 {
        30
    }
}

/// Raw `[archive]` / `[storage]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StageSettings {
    pub input: String,
    pub output: String,
    pub backend: String,
    pub hashdb: PathBuf,
    #[serde(default)]
    pub storagedir: Option<PathBuf>,
}

/// Custom deserializer to parse comma-separated strings into [`Vec<String>`].
fn deserialize_sequence<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: Option<String> = Deserialize::deserialize(deserializer)?;
    Ok(match s {
        Some(v) => v
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        None => Vec::new(),
    })
}

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        Self::from_ini(&content)
    }

    /// Parse configuration from INI text.
    pub fn from_ini(content: &str) -> Result<Self, Error> {
        Ok(serini::from_str(content)?)
    }

    /// Name this host announces in greetings.
    pub fn hostname(&self) -> String {
        self.global
            .hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Resolve the settings of one stage, `None` if the section is absent.
    pub fn stage(&self, kind: StageKind) -> Result<Option<StageConfig>, Error> {
        let settings = match kind {
            StageKind::Archive => self.archive.as_ref(),
            StageKind::Storage => self.storage.as_ref(),
        };
        let Some(settings) = settings else {
            return Ok(None);
        };

        let input: Endpoint = settings.input.parse()?;
        if input.protocol == Protocol::Debug {
            return Err(Error::UnknownProtocol {
                stage: kind.to_string(),
                protocol: input.protocol.to_string(),
            });
        }
        let output: Endpoint = settings.output.parse()?;

        Ok(Some(StageConfig {
            kind,
            input,
            output,
            backend: settings.backend.trim().to_lowercase(),
            hashdb: settings.hashdb.clone(),
            storagedir: settings.storagedir.clone(),
            hostname: self.hostname(),
            nowait: self.global.nowait,
            timeout: self.global.timeout.map(Duration::from_secs),
            trust_date: self.global.trustdate,
            max_message_size: self.global.max_message_size,
            retention: (self.global.retention > 0)
                .then(|| Duration::from_secs(self.global.retention.saturating_mul(86400))),
        }))
    }
}

/// The two proxy roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// First hop: extracts metadata, assigns the archive id.
    Archive,
    /// Second hop: stores messages already stamped by the archive stage.
    Storage,
}

impl StageKind {
    pub const ALL: [StageKind; 2] = [StageKind::Archive, StageKind::Storage];

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Archive => "archive",
            StageKind::Storage => "storage",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable binding of everything one stage needs.
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub kind: StageKind,
    pub input: Endpoint,
    pub output: Endpoint,
    pub backend: String,
    pub hashdb: PathBuf,
    pub storagedir: Option<PathBuf>,
    pub hostname: String,
    pub nowait: bool,
    pub timeout: Option<Duration>,
    pub trust_date: bool,
    pub max_message_size: usize,
    /// Age after which dedup records are dropped, `None` to keep them.
    pub retention: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Lmtp,
    Smtp,
    /// Output only: accept everything without contacting a next hop.
    Debug,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Lmtp => "lmtp",
            Protocol::Smtp => "smtp",
            Protocol::Debug => "debug",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketAddress::Tcp { host, port } => write!(f, "{host}:{port}"),
            SocketAddress::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// A `protocol:address` pair as written in the stage sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub address: SocketAddress,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.address)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || Error::BadEndpoint(s.to_string());
        let s = s.trim();

        let (protocol, rest) = match s.split_once(':') {
            Some((protocol, rest)) => (protocol, Some(rest)),
            None => (s, None),
        };
        let protocol = match protocol.to_lowercase().as_str() {
            "lmtp" => Protocol::Lmtp,
            "smtp" => Protocol::Smtp,
            "debug" => Protocol::Debug,
            _ => return Err(bad()),
        };

        let address = match rest {
            None if protocol == Protocol::Debug => SocketAddress::Tcp {
                host: "localhost".to_string(),
                port: 0,
            },
            None => return Err(bad()),
            Some(rest) => {
                if let Some(path) = rest.strip_prefix("unix:") {
                    if path.is_empty() {
                        return Err(bad());
                    }
                    SocketAddress::Unix(PathBuf::from(path))
                } else {
                    let (host, port) = rest.rsplit_once(':').ok_or_else(bad)?;
                    if host.is_empty() {
                        return Err(bad());
                    }
                    SocketAddress::Tcp {
                        host: host.to_string(),
                        port: port.parse().map_err(|_| bad())?,
                    }
                }
            }
        };

        Ok(Endpoint { protocol, address })
    }
}
