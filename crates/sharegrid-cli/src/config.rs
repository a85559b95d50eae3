//! grid.toml parser.
//!
//! ```toml
//! [encoding]
//! needed = 3
//! happy = 7
//! total = 10
//!
//! [timeouts]
//! query = "5s"
//! negotiate = "30s"
//!
//! [[servers]]
//! id = "v0-alpha"
//! state = "writable"
//! capacity = 1048576
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use sharegrid_placement::{Candidate, EncodingParams, SelectorConfig};
use sharegrid_storage::{Availability, MemoryStorageServer};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    #[serde(default)]
    pub encoding: EncodingConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodingConfig {
    pub needed: u32,
    pub happy: u32,
    pub total: u32,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        let params = EncodingParams::default();
        Self {
            needed: params.needed,
            happy: params.happy,
            total: params.total,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    pub query: Option<String>,
    pub negotiate: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    #[serde(default)]
    pub state: ServerMode,
    /// Bytes the server will store. Unlimited when absent.
    pub capacity: Option<u64>,
    /// Accept every reservation and run out of room on write.
    pub overcommit: Option<bool>,
}

/// How a simulated server behaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerMode {
    #[default]
    Writable,
    ReadOnly,
    Full,
    Offline,
    Hanging,
}

impl GridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let config: GridConfig = toml::from_str(&content)
            .with_context(|| format!("cannot parse {}", path.display()))?;
        Ok(config)
    }

    /// Check everything that parsing alone does not.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.encoding().validate()?;
        self.selector_config()?;

        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.id.is_empty() {
                bail!("server id must not be empty");
            }
            if !seen.insert(server.id.as_str()) {
                bail!("duplicate server id {:?}", server.id);
            }
        }
        Ok(())
    }

    pub fn encoding(&self) -> EncodingParams {
        EncodingParams::new(self.encoding.needed, self.encoding.happy, self.encoding.total)
    }

    pub fn selector_config(&self) -> anyhow::Result<SelectorConfig> {
        let mut config = SelectorConfig::default();
        if let Some(query) = &self.timeouts.query {
            config = config.with_query_timeout(timeout("query", query)?);
        }
        if let Some(negotiate) = &self.timeouts.negotiate {
            config = config.with_negotiate_timeout(timeout("negotiate", negotiate)?);
        }
        Ok(config)
    }

    /// One in-memory server per `[[servers]]` entry.
    pub fn candidates(&self) -> Vec<Candidate<MemoryStorageServer>> {
        self.servers
            .iter()
            .map(|entry| Candidate::new(entry.id.clone(), Arc::new(entry.build())))
            .collect()
    }
}

impl ServerConfig {
    fn build(&self) -> MemoryStorageServer {
        let mut server = MemoryStorageServer::new();
        if let Some(capacity) = self.capacity {
            server = server.with_capacity(capacity);
        }
        if self.overcommit.unwrap_or(false) {
            server = server.overcommitting();
        }
        match self.state {
            ServerMode::Writable => server,
            ServerMode::ReadOnly => server.read_only(),
            ServerMode::Full => server.with_capacity(0),
            ServerMode::Offline => server.with_availability(Availability::Offline),
            ServerMode::Hanging => server.with_availability(Availability::Hanging),
        }
    }
}

fn timeout(name: &str, value: &str) -> anyhow::Result<Duration> {
    parse_duration(value).with_context(|| format!("invalid {name} timeout {value:?}"))
}

/// Parse a duration string like "5s", "500ms", "2m", or a plain number
/// of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
