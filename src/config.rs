use serde::Deserialize;
use std::{collections::HashMap, fs, net::SocketAddr, path::Path, path::PathBuf, time::Duration};

/// How a request body of unknown length is presented to the script.
#[derive(Debug, Default, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChunkedBodyMode {
    /// Read the whole body first so `CONTENT_LENGTH` can be set.
    #[default]
    Buffer,
    /// Pipe it through as it arrives; `CONTENT_LENGTH` is left unset and the
    /// script reads until end of input.
    Stream,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    pub server_name: Option<String>,
    #[serde(default = "default_software")]
    pub server_software: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    pub max_processes: Option<usize>,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: u64,
    #[serde(default)]
    pub chunked_body: ChunkedBodyMode,
    #[serde(default = "default_pass_env")]
    pub pass_env: Vec<String>,
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouteConfig {
    pub prefix: String,
    pub root: PathBuf,
    /// Extension (with the leading dot) to interpreter. When empty, scripts
    /// are executed directly.
    #[serde(default)]
    pub interpreters: HashMap<String, PathBuf>,
    pub timeout_secs: Option<u64>,
    pub working_dir: Option<PathBuf>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_software() -> String {
    format!("cgi-gateway/{}", env!("CARGO_PKG_VERSION"))
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_kill_grace_ms() -> u64 {
    1000
}

fn default_max_body_size() -> u64 {
    10 * 1024 * 1024
}

fn default_pass_env() -> Vec<String> {
    vec!["PATH".to_string()]
}

fn default_routes() -> Vec<RouteConfig> {
    vec![RouteConfig::new("/", "./cgi-bin")]
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: default_listen(),
            server_name: None,
            server_software: default_software(),
            timeout_secs: default_timeout_secs(),
            kill_grace_ms: default_kill_grace_ms(),
            max_processes: None,
            max_body_size: default_max_body_size(),
            chunked_body: ChunkedBodyMode::default(),
            pass_env: default_pass_env(),
            routes: default_routes(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: Config = if content.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.routes.is_empty() {
            return Err("at least one route is required".to_string());
        }
        if self.timeout_secs == 0 {
            return Err("timeout_secs must be positive".to_string());
        }
        for route in &self.routes {
            if !route.prefix.starts_with('/') {
                return Err(format!("route prefix {:?} must start with '/'", route.prefix));
            }
            if route.timeout_secs == Some(0) {
                return Err(format!("route {:?} has a zero timeout", route.prefix));
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl RouteConfig {
    pub fn new(prefix: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        RouteConfig {
            prefix: prefix.into(),
            root: root.into(),
            interpreters: HashMap::new(),
            timeout_secs: None,
            working_dir: None,
        }
    }
}
