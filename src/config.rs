//! Backend configuration parsed from a `nats://` URL.
//!
//! The repository path segment of the URL becomes the bucket: leading and
//! trailing slashes are stripped and the remaining slashes become dots, so
//! `nats://host/team/alpha/repo` addresses the `team.alpha.repo` queue
//! namespace on the bus.

use std::path::PathBuf;

use url::Url;

/// Upper bound on concurrent in-flight commands unless configured.
pub const DEFAULT_CONNECTIONS: usize = 5;

/// Port the bus listens on unless the URL names one.
pub const DEFAULT_PORT: u16 = 4222;

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid backend specification {0:?}: expected a nats:// URL")]
    InvalidScheme(String),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("URL {0:?} does not name a host")]
    MissingHost(String),

    #[error("URL {0:?} does not name a repository path")]
    MissingRepo(String),

    #[error("invalid value {value:?} for option {name:?}")]
    InvalidOption { name: String, value: String },
}

/// Everything needed to reach a repository over the bus.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: Url,
    /// Credential file handed to the bus client. Checked for existence
    /// before connecting.
    pub credential_file: Option<PathBuf>,
    /// Upper bound on concurrent in-flight commands.
    pub connections: usize,
    /// Repository bucket derived from the URL path.
    pub repo: String,
}

impl Config {
    /// Parse a `nats://host[:port]/repo-path[?options]` specification.
    ///
    /// Recognized query options: `credentialfile` (path) and
    /// `connections` (positive integer, default 5).
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        if !s.starts_with("nats:") {
            return Err(ConfigError::InvalidScheme(s.to_string()));
        }
        let server = Url::parse(s)?;
        if server.host_str().is_none() {
            return Err(ConfigError::MissingHost(s.to_string()));
        }

        let repo = server
            .path()
            .trim_start_matches('/')
            .trim_end_matches('/')
            .replace('/', ".");
        if repo.is_empty() {
            return Err(ConfigError::MissingRepo(s.to_string()));
        }

        let mut credential_file = None;
        let mut connections = DEFAULT_CONNECTIONS;
        for (name, value) in server.query_pairs() {
            match name.as_ref() {
                "credentialfile" => credential_file = Some(PathBuf::from(value.as_ref())),
                "connections" => {
                    connections = value.parse().ok().filter(|n: &usize| *n > 0).ok_or_else(
                        || ConfigError::InvalidOption {
                            name: name.to_string(),
                            value: value.to_string(),
                        },
                    )?;
                }
                _ => {
                    return Err(ConfigError::InvalidOption {
                        name: name.to_string(),
                        value: value.to_string(),
                    })
                }
            }
        }

        Ok(Self {
            server,
            credential_file,
            connections,
            repo,
        })
    }

    /// Connection URL for the bus client, with the port defaulted.
    pub fn server_url(&self) -> String {
        let host = self.server.host_str().unwrap_or_default();
        let port = self.server.port().unwrap_or(DEFAULT_PORT);
        format!("nats://{host}:{port}")
    }
}
