use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::net::UnixStream;

use crate::protocol::error::{NodectlError, Result};

const UNIX_SCHEME: &str = "unix://";
const UNIX_OPAQUE: &str = "unix:";

/// Address of a node agent's unix socket.
///
/// Accepted forms:
///
/// - `unix:///run/agent.sock`
/// - `unix:relative/agent.sock`
/// - `/run/agent.sock` (bare path)
///
/// Network schemes are rejected: the agent is a node-local service and the
/// transport carries no authentication of its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    path: PathBuf,
}

impl Endpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn parse(addr: &str) -> Result<Self> {
        let addr = addr.trim();
        let path = if let Some(rest) = addr.strip_prefix(UNIX_SCHEME) {
            rest
        } else if let Some(rest) = addr.strip_prefix(UNIX_OPAQUE) {
            rest
        } else if addr.contains("://") {
            return Err(NodectlError::InvalidEndpoint(format!(
                "'{}': only unix sockets are supported",
                addr
            )));
        } else {
            addr
        };

        if path.is_empty() {
            return Err(NodectlError::InvalidEndpoint(format!(
                "'{}': missing socket path",
                addr
            )));
        }

        Ok(Self::new(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens a stream to the socket.
    pub async fn connect(&self) -> std::io::Result<UnixStream> {
        UnixStream::connect(&self.path).await
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", UNIX_SCHEME, self.path.display())
    }
}

impl FromStr for Endpoint {
    type Err = NodectlError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unix_url() {
        let ep = Endpoint::parse("unix:///run/agent.sock").unwrap();
        assert_eq!(ep.path(), Path::new("/run/agent.sock"));
        assert_eq!(ep.to_string(), "unix:///run/agent.sock");
    }

    #[test]
    fn test_parse_opaque_and_bare() {
        assert_eq!(
            Endpoint::parse("unix:agent.sock").unwrap().path(),
            Path::new("agent.sock")
        );
        assert_eq!(
            Endpoint::parse("/var/run/agent.sock").unwrap().path(),
            Path::new("/var/run/agent.sock")
        );
    }

    #[test]
    fn test_parse_rejects_network_schemes() {
        assert!(matches!(
            Endpoint::parse("tcp://10.0.0.1:50000"),
            Err(NodectlError::InvalidEndpoint(_))
        ));
        assert!(Endpoint::parse("https://node").is_err());
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(Endpoint::parse("").is_err());
        assert!(Endpoint::parse("unix://").is_err());
    }

    #[tokio::test]
    async fn test_connect_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ep = Endpoint::new(dir.path().join("absent.sock"));
        assert!(ep.connect().await.is_err());
    }
}
