use std::fmt;
use std::str::FromStr;

use nodectl_common::protocol::{NodectlError, Result};
use nodectl_common::transport::Endpoint;
use serde::{Deserialize, Serialize};

/// A node to run a command on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeTarget {
    pub node: String,
    pub endpoint: Endpoint,
}

impl NodeTarget {
    pub fn new(node: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            node: node.into(),
            endpoint,
        }
    }

    /// Parses `name=endpoint`, or a bare endpoint named after its socket path.
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('=') {
            Some((node, endpoint)) => {
                let node = node.trim();
                if node.is_empty() {
                    return Err(NodectlError::InvalidEndpoint(format!(
                        "'{}': empty node name",
                        s
                    )));
                }
                Ok(Self::new(node, Endpoint::parse(endpoint)?))
            }
            None => {
                let endpoint = Endpoint::parse(s)?;
                Ok(Self::new(endpoint.path().display().to_string(), endpoint))
            }
        }
    }
}

impl fmt::Display for NodeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.node, self.endpoint)
    }
}

impl FromStr for NodeTarget {
    type Err = NodectlError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
