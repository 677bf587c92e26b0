use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::types::PeerCandidate;

/// Peers to seed the candidate source with, read from a TOML file of
/// `[[peers]]` tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapPeers {
    #[serde(default)]
    pub peers: Vec<PeerCandidate>,
}

impl BootstrapPeers {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading peers file {}", path.display()))?;
        let peers: Self = toml::from_str(&content)
            .with_context(|| format!("parsing peers file {}", path.display()))?;
        tracing::debug!(path = ?path, count = peers.peers.len(), "Loaded bootstrap peers");
        Ok(peers)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::types::{Network, PeerId};

    #[test]
    fn test_load_peers_file() -> testresult::TestResult {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            r#"
[[peers]]
id = "16Uiu2HAm1"
addrs = ["192.0.2.10:9000", "[2001:db8::1]:9000"]
network = "ipfs"

[[peers]]
id = "16Uiu2HAm2"
addrs = ["192.0.2.11:30303"]
"#
        )?;

        let loaded = BootstrapPeers::load(file.path())?;
        assert_eq!(loaded.peers.len(), 2);
        assert_eq!(loaded.peers[0].id, PeerId::new("16Uiu2HAm1"));
        assert_eq!(loaded.peers[0].addrs.len(), 2);
        assert_eq!(loaded.peers[0].network, Network::Ipfs);
        assert_eq!(loaded.peers[1].network, Network::Ethereum);
        Ok(())
    }

    #[test]
    fn test_malformed_peers_file() -> testresult::TestResult {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "[[peers]]\nid = 7")?;
        assert!(BootstrapPeers::load(file.path()).is_err());
        Ok(())
    }
}
