//! Telemetry utilities: span constructors and clock pretty-printing.

use meshsync_proto::{ReplicaId, VectorClock};
use std::collections::BTreeMap;

/// Human-friendly names for replica ids, used only when printing clocks.
///
/// Built explicitly by whoever wants readable logs; nothing registers into
/// it behind the caller's back.
#[derive(Debug, Clone, Default)]
pub struct PeerNames {
    names: BTreeMap<ReplicaId, String>,
}

impl PeerNames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer under the last three characters of its id.
    pub fn register(&mut self, id: &ReplicaId) -> &mut Self {
        self.names.insert(id.clone(), id.short().to_string());
        self
    }

    /// Register a peer under an explicit name.
    pub fn insert(&mut self, id: ReplicaId, name: impl Into<String>) -> &mut Self {
        self.names.insert(id, name.into());
        self
    }

    pub fn get(&self, id: &ReplicaId) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }
}

impl<'a> FromIterator<&'a ReplicaId> for PeerNames {
    fn from_iter<I: IntoIterator<Item = &'a ReplicaId>>(iter: I) -> Self {
        let mut names = Self::new();
        for id in iter {
            names.register(id);
        }
        names
    }
}

/// Render a clock as `[abc:1 xyz:2]`, in replica order.
///
/// Entries for unnamed replicas fall back to their short id.
pub fn pretty_clock(names: &PeerNames, clock: &VectorClock) -> String {
    let parts: Vec<String> = clock
        .iter()
        .map(|(id, counter)| {
            let name = names.get(id).unwrap_or_else(|| id.short());
            format!("{name}:{counter}")
        })
        .collect();
    format!("[{}]", parts.join(" "))
}

/// Standardized span constructors for replication observability.
pub mod spans {
    use tracing::{Span, info_span};

    /// Create a span for one replication session with a peer.
    pub fn session(collaboration: &str, peer: &str, role: &str) -> Span {
        info_span!("session", collaboration = %collaboration, peer = %peer, role = %role)
    }

    /// Create a span for a connection reconciliation pass.
    pub fn reconcile(collaboration: &str, local: &str) -> Span {
        info_span!("reconcile", collaboration = %collaboration, local = %local)
    }
}
