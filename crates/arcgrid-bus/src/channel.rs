//! Named channels and the registry that hands them out.
//!
//! A channel is either a broadcast topic (every subscriber receives its own copy)
//! or a point-to-point queue (exactly one of the competing subscribers receives
//! each message). Channels are looked up by role and never duplicated: asking the
//! registry twice for the same role yields the same channel.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

/// The kind of storage node a replica runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReplicaKind {
    /// Stores full file payloads.
    BitArchive,
    /// Stores checksums only.
    ChecksumArchive,
}

impl ReplicaKind {
    /// Short code used in channel names.
    pub fn code(&self) -> &'static str {
        match self {
            ReplicaKind::BitArchive => "BA",
            ReplicaKind::ChecksumArchive => "CS",
        }
    }
}

impl fmt::Display for ReplicaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaKind::BitArchive => write!(f, "bitarchive"),
            ReplicaKind::ChecksumArchive => write!(f, "checksumarchive"),
        }
    }
}

/// Identifier of one configured replica (pillar).
///
/// Ids are case-insensitive: they are stored ASCII lower-cased, so `KB` and
/// `kb` name the same replica and the same channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ReplicaId(String);

impl ReplicaId {
    /// Create a replica id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().to_ascii_lowercase())
    }

    /// The normalised id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ReplicaId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<ReplicaId> for String {
    fn from(id: ReplicaId) -> Self {
        id.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Delivery semantics of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    /// One message reaches every subscriber.
    Broadcast,
    /// One message reaches exactly one of the subscribers.
    PointToPoint,
}

/// What a channel is for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelRole {
    /// Every application instance serving a replica.
    All { kind: ReplicaKind, replica: ReplicaId },
    /// Any one application instance serving a replica.
    Any { kind: ReplicaKind, replica: ReplicaId },
    /// The coordinating monitor of a replica.
    Monitor { replica: ReplicaId },
    /// Well-known reply address of the central repository.
    Repos,
    /// Catch-all for undeliverable error reports.
    Error,
    /// Private reply address of one caller.
    ReplyTo { caller: String },
}

impl ChannelRole {
    /// Broadcast for `All`, point-to-point for everything else.
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelRole::All { .. } => ChannelKind::Broadcast,
            _ => ChannelKind::PointToPoint,
        }
    }

    /// Same role with the caller name lower-cased, so that two roles share a
    /// cache entry exactly when they share a channel name.
    fn normalized(self) -> Self {
        match self {
            ChannelRole::ReplyTo { caller } => ChannelRole::ReplyTo {
                caller: caller.to_ascii_lowercase(),
            },
            other => other,
        }
    }

    fn name_suffix(&self) -> String {
        match self {
            ChannelRole::All { kind, replica } => {
                format!("ALL_{}_{}", kind.code(), replica.as_str().to_ascii_uppercase())
            }
            ChannelRole::Any { kind, replica } => {
                format!("ANY_{}_{}", kind.code(), replica.as_str().to_ascii_uppercase())
            }
            ChannelRole::Monitor { replica } => {
                format!("MONITOR_{}", replica.as_str().to_ascii_uppercase())
            }
            ChannelRole::Repos => "REPOS".to_string(),
            ChannelRole::Error => "ERROR".to_string(),
            ChannelRole::ReplyTo { caller } => format!("REPLY_{}", caller.to_ascii_uppercase()),
        }
    }
}

/// An immutable, named message endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel {
    name: String,
    kind: ChannelKind,
    role: ChannelRole,
}

impl Channel {
    /// Unique channel name, `<ENV>_<ROLE>`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Delivery semantics.
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Role this channel was created for.
    pub fn role(&self) -> &ChannelRole {
        &self.role
    }

    /// True for broadcast channels.
    pub fn is_broadcast(&self) -> bool {
        self.kind == ChannelKind::Broadcast
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Hands out one channel per role within an environment.
#[derive(Debug)]
pub struct ChannelRegistry {
    environment: String,
    channels: Mutex<HashMap<ChannelRole, Channel>>,
}

impl ChannelRegistry {
    /// Create an empty registry for an environment (e.g. "PROD", "TEST").
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into().to_uppercase(),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Environment prefix used in channel names.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// The channel for a role, created on first lookup.
    pub fn get(&self, role: ChannelRole) -> Channel {
        let role = role.normalized();
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(role.clone())
            .or_insert_with(|| Channel {
                name: format!("{}_{}", self.environment, role.name_suffix()),
                kind: role.kind(),
                role,
            })
            .clone()
    }

    /// Broadcast channel reaching every instance of a replica.
    pub fn all(&self, kind: ReplicaKind, replica: &ReplicaId) -> Channel {
        self.get(ChannelRole::All {
            kind,
            replica: replica.clone(),
        })
    }

    /// Queue reaching any one instance of a replica.
    pub fn any(&self, kind: ReplicaKind, replica: &ReplicaId) -> Channel {
        self.get(ChannelRole::Any {
            kind,
            replica: replica.clone(),
        })
    }

    /// Queue reaching the monitor of a replica.
    pub fn monitor(&self, replica: &ReplicaId) -> Channel {
        self.get(ChannelRole::Monitor {
            replica: replica.clone(),
        })
    }

    /// The repository's reply address.
    pub fn repos(&self) -> Channel {
        self.get(ChannelRole::Repos)
    }

    /// The catch-all error channel.
    pub fn error(&self) -> Channel {
        self.get(ChannelRole::Error)
    }

    /// A private reply address for a named caller.
    pub fn reply_to(&self, caller: &str) -> Channel {
        self.get(ChannelRole::ReplyTo {
            caller: caller.to_string(),
        })
    }

    /// Number of distinct channels handed out so far.
    pub fn len(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// True if no channel has been looked up yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}


#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_distinct_replicas_never_share_a_channel(
            a in "[a-z0-9]{1,8}",
            b in "[a-z0-9]{1,8}",
        ) {
            prop_assume!(a != b);
            let reg = ChannelRegistry::new("test");
            let (a, b) = (ReplicaId::new(a), ReplicaId::new(b));
            for kind in [ReplicaKind::BitArchive, ReplicaKind::ChecksumArchive] {
                let (all_a, all_b) = (reg.all(kind, &a), reg.all(kind, &b));
                prop_assert_ne!(all_a.name(), all_b.name());
                let (any_a, any_b) = (reg.any(kind, &a), reg.any(kind, &b));
                prop_assert_ne!(any_a.name(), any_b.name());
            }
            let (mon_a, mon_b, repos) = (reg.monitor(&a), reg.monitor(&b), reg.repos());
            prop_assert_ne!(mon_a.name(), mon_b.name());
            prop_assert_ne!(mon_a.name(), repos.name());
        }
    }
}
