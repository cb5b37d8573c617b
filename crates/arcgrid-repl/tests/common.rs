//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arcgrid_bus::{InMemoryTransport, ReplicaId, ReplicaKind};
use arcgrid_repl::client::Replica;
use arcgrid_repl::{CollectionConfig, GridConfig, GridCoordinator, ReplicaConfig, SimulatedPillar};

/// Wait used for replies that are expected to arrive.
pub const TIMEOUT: Duration = Duration::from_secs(2);

/// Wait used when a pillar is known to stay silent.
pub const SHORT: Duration = Duration::from_millis(200);

/// Collection holding every configured replica.
pub const COLLECTION: &str = "books";

/// Grid configuration with one collection spanning all replicas.
pub fn grid_config(bit_archives: &[&str], checksum_archives: &[&str], max_failures: usize) -> GridConfig {
    let mut replicas = Vec::new();
    for id in bit_archives {
        replicas.push(ReplicaConfig {
            id: ReplicaId::new(*id),
            kind: ReplicaKind::BitArchive,
            name: None,
        });
    }
    for id in checksum_archives {
        replicas.push(ReplicaConfig {
            id: ReplicaId::new(*id),
            kind: ReplicaKind::ChecksumArchive,
            name: None,
        });
    }
    let pillar_ids = replicas.iter().map(|r| r.id.clone()).collect();
    GridConfig {
        environment: "TEST".to_string(),
        replicas,
        collections: vec![CollectionConfig {
            id: COLLECTION.to_string(),
            pillar_ids,
            max_failures,
        }],
        reply_timeout_ms: TIMEOUT.as_millis() as u64,
        max_correction_attempts: 2,
        batch_max_failures: 0,
    }
}

/// A coordinator with one simulated pillar per configured replica, all in
/// one process over an in-memory transport.
pub struct TestGrid {
    pub transport: Arc<InMemoryTransport>,
    pub grid: GridCoordinator,
    pillars: BTreeMap<String, SimulatedPillar>,
}

impl TestGrid {
    /// Start the coordinator and the pillars. Needs a tokio runtime.
    pub fn start(config: GridConfig) -> Self {
        let transport = Arc::new(InMemoryTransport::new());
        let grid = GridCoordinator::new(config.clone(), transport.clone()).unwrap();
        let mut pillars = BTreeMap::new();
        for r in &config.replicas {
            let pillar = Self::spawn_pillar(&grid, r.id.as_str(), r.kind);
            pillars.insert(r.id.as_str().to_string(), pillar);
        }
        Self {
            transport,
            grid,
            pillars,
        }
    }

    /// Start another instance of an already configured replica.
    pub fn spawn_instance(&self, id: &str) -> SimulatedPillar {
        let kind = self.pillar(id).replica().kind();
        Self::spawn_pillar(&self.grid, id, kind)
    }

    fn spawn_pillar(grid: &GridCoordinator, id: &str, kind: ReplicaKind) -> SimulatedPillar {
        let ctx = grid.context().clone();
        let replica = Replica::new(ReplicaId::new(id), kind, &ctx.channels);
        SimulatedPillar::start(replica, ctx).unwrap()
    }

    /// The first instance of a replica.
    pub fn pillar(&self, id: &str) -> &SimulatedPillar {
        &self.pillars[id]
    }

    /// Every first instance, by replica id.
    pub fn pillars(&self) -> impl Iterator<Item = (&String, &SimulatedPillar)> {
        self.pillars.iter()
    }
}

/// Replica id shorthand.
pub fn rid(id: &str) -> ReplicaId {
    ReplicaId::new(id)
}

/// Poll `cond` until it holds or [`TIMEOUT`] elapses. Returns whether it held.
pub async fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
