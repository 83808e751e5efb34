#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use pawtrack_core::db::{KvStore, MemoryKvStore};
use pawtrack_core::models::{Pet, ServiceKind};
use pawtrack_core::remote::InMemoryRemoteStore;
use pawtrack_core::{
    Booking, BookingStatus, ConnState, EngineConfig, ManualConnectivity, SyncEngine,
    VisitTimeline,
};

pub fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
}

/// Server clock the test moves by hand
#[derive(Clone)]
pub struct TestClock(Arc<Mutex<DateTime<Utc>>>);

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self(Arc::new(Mutex::new(start)))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock().unwrap() = now;
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

pub struct Harness {
    pub engine: SyncEngine,
    pub remote: Arc<InMemoryRemoteStore>,
    pub connectivity: Arc<ManualConnectivity>,
    pub clock: TestClock,
}

impl Harness {
    pub async fn online() -> Self {
        Self::start(ConnState::Reachable, Arc::new(MemoryKvStore::new())).await
    }

    pub async fn offline() -> Self {
        Self::start(ConnState::Unreachable, Arc::new(MemoryKvStore::new())).await
    }

    pub async fn start(state: ConnState, kv: Arc<dyn KvStore>) -> Self {
        let clock = TestClock::new(at(9, 0));
        let server_clock = clock.clone();
        let remote = Arc::new(InMemoryRemoteStore::with_clock(move || server_clock.now()));
        Self::with_remote(state, kv, remote, clock).await
    }

    pub async fn with_remote(
        state: ConnState,
        kv: Arc<dyn KvStore>,
        remote: Arc<InMemoryRemoteStore>,
        clock: TestClock,
    ) -> Self {
        let connectivity = Arc::new(ManualConnectivity::new(state));
        let engine = SyncEngine::open(
            EngineConfig::default(),
            remote.clone(),
            connectivity.clone(),
            kv,
        )
        .await
        .unwrap();
        Self {
            engine,
            remote,
            connectivity,
            clock,
        }
    }
}

pub fn morning_visit() -> VisitTimeline {
    VisitTimeline::scheduled(at(10, 0), at(11, 0)).unwrap()
}

pub fn walk(owner: &str) -> Booking {
    Booking {
        owner_id: owner.to_string(),
        sitter_id: None,
        pet: Pet {
            name: "Biscuit".to_string(),
            species: "dog".to_string(),
        },
        service: ServiceKind::Walk,
        starts_at: at(10, 0),
        ends_at: at(11, 0),
        status: BookingStatus::Requested,
        notes: None,
    }
}

/// Poll `condition` until it holds, failing after a few seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition did not hold in time");
}
