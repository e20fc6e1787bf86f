//! Helpers shared by the integration tests.

#![allow(dead_code)]

use bson::{doc, Document};
use mongo_do_ops::memory::MemoryDeployment;
use mongo_do_ops::{Binding, ClientOptions, MongoClient};
use std::future::Future;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

pub const DB: &str = "db";
pub const COLL: &str = "coll";

static TRACING: Once = Once::new();

/// Install a tracing subscriber honouring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Send `command` to `db` over a fresh connection.
pub async fn run(deployment: &MemoryDeployment, command: Document) -> Document {
    let source = deployment.connection_source().await.expect("connection source");
    let connection = source.connection().await.expect("connection");
    connection.command(DB, command).await.expect("command")
}

/// Insert documents `{_id: 0..count, x: 0..count}` into `db.coll`.
pub async fn seed(deployment: &MemoryDeployment, count: i32) {
    let documents: Vec<Document> = (0..count).map(|i| doc! { "_id": i, "x": i }).collect();
    if !documents.is_empty() {
        run(deployment, doc! { "insert": COLL, "documents": documents }).await;
    }
}

/// Create the capped collection `db.coll`.
pub async fn create_capped(deployment: &MemoryDeployment) {
    run(deployment, doc! { "create": COLL, "capped": true, "size": 1_048_576_i64 }).await;
}

/// A deployment holding `count` documents, with the seeding commands
/// cleared from its log.
pub async fn seeded(count: i32) -> MemoryDeployment {
    init_tracing();
    let deployment = MemoryDeployment::new();
    seed(&deployment, count).await;
    deployment.clear_commands();
    deployment
}

/// Drive `future` on a throwaway runtime, for tests of the blocking API.
pub fn block_on<F: Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
        .block_on(future)
}

/// Blocking variant of [`seeded`] for tests without an ambient runtime.
pub fn seeded_blocking(count: i32) -> MemoryDeployment {
    block_on(seeded(count))
}

/// A client over `deployment`.
pub fn client(deployment: &MemoryDeployment, options: ClientOptions) -> MongoClient {
    MongoClient::with_binding(Arc::new(deployment.clone()), options)
}

/// The `_id`s of a batch of `{_id: i32}` documents.
pub fn ids(batch: &[Document]) -> Vec<i32> {
    batch.iter().map(|d| d.get_i32("_id").expect("_id")).collect()
}

/// Poll until `counted` has exactly `expected` strong references.
pub fn wait_for_strong_count<T: ?Sized>(counted: &Arc<T>, expected: usize) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if Arc::strong_count(counted) == expected {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    Arc::strong_count(counted) == expected
}

/// Poll until `condition` holds.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Async variant of [`wait_for_strong_count`] that yields to other tasks.
pub async fn strong_count_reaches<T: ?Sized>(counted: &Arc<T>, expected: usize) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if Arc::strong_count(counted) == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Arc::strong_count(counted) == expected
}

/// Async variant of [`wait_until`].
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
