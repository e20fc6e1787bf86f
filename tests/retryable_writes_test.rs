//! Retry behaviour of writes and reads against the in-memory deployment.

mod common;

use async_trait::async_trait;
use bson::{doc, Document};
use common::{client, seed, seeded, COLL, DB};
use mongo_do_ops::memory::{FailAction, FailPoint, MemoryDeployment};
use mongo_do_ops::{
    Acknowledgment, Binding, ClientOptions, Collection, Connection, ConnectionDescription,
    ConnectionSource, MongoError, Result, ServerType, WriteRequest,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn users(deployment: &MemoryDeployment) -> Collection<Document> {
    users_with(deployment, ClientOptions::default())
}

fn users_with(deployment: &MemoryDeployment, options: ClientOptions) -> Collection<Document> {
    client(deployment, options).database(DB).collection_with_doc(COLL)
}

fn fail_once(deployment: &MemoryDeployment, command: &str, action: FailAction) {
    deployment.configure_fail_point(FailPoint::fail_command(&[command], action).times(1));
}

// ============================================================================
// Retryable writes
// ============================================================================

#[tokio::test]
async fn test_insert_retried_after_network_error() {
    let deployment = seeded(0).await;
    fail_once(&deployment, "insert", FailAction::close_connection());

    let users = users(&deployment);
    users.insert_one(doc! { "name": "ada" }).await.unwrap();

    let inserts = deployment.commands_named("insert");
    assert_eq!(inserts.len(), 2);
    assert_eq!(inserts[0].get_i64("txnNumber").unwrap(), 1);
    assert_eq!(inserts[1].get_i64("txnNumber").unwrap(), 1);
    assert_eq!(inserts[0].get_document("lsid").unwrap(), inserts[1].get_document("lsid").unwrap());
    assert_eq!(
        inserts[0].get_array("documents").unwrap(),
        inserts[1].get_array("documents").unwrap()
    );
    assert_eq!(users.count_documents(None).await.unwrap(), 1);
}

#[tokio::test]
async fn test_retry_of_applied_write_is_not_applied_twice() {
    let deployment = seeded(0).await;
    fail_once(&deployment, "insert", FailAction::close_connection_after_apply());

    let users = users(&deployment);
    let result = users.insert_one(doc! { "_id": 7, "name": "ada" }).await.unwrap();

    assert_eq!(result.inserted_id, bson::Bson::Int32(7));
    assert_eq!(deployment.commands_named("insert").len(), 2);
    assert_eq!(users.count_documents(None).await.unwrap(), 1);
}

#[tokio::test]
async fn test_retry_writes_disabled() {
    let deployment = seeded(0).await;
    fail_once(&deployment, "insert", FailAction::close_connection());

    let users = users_with(&deployment, ClientOptions::builder().retry_writes(false).build());
    let err = users.insert_one(doc! { "name": "ada" }).await.unwrap_err();

    assert!(err.is_network_error());
    let inserts = deployment.commands_named("insert");
    assert_eq!(inserts.len(), 1);
    assert!(inserts[0].contains_key("lsid"));
    assert!(!inserts[0].contains_key("txnNumber"));
}

#[tokio::test]
async fn test_retryable_write_error_label_is_retried() {
    let deployment = seeded(0).await;
    fail_once(&deployment, "insert", FailAction::error(91, &["RetryableWriteError"]));

    users(&deployment).insert_one(doc! { "name": "ada" }).await.unwrap();

    assert_eq!(deployment.commands_named("insert").len(), 2);
}

#[tokio::test]
async fn test_non_transient_error_is_not_retried() {
    let deployment = seeded(0).await;
    fail_once(&deployment, "insert", FailAction::error(2, &[]));

    let err = users(&deployment).insert_one(doc! { "name": "ada" }).await.unwrap_err();

    assert_eq!(err.code(), Some(2));
    assert_eq!(deployment.commands_named("insert").len(), 1);
}

#[tokio::test]
async fn test_no_writes_performed_surfaces_first_error() {
    let deployment = seeded(0).await;
    fail_once(&deployment, "insert", FailAction::close_connection());
    fail_once(
        &deployment,
        "insert",
        FailAction::error(91, &["RetryableWriteError", "NoWritesPerformed"]),
    );

    let err = users(&deployment).insert_one(doc! { "name": "ada" }).await.unwrap_err();

    assert!(err.is_network_error());
    assert_eq!(deployment.commands_named("insert").len(), 2);
}

#[tokio::test]
async fn test_second_error_surfaces_when_both_attempts_were_sent() {
    let deployment = seeded(0).await;
    fail_once(&deployment, "insert", FailAction::close_connection());
    fail_once(&deployment, "insert", FailAction::error(91, &["RetryableWriteError"]));

    let err = users(&deployment).insert_one(doc! { "name": "ada" }).await.unwrap_err();

    assert_eq!(err.code(), Some(91));
    assert_eq!(deployment.commands_named("insert").len(), 2);
}

#[tokio::test]
async fn test_checkout_failure_is_retried() {
    let deployment = seeded(0).await;
    deployment.configure_fail_point(FailPoint::checkout_failure().times(1));

    users(&deployment).insert_one(doc! { "name": "ada" }).await.unwrap();

    let inserts = deployment.commands_named("insert");
    assert_eq!(inserts.len(), 1);
    assert_eq!(inserts[0].get_i64("txnNumber").unwrap(), 1);
}

#[tokio::test]
async fn test_checkout_failure_on_both_attempts() {
    let deployment = seeded(0).await;
    deployment.configure_fail_point(FailPoint::checkout_failure().times(2));

    let err = users(&deployment).insert_one(doc! { "name": "ada" }).await.unwrap_err();

    assert!(err.is_acquisition_failure());
    assert!(deployment.commands_named("insert").is_empty());
}

#[tokio::test]
async fn test_standalone_sends_no_txn_number() {
    let deployment = MemoryDeployment::standalone();
    let users = users(&deployment);
    users.insert_one(doc! { "name": "ada" }).await.unwrap();

    fail_once(&deployment, "insert", FailAction::close_connection());
    let err = users.insert_one(doc! { "name": "grace" }).await.unwrap_err();

    assert!(err.is_network_error());
    let inserts = deployment.commands_named("insert");
    assert_eq!(inserts.len(), 2);
    assert!(inserts.iter().all(|insert| !insert.contains_key("txnNumber")));
}

#[tokio::test]
async fn test_multi_document_update_is_not_retried() {
    let deployment = seeded(3).await;
    let users = users(&deployment);

    fail_once(&deployment, "update", FailAction::close_connection());
    let err = users
        .update_many(doc! {}, doc! { "$set": { "seen": true } })
        .await
        .unwrap_err();
    assert!(err.is_network_error());
    let updates = deployment.commands_named("update");
    assert_eq!(updates.len(), 1);
    assert!(!updates[0].contains_key("txnNumber"));

    deployment.clear_commands();
    fail_once(&deployment, "update", FailAction::close_connection());
    let result = users
        .update_one(doc! { "_id": 1 }, doc! { "$set": { "seen": true } })
        .await
        .unwrap();
    assert_eq!(result.matched_count, 1);
    assert_eq!(deployment.commands_named("update").len(), 2);
}

#[tokio::test]
async fn test_unacknowledged_write_is_not_retried() {
    let deployment = seeded(0).await;
    fail_once(&deployment, "insert", FailAction::close_connection());

    let options = ClientOptions::builder().w(Acknowledgment::Nodes(0)).build();
    let err = users_with(&deployment, options)
        .insert_one(doc! { "name": "ada" })
        .await
        .unwrap_err();

    assert!(err.is_network_error());
    let inserts = deployment.commands_named("insert");
    assert_eq!(inserts.len(), 1);
    assert!(!inserts[0].contains_key("lsid"));
    assert_eq!(inserts[0].get_document("writeConcern").unwrap(), &doc! { "w": 0 });
}

#[tokio::test]
async fn test_write_concern_error_is_reported_not_retried() {
    let deployment = seeded(0).await;
    let users = users(&deployment);

    fail_once(
        &deployment,
        "insert",
        FailAction::write_concern_error(64, "waiting for replication timed out"),
    );
    let err = users.insert_one(doc! { "_id": 1 }).await.unwrap_err();
    assert!(matches!(err, MongoError::WriteConcern { code: 64, .. }));
    assert_eq!(deployment.commands_named("insert").len(), 1);

    fail_once(
        &deployment,
        "insert",
        FailAction::write_concern_error(64, "waiting for replication timed out"),
    );
    let result = users
        .bulk_write(vec![WriteRequest::insert(doc! { "_id": 2 })], true)
        .await
        .unwrap();
    assert_eq!(result.inserted_count, 1);
    assert_eq!(result.write_concern_errors.len(), 1);
    assert_eq!(result.write_concern_errors[0].code, 64);
    assert_eq!(users.count_documents(None).await.unwrap(), 2);
}

#[tokio::test]
async fn test_each_write_command_gets_its_own_txn_number() {
    let deployment = MemoryDeployment::builder().max_write_batch_size(2).build();
    let users = users(&deployment);

    let documents: Vec<Document> = (0..5).map(|i| doc! { "_id": i }).collect();
    let result = users.insert_many(documents).await.unwrap();
    assert_eq!(result.inserted_ids.len(), 5);

    let inserts = deployment.commands_named("insert");
    let txn_numbers: Vec<i64> = inserts.iter().map(|c| c.get_i64("txnNumber").unwrap()).collect();
    let sizes: Vec<usize> = inserts.iter().map(|c| c.get_array("documents").unwrap().len()).collect();
    assert_eq!(txn_numbers, vec![1, 2, 3]);
    assert_eq!(sizes, vec![2, 2, 1]);
    assert!(inserts
        .iter()
        .all(|c| c.get_document("lsid").unwrap() == inserts[0].get_document("lsid").unwrap()));
}

#[tokio::test]
async fn test_explicit_session_numbers_keep_increasing() {
    let deployment = seeded(0).await;
    let client = client(&deployment, ClientOptions::default());
    let session = client.start_session(false);
    let users = client.database(DB).collection_with_doc(COLL).with_session(session.clone());

    users.insert_one(doc! { "_id": 1 }).await.unwrap();
    users.delete_one(doc! { "_id": 1 }).await.unwrap();

    let commands = deployment.commands();
    assert_eq!(commands[0].get_i64("txnNumber").unwrap(), 1);
    assert_eq!(commands[1].get_i64("txnNumber").unwrap(), 2);
    assert_eq!(commands[1].get_document("lsid").unwrap(), session.id());
}

// ============================================================================
// Servers that reject transaction numbers
// ============================================================================

/// Claims to be a replica set primary while forwarding to a standalone.
struct Misreported {
    inner: MemoryDeployment,
    description: ConnectionDescription,
}

struct MisreportedSource {
    inner: Arc<dyn ConnectionSource>,
    description: ConnectionDescription,
}

struct MisreportedConnection {
    inner: Arc<dyn Connection>,
    description: ConnectionDescription,
}

#[async_trait]
impl Binding for Misreported {
    async fn connection_source(&self) -> Result<Arc<dyn ConnectionSource>> {
        Ok(Arc::new(MisreportedSource {
            inner: self.inner.connection_source().await?,
            description: self.description.clone(),
        }))
    }
}

#[async_trait]
impl ConnectionSource for MisreportedSource {
    fn server_description(&self) -> &ConnectionDescription {
        &self.description
    }

    async fn connection(&self) -> Result<Arc<dyn Connection>> {
        Ok(Arc::new(MisreportedConnection {
            inner: self.inner.connection().await?,
            description: self.description.clone(),
        }))
    }
}

#[async_trait]
impl Connection for MisreportedConnection {
    fn description(&self) -> &ConnectionDescription {
        &self.description
    }

    async fn command(&self, database: &str, command: Document) -> Result<Document> {
        self.inner.command(database, command).await
    }
}

#[tokio::test]
async fn test_rejected_txn_number_explains_retry_writes_option() {
    let inner = MemoryDeployment::standalone();
    let mut description = inner.description().clone();
    description.server_type = ServerType::ReplicaSetPrimary;
    let client = mongo_do_ops::MongoClient::with_binding(
        Arc::new(Misreported {
            inner: inner.clone(),
            description,
        }),
        ClientOptions::default(),
    );

    let err = client
        .database(DB)
        .collection_with_doc(COLL)
        .insert_one(doc! { "name": "ada" })
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(20));
    assert!(err.to_string().contains("retryWrites=false"));
    assert_eq!(inner.commands_named("insert").len(), 1);
}

// ============================================================================
// Retryable reads
// ============================================================================

#[tokio::test]
async fn test_find_retried_after_network_error() {
    let deployment = seeded(3).await;
    fail_once(&deployment, "find", FailAction::close_connection());

    let documents = users(&deployment).find(None).await.unwrap().collect().await.unwrap();

    assert_eq!(documents.len(), 3);
    assert_eq!(deployment.commands_named("find").len(), 2);
}

#[tokio::test]
async fn test_find_not_retried_when_reads_not_retryable() {
    let deployment = seeded(3).await;
    fail_once(&deployment, "find", FailAction::close_connection());

    let users = users_with(&deployment, ClientOptions::builder().retry_reads(false).build());
    let err = users.find(None).await.err().unwrap();

    assert!(err.is_network_error());
    assert_eq!(deployment.commands_named("find").len(), 1);
}

#[tokio::test]
async fn test_get_more_is_never_retried() {
    let deployment = seeded(5).await;
    fail_once(&deployment, "getMore", FailAction::close_connection());

    let options = mongo_do_ops::FindOptions::builder().batch_size(2).build();
    let cursor = users(&deployment).find_with_options(None, options).await.unwrap();
    let err = cursor.collect().await.unwrap_err();

    assert!(err.is_network_error());
    assert_eq!(deployment.commands_named("getMore").len(), 1);
}

#[tokio::test]
async fn test_count_retried_after_transient_error() {
    let deployment = seeded(4).await;
    fail_once(&deployment, "count", FailAction::error(11600, &[]));

    assert_eq!(users(&deployment).count_documents(None).await.unwrap(), 4);
    assert_eq!(deployment.commands_named("count").len(), 2);
}

// ============================================================================
// Bulk writes
// ============================================================================

#[tokio::test]
async fn test_ordered_bulk_stops_at_first_error() {
    let deployment = seeded(3).await;
    let users = users(&deployment);

    let err = users
        .bulk_write(
            vec![
                WriteRequest::insert(doc! { "_id": 10 }),
                WriteRequest::insert(doc! { "_id": 1 }),
                WriteRequest::insert(doc! { "_id": 11 }),
            ],
            true,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, MongoError::Write { index: 1, code: 11000, .. }));
    assert_eq!(users.count_documents(None).await.unwrap(), 4);
    assert_eq!(users.count_documents(doc! { "_id": 11 }).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unordered_bulk_reports_error_index_and_continues() {
    let deployment = seeded(3).await;
    let users = users(&deployment);

    let err = users
        .bulk_write(
            vec![
                WriteRequest::insert(doc! { "_id": 10 }),
                WriteRequest::delete_one(doc! { "_id": 0 }),
                WriteRequest::insert(doc! { "_id": 1 }),
                WriteRequest::insert(doc! { "_id": 11 }),
            ],
            false,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, MongoError::Write { index: 2, code: 11000, .. }));
    assert_eq!(users.count_documents(doc! { "_id": 0 }).await.unwrap(), 0);
    assert_eq!(users.count_documents(doc! { "_id": 11 }).await.unwrap(), 1);
    assert_eq!(users.count_documents(None).await.unwrap(), 4);

    let names: Vec<String> = deployment
        .commands()
        .iter()
        .filter_map(|c| c.keys().next().cloned())
        .filter(|name| name != "count")
        .collect();
    assert_eq!(names, vec!["insert", "delete"]);
}

#[tokio::test]
async fn test_bulk_counts_and_upserts() {
    let deployment = MemoryDeployment::new();
    seed(&deployment, 3).await;
    let users = users(&deployment);

    let result = users
        .bulk_write(
            vec![
                WriteRequest::update_many(doc! { "x": { "$gte": 1 } }, doc! { "$set": { "y": 1 } }),
                WriteRequest::update_one(doc! { "_id": 99 }, doc! { "$set": { "y": 2 } }).upsert(true),
                WriteRequest::delete_many(doc! { "x": 0 }),
                WriteRequest::insert(doc! { "_id": 50 }),
            ],
            true,
        )
        .await
        .unwrap();

    assert_eq!(result.matched_count, 2);
    assert_eq!(result.modified_count, 2);
    assert_eq!(result.upserted_ids.get(&1), Some(&bson::Bson::Int32(99)));
    assert_eq!(result.deleted_count, 1);
    assert_eq!(result.inserted_count, 1);
    assert_eq!(result.inserted_ids.get(&3), Some(&bson::Bson::Int32(50)));
}
