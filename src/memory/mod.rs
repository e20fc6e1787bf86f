//! A deterministic in-process deployment.
//!
//! [`MemoryDeployment`] implements [`Binding`] on top of a single simulated
//! server that understands the commands this crate sends: cursors with
//! batching, capped collections with tailable and await-data cursors, CRUD
//! writes, retryable-write deduplication and a set of fail points for
//! injecting failures. Every command that reaches the server is recorded.
//!
//! # Example
//!
//! ```ignore
//! let deployment = MemoryDeployment::new();
//! deployment.configure_fail_point(
//!     FailPoint::fail_command(&["insert"], FailAction::close_connection()).times(1),
//! );
//! let client = MongoClient::with_binding(Arc::new(deployment.clone()), ClientOptions::default());
//! ```

mod matcher;
mod store;

use self::store::{error_reply, ok_reply, GetMore, Store};
use crate::command::get_int;
use crate::connection::{Binding, Connection, ConnectionDescription, ConnectionSource, ServerAddress, ServerType};
use crate::error::{MongoError, Result};
use async_trait::async_trait;
use bson::{Bson, Document, Timestamp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::trace;

/// How long a get-more on an await-data cursor waits without `maxTimeMS`.
const DEFAULT_AWAIT_TIME: Duration = Duration::from_millis(1000);

const WRITE_COMMANDS: &[&str] = &["insert", "update", "delete"];

/// What a `failCommand` fail point does to a matching command.
#[derive(Debug, Clone, PartialEq)]
pub enum FailAction {
    /// Drop the connection. With `after_apply` the command runs first.
    CloseConnection {
        /// Whether the command takes effect before the connection drops.
        after_apply: bool,
    },
    /// Reply with a command error.
    Error {
        /// Server error code.
        code: i32,
        /// Error labels on the reply.
        labels: Vec<String>,
    },
    /// Run the command, then attach a write concern error to the reply.
    WriteConcernError {
        /// Server error code.
        code: i32,
        /// Error message.
        message: String,
    },
    /// Delay the command before running it.
    Block(Duration),
}

impl FailAction {
    /// Close the connection without running the command.
    pub fn close_connection() -> Self {
        FailAction::CloseConnection { after_apply: false }
    }

    /// Run the command, then close the connection before replying.
    pub fn close_connection_after_apply() -> Self {
        FailAction::CloseConnection { after_apply: true }
    }

    /// Fail with `code` and the given labels.
    pub fn error(code: i32, labels: &[&str]) -> Self {
        FailAction::Error {
            code,
            labels: labels.iter().map(|label| label.to_string()).collect(),
        }
    }

    /// Succeed but report a write concern failure.
    pub fn write_concern_error(code: i32, message: impl Into<String>) -> Self {
        FailAction::WriteConcernError {
            code,
            message: message.into(),
        }
    }

    /// Delay the command by `delay`.
    pub fn block(delay: Duration) -> Self {
        FailAction::Block(delay)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Trigger {
    Checkout,
    Command { names: Vec<String>, action: FailAction },
    MaxTimeAlwaysTimeOut,
}

/// An injected failure, active until it has fired `times` times.
#[derive(Debug, Clone, PartialEq)]
pub struct FailPoint {
    trigger: Trigger,
    remaining: Option<u32>,
}

impl FailPoint {
    /// Checking out a connection fails before anything is sent.
    pub fn checkout_failure() -> Self {
        Self::always(Trigger::Checkout)
    }

    /// Commands named in `names` fail with `action`.
    pub fn fail_command(names: &[&str], action: FailAction) -> Self {
        Self::always(Trigger::Command {
            names: names.iter().map(|name| name.to_string()).collect(),
            action,
        })
    }

    /// Every command carrying `maxTimeMS` fails with an execution timeout.
    pub fn max_time_always_time_out() -> Self {
        Self::always(Trigger::MaxTimeAlwaysTimeOut)
    }

    /// Deactivate after firing `times` times.
    pub fn times(mut self, times: u32) -> Self {
        self.remaining = Some(times);
        self
    }

    fn always(trigger: Trigger) -> Self {
        Self {
            trigger,
            remaining: None,
        }
    }

    /// Count one firing. Returns false once exhausted.
    fn fire(&mut self) -> bool {
        match &mut self.remaining {
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
enum Fired {
    Close { after_apply: bool },
    Reply(Document),
    WriteConcernError(Document),
    Block(Duration),
}

struct ServerState {
    store: Store,
    fail_points: Vec<FailPoint>,
    commands: Vec<Document>,
    retried_writes: HashMap<(Vec<u8>, i64), Document>,
    clock: u32,
}

impl ServerState {
    fn checkout_fails(&mut self) -> bool {
        let fired = self
            .fail_points
            .iter_mut()
            .filter(|point| point.trigger == Trigger::Checkout)
            .any(FailPoint::fire);
        self.prune();
        fired
    }

    fn fire_command(&mut self, name: &str, command: &Document) -> Option<Fired> {
        let mut fired = None;
        for point in &mut self.fail_points {
            let outcome = match &point.trigger {
                Trigger::Command { names, action } if names.iter().any(|n| n == name) => match action {
                    FailAction::CloseConnection { after_apply } => Fired::Close {
                        after_apply: *after_apply,
                    },
                    FailAction::Error { code, labels } => {
                        let mut reply = error_reply(*code, "", "Failing command via 'failCommand' failpoint");
                        if !labels.is_empty() {
                            reply.insert("errorLabels", labels.clone());
                        }
                        Fired::Reply(reply)
                    }
                    FailAction::WriteConcernError { code, message } => {
                        Fired::WriteConcernError(bson::doc! { "code": *code, "errmsg": message.as_str() })
                    }
                    FailAction::Block(delay) => Fired::Block(*delay),
                },
                Trigger::MaxTimeAlwaysTimeOut if command.contains_key("maxTimeMS") => Fired::Reply(error_reply(
                    50,
                    "MaxTimeMSExpired",
                    "operation exceeded time limit",
                )),
                _ => continue,
            };
            if point.fire() {
                fired = Some(outcome);
                break;
            }
        }
        self.prune();
        fired
    }

    fn prune(&mut self) {
        self.fail_points.retain(|point| point.remaining != Some(0));
    }

    fn tick(&mut self) -> Timestamp {
        self.clock += 1;
        Timestamp {
            time: 1_700_000_000,
            increment: self.clock,
        }
    }
}

struct Server {
    description: ConnectionDescription,
    state: Mutex<ServerState>,
    inserted: Notify,
}

impl Server {
    async fn handle(&self, database: &str, command: Document) -> Result<Document> {
        let name = command.keys().next().cloned().unwrap_or_default();
        let fired = {
            let mut state = self.state.lock();
            state.commands.push(command.clone());
            state.fire_command(&name, &command)
        };
        trace!(command = %name, database, "memory server received command");

        let mut write_concern_error = None;
        let mut close_after_apply = false;
        match fired {
            Some(Fired::Close { after_apply: false }) => {
                return Err(MongoError::network("connection closed by fail point"));
            }
            Some(Fired::Close { after_apply: true }) => close_after_apply = true,
            Some(Fired::Reply(reply)) => return Ok(self.stamp(reply)),
            Some(Fired::WriteConcernError(error)) => write_concern_error = Some(error),
            Some(Fired::Block(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }

        let mut reply = if name == "getMore" {
            self.get_more(&command).await
        } else {
            self.apply(database, &name, &command)
        };

        if let Some(error) = write_concern_error {
            reply.insert("writeConcernError", error);
        }
        if close_after_apply {
            return Err(MongoError::network("connection closed by fail point"));
        }
        Ok(self.stamp(reply))
    }

    fn stamp(&self, mut reply: Document) -> Document {
        let time = self.state.lock().tick();
        reply.insert("operationTime", time);
        reply
    }

    fn apply(&self, database: &str, name: &str, command: &Document) -> Document {
        let retry_key = match (command.get_document("lsid"), get_int(command, "txnNumber")) {
            (Ok(lsid), Some(txn_number)) if WRITE_COMMANDS.contains(&name) => {
                if self.description.server_type == ServerType::Standalone {
                    return error_reply(
                        20,
                        "IllegalOperation",
                        "Transaction numbers are only allowed on a replica set member or mongos",
                    );
                }
                let id = match lsid.get("id") {
                    Some(Bson::Binary(binary)) => binary.bytes.clone(),
                    _ => Vec::new(),
                };
                Some((id, txn_number))
            }
            _ => None,
        };

        let mut state = self.state.lock();
        if let Some(reply) = retry_key.as_ref().and_then(|key| state.retried_writes.get(key)) {
            return reply.clone();
        }

        let store = &mut state.store;
        let reply = match name {
            "find" => store.find(database, command),
            "aggregate" => store.aggregate(database, command),
            "killCursors" => store.kill_cursors(command),
            "insert" => store.insert(database, command),
            "update" => store.update(database, command),
            "delete" => store.delete(database, command),
            "count" => store.count(database, command),
            "listCollections" => store.list_collections(database, command),
            "create" => store.create(database, command),
            "drop" => store.drop_collection(database, command),
            "dropDatabase" => store.drop_database(database),
            "ping" => ok_reply(),
            other => error_reply(59, "CommandNotFound", format!("no such command: '{other}'")),
        };

        if name == "insert" {
            self.inserted.notify_waiters();
        }
        if let Some(key) = retry_key {
            state.retried_writes.insert(key, reply.clone());
        }
        reply
    }

    async fn get_more(&self, command: &Document) -> Document {
        let wait = get_int(command, "maxTimeMS")
            .and_then(|ms| u64::try_from(ms).ok())
            .map_or(DEFAULT_AWAIT_TIME, Duration::from_millis);
        let deadline = Instant::now() + wait;

        loop {
            let inserted = self.inserted.notified();
            let outcome = self.state.lock().store.get_more(command);
            match outcome {
                GetMore::Reply(reply) => return reply,
                GetMore::NoData(reply, await_data) => {
                    let now = Instant::now();
                    if !await_data || now >= deadline {
                        return reply;
                    }
                    let _ = tokio::time::timeout(deadline - now, inserted).await;
                }
            }
        }
    }
}

/// A simulated single-server deployment.
///
/// Clones share the same server.
#[derive(Clone)]
pub struct MemoryDeployment {
    server: Arc<Server>,
}

impl MemoryDeployment {
    /// A replica set primary with default limits.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// A standalone server, which does not support retryable writes.
    pub fn standalone() -> Self {
        Self::builder().server_type(ServerType::Standalone).build()
    }

    /// Configure a deployment.
    pub fn builder() -> MemoryDeploymentBuilder {
        MemoryDeploymentBuilder::default()
    }

    /// The description every connection reports.
    pub fn description(&self) -> &ConnectionDescription {
        &self.server.description
    }

    /// Activate a fail point.
    pub fn configure_fail_point(&self, fail_point: FailPoint) {
        self.server.state.lock().fail_points.push(fail_point);
    }

    /// Deactivate every fail point.
    pub fn clear_fail_points(&self) {
        self.server.state.lock().fail_points.clear();
    }

    /// Every command that reached the server, oldest first.
    pub fn commands(&self) -> Vec<Document> {
        self.server.state.lock().commands.clone()
    }

    /// The commands named `name` that reached the server.
    pub fn commands_named(&self, name: &str) -> Vec<Document> {
        self.server
            .state
            .lock()
            .commands
            .iter()
            .filter(|command| command.keys().next().is_some_and(|key| key == name))
            .cloned()
            .collect()
    }

    /// Forget the recorded commands.
    pub fn clear_commands(&self) {
        self.server.state.lock().commands.clear();
    }

    /// Number of cursors the server holds open.
    pub fn open_cursor_count(&self) -> usize {
        self.server.state.lock().store.open_cursor_count()
    }

    /// Drop every server cursor, as a server does when cursors time out.
    pub fn expire_cursors(&self) {
        self.server.state.lock().store.expire_cursors();
    }
}

impl Default for MemoryDeployment {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryDeployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDeployment")
            .field("description", &self.server.description)
            .finish()
    }
}

/// Builder for [`MemoryDeployment`].
#[derive(Debug, Clone)]
pub struct MemoryDeploymentBuilder {
    description: ConnectionDescription,
}

impl Default for MemoryDeploymentBuilder {
    fn default() -> Self {
        Self {
            description: ConnectionDescription::new(ServerAddress::default(), ServerType::ReplicaSetPrimary),
        }
    }
}

impl MemoryDeploymentBuilder {
    pub fn address(mut self, address: ServerAddress) -> Self {
        self.description.address = address;
        self
    }

    pub fn server_type(mut self, server_type: ServerType) -> Self {
        self.description.server_type = server_type;
        self
    }

    pub fn max_wire_version(mut self, version: i32) -> Self {
        self.description.max_wire_version = version;
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.description.max_message_size = size;
        self
    }

    pub fn max_write_batch_size(mut self, size: usize) -> Self {
        self.description.max_write_batch_size = size;
        self
    }

    pub fn build(self) -> MemoryDeployment {
        MemoryDeployment {
            server: Arc::new(Server {
                description: self.description,
                state: Mutex::new(ServerState {
                    store: Store::default(),
                    fail_points: Vec::new(),
                    commands: Vec::new(),
                    retried_writes: HashMap::new(),
                    clock: 0,
                }),
                inserted: Notify::new(),
            }),
        }
    }
}

/// A lease on the simulated server.
pub struct MemorySource {
    server: Arc<Server>,
}

/// A connection to the simulated server.
pub struct MemoryConnection {
    server: Arc<Server>,
}

#[async_trait]
impl Binding for MemoryDeployment {
    async fn connection_source(&self) -> Result<Arc<dyn ConnectionSource>> {
        Ok(Arc::new(MemorySource {
            server: Arc::clone(&self.server),
        }))
    }
}

#[async_trait]
impl ConnectionSource for MemorySource {
    fn server_description(&self) -> &ConnectionDescription {
        &self.server.description
    }

    async fn connection(&self) -> Result<Arc<dyn Connection>> {
        if self.server.state.lock().checkout_fails() {
            return Err(MongoError::acquisition("connection checkout failed by fail point"));
        }
        Ok(Arc::new(MemoryConnection {
            server: Arc::clone(&self.server),
        }))
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn description(&self) -> &ConnectionDescription {
        &self.server.description
    }

    async fn command(&self, database: &str, command: Document) -> Result<Document> {
        self.server.handle(database, command).await
    }
}
