//! Arbitrary database commands.

use super::{execute_with_retries, RetryableOperation};
use crate::command::execute_command;
use crate::connection::{Binding, Connection, ConnectionSource};
use crate::error::Result;
use crate::retry::Retryability;
use crate::session::ClientSession;
use async_trait::async_trait;
use bson::Document;
use std::sync::Arc;

/// Runs a command document against a database, exactly once.
#[derive(Debug, Clone)]
pub struct CommandOperation {
    database: String,
    command: Document,
}

impl CommandOperation {
    pub fn new(database: impl Into<String>, command: Document) -> Self {
        Self {
            database: database.into(),
            command,
        }
    }

    /// Run the command and return the server's reply.
    pub async fn execute(&self, binding: &dyn Binding, session: Option<&ClientSession>) -> Result<Document> {
        execute_with_retries(self, binding, session, Retryability::None).await
    }
}

#[async_trait]
impl RetryableOperation for CommandOperation {
    type Output = Document;

    fn name(&self) -> &str {
        self.command.keys().next().map_or("command", String::as_str)
    }

    async fn execute_attempt(
        &self,
        _source: Arc<dyn ConnectionSource>,
        connection: Arc<dyn Connection>,
        session: Option<&ClientSession>,
        _txn_number: Option<i64>,
    ) -> Result<Document> {
        execute_command(connection.as_ref(), &self.database, self.command.clone(), session, None).await
    }
}
