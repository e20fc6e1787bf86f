//! Database struct for managing collections.

use crate::client::MongoClient;
use crate::collection::Collection;
use crate::concern::append_write_concern;
use crate::cursor::Namespace;
use crate::error::{MongoError, Result};
use crate::operation::{CommandOperation, ListCollectionsOperation};
use bson::{doc, Document};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A handle to a MongoDB database.
///
/// # Example
///
/// ```ignore
/// let db = client.database("mydb");
///
/// let collections = db.list_collection_names().await?;
/// println!("Collections: {:?}", collections);
/// ```
#[derive(Debug, Clone)]
pub struct Database {
    name: String,
    client: MongoClient,
}

impl Database {
    /// Create a new database handle.
    pub(crate) fn new(name: String, client: MongoClient) -> Self {
        Self { name, client }
    }

    /// Get the database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a handle to a collection with a specific type.
    ///
    /// # Example
    ///
    /// ```ignore
    /// #[derive(Debug, Serialize, Deserialize)]
    /// struct User {
    ///     name: String,
    ///     email: String,
    /// }
    ///
    /// let users = db.collection::<User>("users");
    /// ```
    pub fn collection<T>(&self, name: &str) -> Collection<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static,
    {
        Collection::new(Namespace::new(self.name.as_str(), name), self.client.clone())
    }

    /// Get a handle to a collection with Document type.
    pub fn collection_with_doc(&self, name: &str) -> Collection<Document> {
        self.collection(name)
    }

    /// List all collection names in this database.
    pub async fn list_collection_names(&self) -> Result<Vec<String>> {
        let cursor = ListCollectionsOperation::new(self.name.as_str())
            .name_only(true)
            .retry_reads(self.client.options().retry_reads)
            .execute(self.client.binding(), None)
            .await?;

        let mut names = Vec::new();
        while let Some(batch) = cursor.next().await? {
            for info in batch {
                let name = info
                    .get_str("name")
                    .map_err(|_| MongoError::Deserialization("collection info without a name".to_string()))?;
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    /// Create a new collection.
    pub async fn create_collection(&self, name: &str) -> Result<()> {
        self.create_collection_with_options(name, CreateCollectionOptions::default())
            .await
    }

    /// Create a collection with options.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let options = CreateCollectionOptions::builder().capped(true).size(4096).max(100).build();
    /// db.create_collection_with_options("events", options).await?;
    /// ```
    pub async fn create_collection_with_options(
        &self,
        name: &str,
        options: CreateCollectionOptions,
    ) -> Result<()> {
        let mut command = doc! { "create": name };
        if let Some(capped) = options.capped {
            command.insert("capped", capped);
        }
        if let Some(size) = options.size {
            command.insert("size", to_i64(size));
        }
        if let Some(max) = options.max {
            command.insert("max", to_i64(max));
        }
        append_write_concern(&mut command, &self.client.options().write_concern(), None);

        self.run_command(command).await?;
        Ok(())
    }

    /// Drop the database.
    ///
    /// # Warning
    ///
    /// This will permanently delete the database and all its collections.
    pub async fn drop(&self) -> Result<()> {
        let mut command = doc! { "dropDatabase": 1 };
        append_write_concern(&mut command, &self.client.options().write_concern(), None);
        self.run_command(command).await?;
        Ok(())
    }

    /// Run a database command.
    ///
    /// The command runs once; it is never retried.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let result = db.run_command(doc! { "ping": 1 }).await?;
    /// ```
    pub async fn run_command(&self, command: Document) -> Result<Document> {
        CommandOperation::new(self.name.as_str(), command)
            .execute(self.client.binding(), None)
            .await
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Options for creating a collection.
#[derive(Debug, Clone, Default)]
pub struct CreateCollectionOptions {
    /// Whether the collection is capped.
    pub capped: Option<bool>,
    /// Maximum size in bytes for a capped collection.
    pub size: Option<u64>,
    /// Maximum number of documents in a capped collection.
    pub max: Option<u64>,
}

impl CreateCollectionOptions {
    /// Create a new builder.
    pub fn builder() -> CreateCollectionOptionsBuilder {
        CreateCollectionOptionsBuilder::default()
    }
}

/// Builder for CreateCollectionOptions.
#[derive(Debug, Clone, Default)]
pub struct CreateCollectionOptionsBuilder {
    options: CreateCollectionOptions,
}

impl CreateCollectionOptionsBuilder {
    /// Set whether the collection is capped.
    pub fn capped(mut self, capped: bool) -> Self {
        self.options.capped = Some(capped);
        self
    }

    /// Set the maximum size for a capped collection.
    pub fn size(mut self, size: u64) -> Self {
        self.options.size = Some(size);
        self
    }

    /// Set the maximum number of documents for a capped collection.
    pub fn max(mut self, max: u64) -> Self {
        self.options.max = Some(max);
        self
    }

    /// Build the options.
    pub fn build(self) -> CreateCollectionOptions {
        self.options
    }
}
