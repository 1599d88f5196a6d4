// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Read-through accessor for the file-based config store.
//!
//! The config server owns a file tree under `<configRoot>`, partitioned by
//! kind (`STANDARD_SYNC/<uuid>.json`, `SOURCE_CONNECTION/<uuid>.json`, ...).
//! The scheduler only reads it.

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use tokio::fs;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::models::{
    Connection, DestinationConnection, DestinationDefinition, SourceConnection, SourceDefinition,
};

const STANDARD_SYNC: &str = "STANDARD_SYNC";
const SOURCE_CONNECTION: &str = "SOURCE_CONNECTION";
const DESTINATION_CONNECTION: &str = "DESTINATION_CONNECTION";
const STANDARD_SOURCE_DEFINITION: &str = "STANDARD_SOURCE_DEFINITION";
const STANDARD_DESTINATION_DEFINITION: &str = "STANDARD_DESTINATION_DEFINITION";

/// Reader over the config store file tree.
#[derive(Clone)]
pub struct ConfigRepository {
    root: PathBuf,
}

impl ConfigRepository {
    /// Create a repository reading under the given root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Load one connection (standard sync) by id.
    pub async fn get_connection(&self, id: Uuid) -> Result<Connection> {
        self.read(STANDARD_SYNC, id).await
    }

    /// List every connection in the store.
    pub async fn list_connections(&self) -> Result<Vec<Connection>> {
        self.list(STANDARD_SYNC).await
    }

    /// Load a source connector instance by id.
    pub async fn get_source_connection(&self, id: Uuid) -> Result<SourceConnection> {
        self.read(SOURCE_CONNECTION, id).await
    }

    /// Load a destination connector instance by id.
    pub async fn get_destination_connection(&self, id: Uuid) -> Result<DestinationConnection> {
        self.read(DESTINATION_CONNECTION, id).await
    }

    /// Load a source connector definition by id.
    pub async fn get_source_definition(&self, id: Uuid) -> Result<SourceDefinition> {
        self.read(STANDARD_SOURCE_DEFINITION, id).await
    }

    /// Load a destination connector definition by id.
    pub async fn get_destination_definition(&self, id: Uuid) -> Result<DestinationDefinition> {
        self.read(STANDARD_DESTINATION_DEFINITION, id).await
    }

    async fn read<T: DeserializeOwned>(&self, kind: &'static str, id: Uuid) -> Result<T> {
        let path = self.root.join(kind).join(format!("{}.json", id));
        match fs::read_to_string(&path).await {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SchedulerError::ConfigNotFound {
                    kind,
                    id: id.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list<T: DeserializeOwned>(&self, kind: &'static str) -> Result<Vec<T>> {
        let dir = self.root.join(kind);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            // An empty store is a store with no documents.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut documents = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read_to_string(&path).await?;
            documents.push(serde_json::from_str(&raw)?);
        }
        Ok(documents)
    }
}
