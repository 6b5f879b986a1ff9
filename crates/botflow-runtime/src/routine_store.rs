//! Where routine graphs come from.
//!
//! The interpreter only needs "give me graph `id`"; [`GraphStore`] is that
//! seam.  [`DirectoryGraphStore`] reads `<dir>/<id>.json` files exported by
//! the administrative API.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use botflow_types::{BotError, RoutineGraph};
use tracing::{debug, warn};

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn get_graph(&self, id: &str) -> Result<RoutineGraph, BotError>;
}

#[derive(Debug, Clone)]
pub struct DirectoryGraphStore {
    root: PathBuf,
}

impl DirectoryGraphStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, BotError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !id.starts_with('.');
        if !valid {
            return Err(BotError::InvalidInput(format!("invalid routine id '{id}'")));
        }
        Ok(self.root.join(format!("{id}.json")))
    }

    /// Ids of every routine in the directory, sorted.
    pub async fn list(&self) -> Result<Vec<String>, BotError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| BotError::InvalidInput(format!("{}: {e}", self.root.display())))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BotError::Internal(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl GraphStore for DirectoryGraphStore {
    async fn get_graph(&self, id: &str) -> Result<RoutineGraph, BotError> {
        let path = self.path_for(id)?;
        debug!(path = %path.display(), "loading routine");
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| BotError::InvalidInput(format!("routine '{id}' not readable: {e}")))?;
        let mut graph = RoutineGraph::from_json(&raw)?;
        if graph.workflow_id.is_none() {
            graph.workflow_id = Some(id.to_string());
        }
        for (from, to) in graph.dangling_transitions() {
            warn!(routine = id, from = %from, to = %to, "transition points to a missing node");
        }
        Ok(graph)
    }
}
