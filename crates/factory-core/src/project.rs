use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{FactoryError, Result};

/// Status the orchestrator writes back to task and feature records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Running,
    Completed,
    Blocked,
    Cancelled,
    Errored,
}

/// Project-record store consumed by the orchestrator.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Root directory of the project's working tree.
    async fn project_root(&self, project_id: &str) -> Option<PathBuf>;

    /// Free-form description used as agent context.
    async fn task_description(&self, project_id: &str, task_id: &str) -> Option<String>;

    async fn feature_description(&self, project_id: &str, feature_id: &str) -> Option<String>;

    async fn set_task_status(&self, project_id: &str, task_id: &str, status: WorkStatus, note: Option<&str>) -> Result<()>;

    async fn set_feature_status(
        &self,
        project_id: &str,
        feature_id: &str,
        status: WorkStatus,
        note: Option<&str>,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
struct WorkItem {
    description: String,
    status: Option<WorkStatus>,
    note: Option<String>,
}

#[derive(Debug, Clone)]
struct ProjectEntry {
    root: PathBuf,
    tasks: HashMap<String, WorkItem>,
    features: HashMap<String, WorkItem>,
}

/// Process-local project store.
#[derive(Default)]
pub struct InMemoryProjectStore {
    projects: RwLock<HashMap<String, ProjectEntry>>,
}

impl InMemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_project(&self, project_id: &str, root: impl Into<PathBuf>) {
        self.projects.write().await.insert(
            project_id.to_string(),
            ProjectEntry {
                root: root.into(),
                tasks: HashMap::new(),
                features: HashMap::new(),
            },
        );
    }

    pub async fn add_task(&self, project_id: &str, task_id: &str, description: &str) -> Result<()> {
        let mut projects = self.projects.write().await;
        let project = projects
            .get_mut(project_id)
            .ok_or_else(|| FactoryError::InvalidInput(format!("unknown project {project_id}")))?;
        project.tasks.insert(
            task_id.to_string(),
            WorkItem {
                description: description.to_string(),
                ..WorkItem::default()
            },
        );
        Ok(())
    }

    pub async fn add_feature(&self, project_id: &str, feature_id: &str, description: &str) -> Result<()> {
        let mut projects = self.projects.write().await;
        let project = projects
            .get_mut(project_id)
            .ok_or_else(|| FactoryError::InvalidInput(format!("unknown project {project_id}")))?;
        project.features.insert(
            feature_id.to_string(),
            WorkItem {
                description: description.to_string(),
                ..WorkItem::default()
            },
        );
        Ok(())
    }

    pub async fn task_status(&self, project_id: &str, task_id: &str) -> Option<(WorkStatus, Option<String>)> {
        let projects = self.projects.read().await;
        let item = projects.get(project_id)?.tasks.get(task_id)?;
        item.status.map(|s| (s, item.note.clone()))
    }

    pub async fn feature_status(&self, project_id: &str, feature_id: &str) -> Option<(WorkStatus, Option<String>)> {
        let projects = self.projects.read().await;
        let item = projects.get(project_id)?.features.get(feature_id)?;
        item.status.map(|s| (s, item.note.clone()))
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn project_root(&self, project_id: &str) -> Option<PathBuf> {
        self.projects.read().await.get(project_id).map(|p| p.root.clone())
    }

    async fn task_description(&self, project_id: &str, task_id: &str) -> Option<String> {
        let projects = self.projects.read().await;
        projects
            .get(project_id)?
            .tasks
            .get(task_id)
            .map(|t| t.description.clone())
    }

    async fn feature_description(&self, project_id: &str, feature_id: &str) -> Option<String> {
        let projects = self.projects.read().await;
        projects
            .get(project_id)?
            .features
            .get(feature_id)
            .map(|f| f.description.clone())
    }

    async fn set_task_status(&self, project_id: &str, task_id: &str, status: WorkStatus, note: Option<&str>) -> Result<()> {
        let mut projects = self.projects.write().await;
        let project = projects
            .get_mut(project_id)
            .ok_or_else(|| FactoryError::InvalidInput(format!("unknown project {project_id}")))?;
        // unknown tasks are created on first write
        let item = project.tasks.entry(task_id.to_string()).or_default();
        item.status = Some(status);
        item.note = note.map(str::to_string);
        Ok(())
    }

    async fn set_feature_status(
        &self,
        project_id: &str,
        feature_id: &str,
        status: WorkStatus,
        note: Option<&str>,
    ) -> Result<()> {
        let mut projects = self.projects.write().await;
        let project = projects
            .get_mut(project_id)
            .ok_or_else(|| FactoryError::InvalidInput(format!("unknown project {project_id}")))?;
        let item = project.features.entry(feature_id.to_string()).or_default();
        item.status = Some(status);
        item.note = note.map(str::to_string);
        Ok(())
    }
}
