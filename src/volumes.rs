use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::errors::{SandboxError, SandboxResult};
use crate::locks::KeyedLocks;
use crate::models::Volume;
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::settings::ManagerConfig;

/// Token an operator must send to destroy a project volume.
pub const FORCE_DELETE_CONFIRMATION: &str = "DELETE_ALL_DATA";

/// Tracks the persistent volume behind each project.
///
/// Volumes are created lazily and are never removed implicitly: sandbox removal and idle
/// eviction only drop the reference, the data stays until [`VolumeRegistry::force_delete`].
pub struct VolumeRegistry {
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<ManagerConfig>,
    volumes: RwLock<HashMap<String, Volume>>,
    /// Sandboxes being created that will mount the project's volume.
    reserved: RwLock<HashMap<String, usize>>,
    locks: KeyedLocks<String>,
}

impl VolumeRegistry {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: Arc<ManagerConfig>) -> Self {
        Self {
            runtime,
            config,
            volumes: RwLock::new(HashMap::new()),
            reserved: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
        }
    }

    /// `{prefix}-{project}`, with a digest suffix when sanitising had to change the name.
    pub fn volume_name(&self, project: &str) -> String {
        let cleaned = sanitize_name(project);
        if cleaned == project {
            format!("{}-{cleaned}", self.config.volume_prefix)
        } else {
            format!(
                "{}-{cleaned}-{}",
                self.config.volume_prefix,
                name_digest(&[project])
            )
        }
    }

    pub async fn get_or_create(&self, project: &str) -> SandboxResult<Volume> {
        let _guard = self.locks.acquire(&project.to_string()).await;
        self.get_or_create_locked(project).await
    }

    /// Like [`VolumeRegistry::get_or_create`], and also counts a sandbox about to mount the
    /// volume so [`VolumeRegistry::force_delete`] refuses it. The reservation ends with
    /// [`VolumeRegistry::attach`] or [`VolumeRegistry::release`].
    pub async fn reserve(&self, project: &str) -> SandboxResult<Volume> {
        let _guard = self.locks.acquire(&project.to_string()).await;
        let volume = self.get_or_create_locked(project).await?;
        *self
            .reserved
            .write()
            .await
            .entry(project.to_string())
            .or_default() += 1;
        Ok(volume)
    }

    /// Drops a reservation whose sandbox never came up.
    pub async fn release(&self, project: &str) {
        let mut reserved = self.reserved.write().await;
        if let Some(count) = reserved.get_mut(project) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                reserved.remove(project);
            }
        }
    }

    async fn get_or_create_locked(&self, project: &str) -> SandboxResult<Volume> {
        if let Some(volume) = self.volumes.write().await.get_mut(project) {
            volume.last_used = Utc::now();
            return Ok(volume.clone());
        }

        let name = self.volume_name(project);
        let exists = self
            .runtime
            .volume_exists(&name)
            .await
            .map_err(|e| SandboxError::SandboxUnavailable(format!("inspect volume {name}: {e}")))?;

        if exists {
            info!("volume {name} already exists");
        } else {
            let labels = HashMap::from([
                (self.config.label("repo"), project.to_string()),
                (self.config.label("type"), "repository".to_string()),
            ]);
            match self.runtime.create_volume(&name, labels).await {
                Ok(()) => info!("created volume {name} for project {project}"),
                Err(RuntimeError::AlreadyExists(_)) => info!("volume {name} already exists"),
                Err(error) => {
                    return Err(SandboxError::SandboxUnavailable(format!(
                        "create volume {name}: {error}"
                    )))
                }
            }
        }

        let now = Utc::now();
        let volume = Volume {
            project: project.to_string(),
            name,
            sandboxes: Vec::new(),
            created_at: now,
            last_used: now,
        };
        self.volumes
            .write()
            .await
            .insert(project.to_string(), volume.clone());
        Ok(volume)
    }

    /// In-memory lookup only; never touches the runtime.
    pub async fn get(&self, project: &str) -> Option<Volume> {
        self.volumes.read().await.get(project).cloned()
    }

    /// Fails with [`SandboxError::NotFound`] when the project has no tracked volume.
    pub async fn require(&self, project: &str) -> SandboxResult<Volume> {
        self.get(project)
            .await
            .ok_or_else(|| SandboxError::NotFound(format!("repository {project}")))
    }

    pub async fn list(&self) -> Vec<Volume> {
        let mut volumes: Vec<Volume> = self.volumes.read().await.values().cloned().collect();
        volumes.sort_by(|a, b| a.project.cmp(&b.project));
        volumes
    }

    /// Records a started sandbox on a volume reserved through [`VolumeRegistry::reserve`].
    pub async fn attach(&self, project: &str, sandbox_id: &str) {
        {
            let mut volumes = self.volumes.write().await;
            match volumes.get_mut(project) {
                Some(volume) => {
                    if !volume.sandboxes.iter().any(|id| id == sandbox_id) {
                        volume.sandboxes.push(sandbox_id.to_string());
                    }
                    volume.last_used = Utc::now();
                }
                None => warn!("sandbox {sandbox_id} attached to untracked project {project}"),
            }
        }
        self.release(project).await;
    }

    pub async fn detach(&self, project: &str, sandbox_id: &str) {
        let mut volumes = self.volumes.write().await;
        if let Some(volume) = volumes.get_mut(project) {
            volume.sandboxes.retain(|id| id != sandbox_id);
            if volume.sandboxes.is_empty() {
                info!(
                    "volume {} has no sandboxes left; keeping it for its data",
                    volume.name
                );
            }
        }
    }

    /// Re-tracks a volume discovered through a labelled sandbox at startup.
    pub async fn restore(
        &self,
        project: &str,
        name: &str,
        sandbox_id: &str,
        created_at: DateTime<Utc>,
    ) {
        let mut volumes = self.volumes.write().await;
        let volume = volumes.entry(project.to_string()).or_insert_with(|| Volume {
            project: project.to_string(),
            name: name.to_string(),
            sandboxes: Vec::new(),
            created_at,
            last_used: Utc::now(),
        });
        if !volume.sandboxes.iter().any(|id| id == sandbox_id) {
            volume.sandboxes.push(sandbox_id.to_string());
        }
    }

    /// Permanently deletes a project's volume and everything in it.
    pub async fn force_delete(&self, project: &str, confirmation: &str) -> SandboxResult<Volume> {
        if confirmation != FORCE_DELETE_CONFIRMATION {
            return Err(SandboxError::InvalidRequest(format!(
                "confirmation required: send \"{FORCE_DELETE_CONFIRMATION}\" to delete all data"
            )));
        }

        let _guard = self.locks.acquire(&project.to_string()).await;
        let volume = self.require(project).await?;
        let pending = self
            .reserved
            .read()
            .await
            .get(project)
            .copied()
            .unwrap_or(0);
        let in_use = volume.sandboxes.len() + pending;
        if in_use > 0 {
            return Err(SandboxError::VolumeInUse {
                volume: volume.name.clone(),
                sandboxes: in_use,
            });
        }

        match self.runtime.remove_volume(&volume.name).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(error) => {
                return Err(SandboxError::Internal(format!(
                    "failed to remove volume {}: {error}",
                    volume.name
                )))
            }
        }

        self.volumes.write().await.remove(project);
        warn!("force deleted volume {} for project {project}", volume.name);
        Ok(volume)
    }
}

/// Maps an arbitrary string onto the `[A-Za-z0-9_.-]` charset Docker accepts in names.
pub fn sanitize_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches(['.', '-']);
    if trimmed.is_empty() {
        "x".to_string()
    } else {
        trimmed.to_string()
    }
}

/// First eight hex digits of the SHA-256 over the NUL-separated `parts`.
pub fn name_digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (index, part) in parts.iter().enumerate() {
        if index > 0 {
            hasher.update([0u8]);
        }
        hasher.update(part.as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .take(4)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_names() {
        assert_eq!(sanitize_name("thesis"), "thesis");
        assert_eq!(sanitize_name("my paper/v2"), "my-paper-v2");
        assert_eq!(sanitize_name("..hidden"), "hidden");
        assert_eq!(sanitize_name("///"), "x");
    }

    #[test]
    fn digest_separates_parts() {
        assert_eq!(name_digest(&["a", "b-c"]).len(), 8);
        assert_ne!(name_digest(&["a", "b-c"]), name_digest(&["a-b", "c"]));
        assert_eq!(name_digest(&["a", "b"]), name_digest(&["a", "b"]));
    }
}
