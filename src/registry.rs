use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::{SandboxError, SandboxResult};
use crate::locks::KeyedLocks;
use crate::models::{Sandbox, SandboxKey, SandboxStatus, Volume};
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError};
use crate::settings::ManagerConfig;
use crate::volumes::{name_digest, sanitize_name, VolumeRegistry};

/// Maps `(user, project)` to a running sandbox.
///
/// Every state transition for a key happens under that key's lock, so concurrent
/// `get_or_create` calls and the idle reaper never create or evict twice.
pub struct SandboxRegistry {
    runtime: Arc<dyn ContainerRuntime>,
    volumes: Arc<VolumeRegistry>,
    config: Arc<ManagerConfig>,
    sandboxes: RwLock<HashMap<SandboxKey, Sandbox>>,
    locks: KeyedLocks<SandboxKey>,
}

impl SandboxRegistry {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        volumes: Arc<VolumeRegistry>,
        config: Arc<ManagerConfig>,
    ) -> Self {
        Self {
            runtime,
            volumes,
            config,
            sandboxes: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
        }
    }

    pub fn volumes(&self) -> &Arc<VolumeRegistry> {
        &self.volumes
    }

    /// `{prefix}-{user}-{project}-{digest}`. The digest covers the raw pair, so keys that
    /// sanitise or join to the same text still get distinct names.
    pub fn container_name(&self, key: &SandboxKey) -> String {
        format!(
            "{}-{}-{}-{}",
            self.config.container_prefix,
            sanitize_name(&key.user),
            sanitize_name(&key.project),
            name_digest(&[&key.user, &key.project])
        )
    }

    pub async fn get_or_create(&self, key: &SandboxKey) -> SandboxResult<Sandbox> {
        let _guard = self.locks.acquire(key).await;

        let tracked = self.sandboxes.read().await.get(key).cloned();
        if let Some(sandbox) = tracked {
            match self.runtime.inspect_container(&sandbox.container_id).await {
                Ok(Some(state)) if state.running => {
                    return Ok(self.touch(key, SandboxStatus::Running).await.unwrap_or(sandbox));
                }
                Ok(Some(_)) => {
                    info!("restarting stopped sandbox {}", sandbox.name);
                    if let Err(error) = self.runtime.start_container(&sandbox.container_id).await {
                        self.touch(key, SandboxStatus::Error).await;
                        return Err(SandboxError::SandboxUnavailable(format!(
                            "failed to restart {}: {error}",
                            sandbox.name
                        )));
                    }
                    return Ok(self.touch(key, SandboxStatus::Running).await.unwrap_or(sandbox));
                }
                Ok(None) => {
                    info!("sandbox {} vanished; creating a new one", sandbox.name);
                }
                Err(error) => {
                    warn!("failed to inspect sandbox {}: {error}; recreating", sandbox.name);
                }
            }
            self.sandboxes.write().await.remove(key);
            self.volumes
                .detach(&sandbox.project, &sandbox.container_id)
                .await;
        }

        self.create(key).await
    }

    async fn touch(&self, key: &SandboxKey, status: SandboxStatus) -> Option<Sandbox> {
        let mut sandboxes = self.sandboxes.write().await;
        let sandbox = sandboxes.get_mut(key)?;
        sandbox.status = status;
        sandbox.last_used = Utc::now();
        Some(sandbox.clone())
    }

    async fn create(&self, key: &SandboxKey) -> SandboxResult<Sandbox> {
        let volume = self.volumes.reserve(&key.project).await?;
        let name = self.container_name(key);

        let container_id = match self.launch(key, &name, &volume).await {
            Ok(id) => id,
            Err(error) => {
                self.volumes.release(&key.project).await;
                return Err(error);
            }
        };

        let now = Utc::now();
        let sandbox = Sandbox {
            user: key.user.clone(),
            project: key.project.clone(),
            container_id: container_id.clone(),
            name: name.clone(),
            volume: volume.name.clone(),
            status: SandboxStatus::Running,
            created_at: now,
            last_used: now,
        };
        self.sandboxes
            .write()
            .await
            .insert(key.clone(), sandbox.clone());
        self.volumes.attach(&key.project, &container_id).await;

        info!("created sandbox {name} for {key} using volume {}", volume.name);
        Ok(sandbox)
    }

    /// Creates and starts the container, returning its id.
    async fn launch(&self, key: &SandboxKey, name: &str, volume: &Volume) -> SandboxResult<String> {
        let labels = HashMap::from([
            (self.config.label("user"), key.user.clone()),
            (self.config.label("repo"), key.project.clone()),
            (self.config.label("volume"), volume.name.clone()),
            (self.config.label("type"), "latex".to_string()),
        ]);
        let spec = ContainerSpec {
            name: name.to_string(),
            image: self.config.image.clone(),
            command: vec!["tail".into(), "-f".into(), "/dev/null".into()],
            working_dir: self.config.workdir.clone(),
            volume: volume.name.clone(),
            mount_target: self.config.workdir.clone(),
            network: Some(self.config.network.clone()).filter(|n| !n.is_empty()),
            labels,
        };

        let container_id = match self.runtime.create_container(&spec).await {
            Ok(id) => id,
            Err(RuntimeError::AlreadyExists(_)) => {
                self.remove_leftover(key, name).await?;
                self.runtime
                    .create_container(&spec)
                    .await
                    .map_err(|e| unavailable(name, e))?
            }
            Err(error) => return Err(unavailable(name, error)),
        };

        if let Err(error) = self.runtime.start_container(&container_id).await {
            if let Err(cleanup) = self.runtime.remove_container(&container_id).await {
                debug!("failed to clean up unstarted container {name}: {cleanup}");
            }
            return Err(unavailable(name, error));
        }
        Ok(container_id)
    }

    /// Removes an untracked container holding `name`, but only when its labels say it
    /// belongs to `key`.
    async fn remove_leftover(&self, key: &SandboxKey, name: &str) -> SandboxResult<()> {
        let type_filter = format!("{}=latex", self.config.label("type"));
        let records = self
            .runtime
            .list_containers(&type_filter)
            .await
            .map_err(|e| unavailable(name, e))?;
        let owned = records.into_iter().find(|record| {
            record.name == name
                && record.labels.get(&self.config.label("user")) == Some(&key.user)
                && record.labels.get(&self.config.label("repo")) == Some(&key.project)
        });
        let Some(leftover) = owned else {
            return Err(SandboxError::SandboxUnavailable(format!(
                "container name {name} is held by a container that does not belong to {key}"
            )));
        };

        warn!("removing untracked container {name} before recreating it");
        self.runtime
            .remove_container(&leftover.id)
            .await
            .map_err(|e| unavailable(name, e))
    }

    pub async fn get(&self, key: &SandboxKey) -> Option<Sandbox> {
        self.sandboxes.read().await.get(key).cloned()
    }

    pub async fn list(&self) -> Vec<Sandbox> {
        let mut sandboxes: Vec<Sandbox> = self.sandboxes.read().await.values().cloned().collect();
        sandboxes.sort_by(|a, b| a.key().cmp(&b.key()));
        sandboxes
    }

    pub async fn for_project(&self, project: &str) -> Vec<Sandbox> {
        let mut sandboxes: Vec<Sandbox> = self
            .sandboxes
            .read()
            .await
            .values()
            .filter(|s| s.project == project)
            .cloned()
            .collect();
        sandboxes.sort_by(|a, b| a.user.cmp(&b.user));
        sandboxes
    }

    /// Stops and deletes the sandbox for `key`. The project volume is left alone.
    pub async fn remove(&self, key: &SandboxKey) -> Option<Sandbox> {
        let _guard = self.locks.acquire(key).await;
        self.remove_locked(key).await
    }

    async fn remove_locked(&self, key: &SandboxKey) -> Option<Sandbox> {
        let sandbox = self.sandboxes.write().await.remove(key)?;

        match self
            .runtime
            .stop_container(&sandbox.container_id, self.config.stop_grace())
            .await
        {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(error) => warn!("failed to stop sandbox {}: {error}", sandbox.name),
        }
        match self.runtime.remove_container(&sandbox.container_id).await {
            Ok(()) => info!("removed sandbox {}", sandbox.name),
            Err(RuntimeError::NotFound(_)) => debug!("sandbox {} was already gone", sandbox.name),
            Err(error) => error!(?error, "failed to remove sandbox {}", sandbox.name),
        }

        self.volumes
            .detach(&sandbox.project, &sandbox.container_id)
            .await;
        Some(sandbox)
    }

    /// Removes every sandbox idle for longer than the configured threshold as of `now`.
    pub async fn reap_idle(&self, now: DateTime<Utc>) -> Vec<Sandbox> {
        let max_idle = chrono::Duration::from_std(self.config.max_idle())
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let is_idle = |sandbox: &Sandbox| now - sandbox.last_used > max_idle;

        let candidates: Vec<SandboxKey> = self
            .sandboxes
            .read()
            .await
            .iter()
            .filter(|(_, sandbox)| is_idle(sandbox))
            .map(|(key, _)| key.clone())
            .collect();

        let mut reaped = Vec::new();
        for key in candidates {
            let _guard = self.locks.acquire(&key).await;
            // A request may have refreshed the sandbox while we waited for the lock.
            let still_idle = self
                .sandboxes
                .read()
                .await
                .get(&key)
                .is_some_and(|sandbox| is_idle(sandbox));
            if !still_idle {
                continue;
            }
            info!("evicting idle sandbox for {key}");
            if let Some(sandbox) = self.remove_locked(&key).await {
                reaped.push(sandbox);
            }
        }
        reaped
    }

    pub fn spawn_reaper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let reaped = registry.reap_idle(Utc::now()).await;
                if !reaped.is_empty() {
                    info!("reaper evicted {} idle sandbox(es)", reaped.len());
                }
            }
        })
    }

    /// Rebuilds sandbox and volume tracking from labelled containers left by a previous run.
    pub async fn reconcile(&self) -> SandboxResult<usize> {
        let type_filter = format!("{}=latex", self.config.label("type"));
        let records = self.runtime.list_containers(&type_filter).await?;

        let user_label = self.config.label("user");
        let repo_label = self.config.label("repo");
        let volume_label = self.config.label("volume");

        let mut restored = 0;
        for record in records {
            let (Some(user), Some(project)) =
                (record.labels.get(&user_label), record.labels.get(&repo_label))
            else {
                debug!("skipping container {} without ownership labels", record.name);
                continue;
            };
            let key = SandboxKey::new(user, project);
            let volume = record
                .labels
                .get(&volume_label)
                .cloned()
                .unwrap_or_else(|| self.volumes.volume_name(project));

            let sandbox = Sandbox {
                user: user.clone(),
                project: project.clone(),
                container_id: record.id.clone(),
                name: record.name.clone(),
                volume: volume.clone(),
                status: if record.running {
                    SandboxStatus::Running
                } else {
                    SandboxStatus::Stopped
                },
                created_at: record.created_at,
                last_used: Utc::now(),
            };

            self.volumes
                .restore(project, &volume, &record.id, record.created_at)
                .await;
            self.sandboxes.write().await.insert(key, sandbox);
            restored += 1;
        }

        info!("restored {restored} existing sandbox(es)");
        Ok(restored)
    }
}

fn unavailable(name: &str, error: RuntimeError) -> SandboxError {
    SandboxError::SandboxUnavailable(format!("failed to create sandbox {name}: {error}"))
}
