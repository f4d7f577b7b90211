use crate::config::DaemonConfig;
use crate::protocol::{DebugTarget, LogCaptureSpec, ResourceInfo, SessionDefaults};
use crate::resource::ManagedResource;
use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

// Stopped-resource ids are remembered for a bounded window so a duplicate
// stop request is distinguishable from a request for an id that never
// existed.
const TOMBSTONE_TTL: Duration = Duration::from_secs(3600);
const TOMBSTONE_CAP: usize = 1024;

/// Outcome of a stop request, disambiguating the three cases clients care
/// about.
#[derive(Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// The resource existed; `true` if its subprocess was still running.
    Stopped(bool),
    /// The resource was already stopped by an earlier request.
    AlreadyStopped,
    /// The id was never a resource of this daemon (or the tombstone aged out).
    NotFound,
}

/// Per-workspace session state: defaults plus the live managed resources.
///
/// Resource creation is serialized through `creation_lock` so that two
/// concurrent starts for the same logical key observe each other and the
/// second one joins the first instead of double-spawning.
pub struct SessionRegistry {
    config: Arc<DaemonConfig>,
    defaults: RwLock<SessionDefaults>,
    resources: DashMap<Uuid, Arc<ManagedResource>>,
    logical_index: DashMap<String, Uuid>,
    tombstones: DashMap<Uuid, Instant>,
    creation_lock: Mutex<()>,
}

impl SessionRegistry {
    pub fn new(config: Arc<DaemonConfig>) -> Self {
        Self {
            config,
            defaults: RwLock::new(SessionDefaults::default()),
            resources: DashMap::new(),
            logical_index: DashMap::new(),
            tombstones: DashMap::new(),
            creation_lock: Mutex::new(()),
        }
    }

    pub fn get_defaults(&self) -> SessionDefaults {
        match self.defaults.read() {
            Ok(d) => d.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Merge the patch over the current defaults and return the new record.
    pub fn set_defaults(&self, patch: SessionDefaults) -> SessionDefaults {
        let mut defaults = match self.defaults.write() {
            Ok(d) => d,
            Err(poisoned) => poisoned.into_inner(),
        };
        defaults.merge(patch);
        defaults.clone()
    }

    pub fn clear_defaults(&self) -> SessionDefaults {
        let mut defaults = match self.defaults.write() {
            Ok(d) => d,
            Err(poisoned) => poisoned.into_inner(),
        };
        *defaults = SessionDefaults::default();
        defaults.clone()
    }

    /// Start a log capture, or join the live one with the same logical key.
    /// Returns the resource info plus whether it already existed.
    pub async fn start_log_capture(&self, spec: &LogCaptureSpec) -> Result<(ResourceInfo, bool)> {
        let _guard = self.creation_lock.lock().await;

        let logical_key = spec.logical_key();
        if let Some(existing) = self.live_resource_for_key(&logical_key) {
            debug!("Joining existing log capture for {}", logical_key);
            return Ok((existing.info(), true));
        }

        let resource = ManagedResource::spawn_log_capture(&self.config, spec).await?;
        info!(
            "Started log capture {} ({})",
            resource.id, resource.logical_key
        );
        self.insert(Arc::clone(&resource));
        Ok((resource.info(), false))
    }

    /// Attach a debugger to a target process. At most one live debug session
    /// per target pid; a second attach reports the target as busy.
    pub async fn attach_debugger(
        &self,
        target: &DebugTarget,
    ) -> Result<ResourceInfo, AttachError> {
        let _guard = self.creation_lock.lock().await;

        let logical_key = target.logical_key();
        if let Some(existing) = self.live_resource_for_key(&logical_key) {
            return Err(AttachError::TargetBusy(existing.id));
        }

        let resource = ManagedResource::spawn_debug_session(&self.config, target)
            .await
            .map_err(AttachError::Spawn)?;
        info!(
            "Attached debugger {} to pid {}",
            resource.id, target.pid
        );
        self.insert(Arc::clone(&resource));
        Ok(resource.info())
    }

    pub fn get(&self, resource_id: Uuid) -> Option<Arc<ManagedResource>> {
        self.resources.get(&resource_id).map(|r| Arc::clone(&r))
    }

    pub fn list(&self) -> Vec<ResourceInfo> {
        let mut infos: Vec<ResourceInfo> = self.resources.iter().map(|r| r.info()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Stop a resource and forget it, leaving a tombstone behind.
    pub async fn stop(&self, resource_id: Uuid) -> Result<StopOutcome> {
        let resource = match self.resources.get(&resource_id) {
            Some(r) => Arc::clone(&r),
            None => {
                return Ok(if self.tombstoned(resource_id) {
                    StopOutcome::AlreadyStopped
                } else {
                    StopOutcome::NotFound
                });
            }
        };

        let was_active = resource.stop(self.config.drain_grace).await?;
        self.remove(&resource);
        self.remember_tombstone(resource_id);
        info!("Stopped {} resource {}", resource.kind, resource_id);
        Ok(StopOutcome::Stopped(was_active))
    }

    /// Stop every resource, used during drain. Errors are logged, not
    /// propagated; drain must finish.
    pub async fn drain_all(&self) {
        let all: Vec<Arc<ManagedResource>> = self
            .resources
            .iter()
            .map(|r| Arc::clone(&r))
            .collect();
        for resource in all {
            if let Err(e) = resource.stop(self.config.drain_grace).await {
                warn!("Failed to stop resource {} during drain: {}", resource.id, e);
            }
            self.remove(&resource);
            self.remember_tombstone(resource.id);
        }
    }

    fn live_resource_for_key(&self, logical_key: &str) -> Option<Arc<ManagedResource>> {
        let id = *self.logical_index.get(logical_key)?;
        let live = self
            .resources
            .get(&id)
            .filter(|r| r.is_active())
            .map(|r| Arc::clone(&r));
        if live.is_none() {
            // Subprocess died on its own; clear the stale index entry so the
            // caller spawns a fresh one.
            self.logical_index.remove(logical_key);
            if let Some((_, dead)) = self.resources.remove(&id) {
                self.remember_tombstone(dead.id);
            }
        }
        live
    }

    fn insert(&self, resource: Arc<ManagedResource>) {
        self.logical_index
            .insert(resource.logical_key.clone(), resource.id);
        self.resources.insert(resource.id, resource);
    }

    fn remove(&self, resource: &ManagedResource) {
        self.resources.remove(&resource.id);
        // Only drop the index entry if it still points at this resource.
        if let Some(entry) = self.logical_index.get(&resource.logical_key) {
            if *entry == resource.id {
                drop(entry);
                self.logical_index.remove(&resource.logical_key);
            }
        }
    }

    fn tombstoned(&self, resource_id: Uuid) -> bool {
        match self.tombstones.get(&resource_id) {
            Some(stamp) => stamp.elapsed() < TOMBSTONE_TTL,
            None => false,
        }
    }

    fn remember_tombstone(&self, resource_id: Uuid) {
        self.tombstones.insert(resource_id, Instant::now());
        if self.tombstones.len() > TOMBSTONE_CAP {
            self.tombstones
                .retain(|_, stamp| stamp.elapsed() < TOMBSTONE_TTL);
        }
    }
}

/// Attach failures the router maps to distinct error kinds.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("target already has a live debug session ({0})")]
    TargetBusy(Uuid),
    #[error(transparent)]
    Spawn(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_script(script: &str) -> SessionRegistry {
        let config = DaemonConfig {
            capture_command: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                script.to_string(),
            ]),
            debugger_command: Some(vec!["/bin/cat".to_string()]),
            drain_grace: Duration::from_millis(500),
            ..DaemonConfig::default()
        };
        SessionRegistry::new(Arc::new(config))
    }

    #[test]
    fn defaults_merge_and_clear() {
        let registry = registry_with_script("true");
        assert!(registry.get_defaults().is_empty());

        let updated = registry.set_defaults(SessionDefaults {
            scheme: Some("App".to_string()),
            ..Default::default()
        });
        assert_eq!(updated.scheme.as_deref(), Some("App"));

        let updated = registry.set_defaults(SessionDefaults {
            simulator: Some("iPhone 16".to_string()),
            ..Default::default()
        });
        assert_eq!(updated.scheme.as_deref(), Some("App"));
        assert_eq!(updated.simulator.as_deref(), Some("iPhone 16"));

        assert!(registry.clear_defaults().is_empty());
    }

    #[tokio::test]
    async fn same_spec_joins_existing_capture() {
        let registry = registry_with_script("sleep 30");
        let spec = LogCaptureSpec {
            subsystem: Some("com.example.app".to_string()),
            ..Default::default()
        };

        let (first, already) = registry.start_log_capture(&spec).await.unwrap();
        assert!(!already);
        let (second, already) = registry.start_log_capture(&spec).await.unwrap();
        assert!(already);
        assert_eq!(first.id, second.id);
        assert_eq!(registry.resource_count(), 1);

        registry.drain_all().await;
    }

    #[tokio::test]
    async fn different_specs_get_distinct_resources() {
        let registry = registry_with_script("sleep 30");
        let a = LogCaptureSpec {
            subsystem: Some("a".to_string()),
            ..Default::default()
        };
        let b = LogCaptureSpec {
            subsystem: Some("b".to_string()),
            ..Default::default()
        };

        let (first, _) = registry.start_log_capture(&a).await.unwrap();
        let (second, _) = registry.start_log_capture(&b).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(registry.resource_count(), 2);

        registry.drain_all().await;
    }

    #[tokio::test]
    async fn dead_capture_is_replaced_not_joined() {
        let registry = registry_with_script("true");
        let spec = LogCaptureSpec::default();

        let (first, _) = registry.start_log_capture(&spec).await.unwrap();
        // Give the short-lived subprocess time to exit.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let (second, already) = registry.start_log_capture(&spec).await.unwrap();
        assert!(!already);
        assert_ne!(first.id, second.id);

        registry.drain_all().await;
    }

    #[tokio::test]
    async fn stop_then_stop_again_reports_already_stopped() {
        let registry = registry_with_script("sleep 30");
        let (info, _) = registry
            .start_log_capture(&LogCaptureSpec::default())
            .await
            .unwrap();

        assert_eq!(
            registry.stop(info.id).await.unwrap(),
            StopOutcome::Stopped(true)
        );
        assert_eq!(
            registry.stop(info.id).await.unwrap(),
            StopOutcome::AlreadyStopped
        );
        assert_eq!(
            registry.stop(Uuid::new_v4()).await.unwrap(),
            StopOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn second_attach_to_same_pid_is_busy() {
        let registry = registry_with_script("sleep 30");
        let target = DebugTarget {
            pid: 4242,
            process_name: None,
        };

        let first = registry.attach_debugger(&target).await.unwrap();
        match registry.attach_debugger(&target).await {
            Err(AttachError::TargetBusy(id)) => assert_eq!(id, first.id),
            other => panic!("expected TargetBusy, got {other:?}"),
        }

        registry.drain_all().await;
    }

    #[tokio::test]
    async fn drain_stops_everything() {
        let registry = registry_with_script("sleep 30");
        for i in 0..3 {
            let spec = LogCaptureSpec {
                subsystem: Some(format!("app{i}")),
                ..Default::default()
            };
            registry.start_log_capture(&spec).await.unwrap();
        }
        assert_eq!(registry.resource_count(), 3);

        registry.drain_all().await;
        assert_eq!(registry.resource_count(), 0);
    }
}
