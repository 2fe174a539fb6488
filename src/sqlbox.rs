//! Isolated data instance manager
//!
//! One ephemeral MySQL instance per learner session, running in a Docker
//! container. The manager keeps an explicit registry from session key to
//! typed instance state (never parsing infrastructure metadata to recover
//! state), serializes transitions per key behind one lock per session, and
//! garbage-collects aged instances with a periodic sweep.
//!
//! State machine per session:
//! Absent -> Provisioning -> Ready -> (Busy <-> Ready) -> Resetting -> Ready | Terminated

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::errors::GradeError;

/// Identifies one learner's practice session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub author_id: i64,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(author_id: i64, session_id: impl Into<String>) -> Self {
        Self {
            author_id,
            session_id: session_id.into(),
        }
    }

    /// Container-safe name for this session's instance
    pub fn container_name(&self) -> String {
        let safe: String = self
            .session_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        format!("sql_sandbox_{}_{}", self.author_id, safe)
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.author_id, self.session_id)
    }
}

/// Connection parameters for one provisioned instance. Exposed only to the
/// query executor, never to the caller.
#[derive(Debug, Clone)]
pub struct InstanceHandle {
    pub container_id: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub created_at: DateTime<Utc>,
}

/// Typed lifecycle state of one session's instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Provisioning,
    Ready,
    Busy,
    Resetting,
    Terminated,
}

#[derive(Debug)]
struct SessionSlot {
    state: InstanceState,
    handle: Option<InstanceHandle>,
}

/// Backend seam: how instances are actually provisioned and probed.
/// `DockerBackend` is the production implementation; tests plug in a mock.
#[async_trait]
pub trait InstanceBackend: Send + Sync {
    /// Create (or re-adopt) the instance for a session
    async fn provision(&self, key: &SessionKey) -> Result<InstanceHandle>;
    /// Restart the instance in place, restoring initial schema/data.
    /// Returns a refreshed handle: the published host port can change
    /// across a restart.
    async fn restart(&self, handle: &InstanceHandle) -> Result<InstanceHandle>;
    /// Stop and remove the instance
    async fn remove(&self, handle: &InstanceHandle) -> Result<()>;
    /// True once the instance accepts connections
    async fn ping(&self, handle: &InstanceHandle) -> bool;
}

/// Registry of per-session isolated instances
pub struct InstanceManager<B: InstanceBackend> {
    backend: B,
    sessions: std::sync::Mutex<HashMap<SessionKey, Arc<Mutex<SessionSlot>>>>,
    startup_timeout: Duration,
    poll_interval: Duration,
}

impl<B: InstanceBackend> InstanceManager<B> {
    pub fn new(backend: B, startup_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            backend,
            sessions: std::sync::Mutex::new(HashMap::new()),
            startup_timeout,
            poll_interval,
        }
    }

    fn slot(&self, key: &SessionKey) -> Arc<Mutex<SessionSlot>> {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SessionSlot {
                    state: InstanceState::Provisioning,
                    handle: None,
                }))
            })
            .clone()
    }

    /// Return the session's Ready instance, provisioning one if absent.
    /// Transitions for a given key are serialized; distinct keys proceed in
    /// parallel.
    pub async fn ensure(&self, key: &SessionKey) -> Result<InstanceHandle, GradeError> {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;

        if let Some(handle) = &guard.handle {
            if matches!(guard.state, InstanceState::Ready | InstanceState::Busy) {
                debug!("Reusing instance for session {}", key);
                return Ok(handle.clone());
            }
        }

        guard.state = InstanceState::Provisioning;
        info!("Provisioning isolated instance for session {}", key);

        let handle = self.backend.provision(key).await.map_err(|e| {
            GradeError::SandboxUnavailable(format!("failed to provision instance: {:#}", e))
        })?;

        if let Err(e) = self.wait_ready(&handle).await {
            // Do not leak a half-started container behind a failed session
            if let Err(remove_err) = self.backend.remove(&handle).await {
                warn!(
                    "Failed to remove unready instance for {}: {:#}",
                    key, remove_err
                );
            }
            guard.state = InstanceState::Terminated;
            return Err(e);
        }

        guard.handle = Some(handle.clone());
        guard.state = InstanceState::Ready;
        info!("Instance ready for session {} on port {}", key, handle.port);
        Ok(handle)
    }

    /// Restart a session's instance in place, restoring initial data.
    /// Provisions a fresh instance when none exists.
    pub async fn reset(&self, key: &SessionKey) -> Result<InstanceHandle, GradeError> {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;

        let handle = match &guard.handle {
            Some(handle) => handle.clone(),
            None => {
                drop(guard);
                return self.ensure(key).await;
            }
        };

        guard.state = InstanceState::Resetting;
        info!("Resetting instance for session {}", key);

        let refreshed = self.backend.restart(&handle).await.map_err(|e| {
            GradeError::SandboxUnavailable(format!("failed to restart instance: {:#}", e))
        })?;
        self.wait_ready(&refreshed).await?;

        guard.handle = Some(refreshed.clone());
        guard.state = InstanceState::Ready;
        Ok(refreshed)
    }

    /// Stop and remove a session's instance. Idempotent.
    pub async fn terminate(&self, key: &SessionKey) -> Result<(), GradeError> {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;

        if let Some(handle) = guard.handle.take() {
            info!("Terminating instance for session {}", key);
            self.backend.remove(&handle).await.map_err(|e| {
                GradeError::SandboxUnavailable(format!("failed to remove instance: {:#}", e))
            })?;
        }
        guard.state = InstanceState::Terminated;
        Ok(())
    }

    /// Terminate every instance older than `max_age`, regardless of
    /// activity. Takes each per-key lock, so it tolerates racing with an
    /// in-flight ensure/reset for the same key. Returns the reap count.
    pub async fn sweep(&self, max_age: Duration) -> usize {
        let snapshot: Vec<(SessionKey, Arc<Mutex<SessionSlot>>)> = {
            let sessions = self
                .sessions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            sessions
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        let now = Utc::now();
        let mut reaped = 0;

        for (key, slot) in snapshot {
            let mut guard = slot.lock().await;

            let expired = guard.handle.as_ref().is_some_and(|handle| {
                let age = now.signed_duration_since(handle.created_at);
                age.to_std().unwrap_or(Duration::ZERO) >= max_age
            });

            if expired {
                if let Some(handle) = guard.handle.take() {
                    info!("Sweeping aged instance for session {}", key);
                    if let Err(e) = self.backend.remove(&handle).await {
                        warn!("Sweep failed to remove instance for {}: {:#}", key, e);
                        guard.handle = Some(handle);
                        continue;
                    }
                    guard.state = InstanceState::Terminated;
                    reaped += 1;
                }
            }

            let terminated = guard.state == InstanceState::Terminated;
            drop(guard);

            if terminated {
                let mut sessions = self
                    .sessions
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                sessions.remove(&key);
            }
        }

        reaped
    }

    /// Mark a session Busy while a query executes against it
    pub async fn mark_busy(&self, key: &SessionKey) {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        if guard.state == InstanceState::Ready {
            guard.state = InstanceState::Busy;
        }
    }

    /// Return a session to Ready after use
    pub async fn mark_ready(&self, key: &SessionKey) {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;
        if guard.state == InstanceState::Busy {
            guard.state = InstanceState::Ready;
        }
    }

    /// Observed state for a session, if the registry knows it
    #[allow(dead_code)]
    pub async fn state_of(&self, key: &SessionKey) -> Option<InstanceState> {
        let slot = {
            let sessions = self
                .sessions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            sessions.get(key).cloned()
        }?;
        let guard = slot.lock().await;
        Some(guard.state)
    }

    /// Number of sessions currently registered
    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    async fn wait_ready(&self, handle: &InstanceHandle) -> Result<(), GradeError> {
        let deadline = Instant::now() + self.startup_timeout;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if self.backend.ping(handle).await {
                debug!(
                    "Instance {} ready after {} attempts",
                    handle.container_id, attempt
                );
                return Ok(());
            }

            if Instant::now() + self.poll_interval > deadline {
                return Err(GradeError::SandboxUnavailable(format!(
                    "instance did not become ready within {:?} ({} attempts)",
                    self.startup_timeout, attempt
                )));
            }

            sleep(self.poll_interval).await;
        }
    }
}

/// Production backend: one MySQL container per session via the docker CLI
pub struct DockerBackend {
    image: String,
}

const CONTAINER_DB: &str = "sandbox_db";
const LABEL_KIND: &str = "practice.kind=sql_sandbox";
const PING_TIMEOUT: Duration = Duration::from_secs(5);

impl DockerBackend {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
        }
    }

    /// Per-session credentials, derived from the session key and the
    /// provisioning instant. Never reused across sessions.
    fn derive_credentials(key: &SessionKey, at: DateTime<Utc>) -> (String, String) {
        let mut hasher = Sha256::new();
        hasher.update(key.container_name().as_bytes());
        hasher.update(at.timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
        let digest = hex::encode(hasher.finalize());
        let user = format!("u{}", &digest[..8]);
        let password = digest[8..40].to_string();
        (user, password)
    }

    async fn docker(args: &[&str]) -> Result<String> {
        let output = Command::new("docker")
            .args(args)
            .output()
            .await
            .context("Failed to invoke docker")?;

        if !output.status.success() {
            bail!(
                "docker {} failed: {}",
                args.first().copied().unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Recover an existing container for this session, if one survived a
    /// worker restart. State still lives in the registry; only the handle's
    /// connection parameters are read back from labels.
    async fn adopt_existing(&self, name: &str) -> Result<Option<InstanceHandle>> {
        let inspect = match Self::docker(&["inspect", name]).await {
            Ok(json) => json,
            Err(_) => return Ok(None),
        };

        let parsed: serde_json::Value =
            serde_json::from_str(&inspect).context("Failed to parse docker inspect output")?;
        let entry = match parsed.as_array().and_then(|a| a.first()) {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let running = entry
            .pointer("/State/Running")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !running {
            Self::docker(&["start", name]).await?;
        }

        let labels = entry.pointer("/Config/Labels");
        let label = |key: &str| -> Option<String> {
            labels
                .and_then(|l| l.get(key))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };

        let (user, password) = match (label("practice.user"), label("practice.password")) {
            (Some(user), Some(password)) => (user, password),
            _ => return Ok(None), // not one of ours
        };

        let container_id = entry
            .get("Id")
            .and_then(|v| v.as_str())
            .unwrap_or(name)
            .to_string();

        let created_at = label("practice.created_at")
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let port = self.mapped_port(name).await?;

        Ok(Some(InstanceHandle {
            container_id,
            port,
            database: CONTAINER_DB.into(),
            user,
            password,
            created_at,
        }))
    }

    async fn mapped_port(&self, name: &str) -> Result<u16> {
        let mapping = Self::docker(&["port", name, "3306/tcp"]).await?;
        // "0.0.0.0:49153" (possibly multiple lines for v4/v6)
        mapping
            .lines()
            .filter_map(|line| line.rsplit(':').next())
            .find_map(|p| p.trim().parse::<u16>().ok())
            .with_context(|| format!("MySQL port 3306 is not exposed for {}", name))
    }
}

#[async_trait]
impl InstanceBackend for DockerBackend {
    async fn provision(&self, key: &SessionKey) -> Result<InstanceHandle> {
        let name = key.container_name();

        if let Some(existing) = self.adopt_existing(&name).await? {
            info!("Adopted existing container {} for session {}", name, key);
            return Ok(existing);
        }

        let created_at = Utc::now();
        let (user, password) = Self::derive_credentials(key, created_at);
        let root_password = format!("root_{}", password);

        let created_label = format!("practice.created_at={}", created_at.to_rfc3339());
        let author_label = format!("practice.author={}", key.author_id);
        let user_label = format!("practice.user={}", user);
        let password_label = format!("practice.password={}", password);
        let env_root = format!("MYSQL_ROOT_PASSWORD={}", root_password);
        let env_db = format!("MYSQL_DATABASE={}", CONTAINER_DB);
        let env_user = format!("MYSQL_USER={}", user);
        let env_password = format!("MYSQL_PASSWORD={}", password);

        let container_id = Self::docker(&[
            "run",
            "-d",
            "--name",
            &name,
            "--memory",
            "512m",
            "--cpus",
            "0.5",
            "--pids-limit",
            "256",
            "--security-opt=no-new-privileges",
            "-p",
            "127.0.0.1:0:3306",
            "-e",
            &env_root,
            "-e",
            &env_db,
            "-e",
            &env_user,
            "-e",
            &env_password,
            "--label",
            LABEL_KIND,
            "--label",
            &created_label,
            "--label",
            &author_label,
            "--label",
            &user_label,
            "--label",
            &password_label,
            &self.image,
        ])
        .await?;

        let port = self.mapped_port(&name).await?;
        info!(
            "Created container {} for session {} on port {}",
            &container_id[..12.min(container_id.len())],
            key,
            port
        );

        Ok(InstanceHandle {
            container_id,
            port,
            database: CONTAINER_DB.into(),
            user,
            password,
            created_at,
        })
    }

    async fn restart(&self, handle: &InstanceHandle) -> Result<InstanceHandle> {
        Self::docker(&["restart", &handle.container_id]).await?;
        let port = self.mapped_port(&handle.container_id).await?;
        Ok(InstanceHandle {
            port,
            ..handle.clone()
        })
    }

    async fn remove(&self, handle: &InstanceHandle) -> Result<()> {
        match Self::docker(&["rm", "-f", &handle.container_id]).await {
            Ok(_) => Ok(()),
            // Already gone counts as removed
            Err(e) if e.to_string().contains("No such container") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn ping(&self, handle: &InstanceHandle) -> bool {
        use sqlx::mysql::MySqlConnectOptions;
        use sqlx::ConnectOptions;

        let options = MySqlConnectOptions::new()
            .host("127.0.0.1")
            .port(handle.port)
            .username(&handle.user)
            .password(&handle.password)
            .database(&handle.database);

        match timeout(PING_TIMEOUT, options.connect()).await {
            Ok(Ok(mut conn)) => {
                use sqlx::Connection;
                let _ = conn.close().await;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockBackend {
        provisioned: AtomicUsize,
        restarted: AtomicUsize,
        removed: AtomicUsize,
        never_ready: AtomicBool,
    }

    #[async_trait]
    impl InstanceBackend for MockBackend {
        async fn provision(&self, key: &SessionKey) -> Result<InstanceHandle> {
            let n = self.provisioned.fetch_add(1, Ordering::SeqCst);
            Ok(InstanceHandle {
                container_id: format!("mock-{}-{}", key.author_id, n),
                port: 33000 + n as u16,
                database: "sandbox_db".into(),
                user: format!("u{}", n),
                password: format!("p{}", n),
                created_at: Utc::now(),
            })
        }

        async fn restart(&self, handle: &InstanceHandle) -> Result<InstanceHandle> {
            self.restarted.fetch_add(1, Ordering::SeqCst);
            Ok(handle.clone())
        }

        async fn remove(&self, _handle: &InstanceHandle) -> Result<()> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn ping(&self, _handle: &InstanceHandle) -> bool {
            !self.never_ready.load(Ordering::SeqCst)
        }
    }

    fn manager(backend: MockBackend) -> InstanceManager<MockBackend> {
        InstanceManager::new(
            backend,
            Duration::from_millis(200),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_ensure_reuses_existing_instance() {
        let mgr = manager(MockBackend::default());
        let key = SessionKey::new(1, "abc");

        let first = mgr.ensure(&key).await.unwrap();
        let second = mgr.ensure(&key).await.unwrap();

        assert_eq!(first.container_id, second.container_id);
        assert_eq!(mgr.backend.provisioned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_get_distinct_instances() {
        let mgr = manager(MockBackend::default());

        let a = mgr.ensure(&SessionKey::new(1, "s")).await.unwrap();
        let b = mgr.ensure(&SessionKey::new(2, "s")).await.unwrap();

        assert_ne!(a.container_id, b.container_id);
        assert_ne!(a.password, b.password);
        assert_eq!(mgr.session_count(), 2);
    }

    #[tokio::test]
    async fn test_reset_leaves_instance_ready() {
        let mgr = manager(MockBackend::default());
        let key = SessionKey::new(3, "xyz");

        let before = mgr.ensure(&key).await.unwrap();
        let after = mgr.reset(&key).await.unwrap();

        assert_eq!(before.container_id, after.container_id);
        assert_eq!(mgr.backend.restarted.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.state_of(&key).await, Some(InstanceState::Ready));
    }

    #[tokio::test]
    async fn test_sweep_zero_age_terminates_everything() {
        let mgr = manager(MockBackend::default());
        mgr.ensure(&SessionKey::new(1, "a")).await.unwrap();
        mgr.ensure(&SessionKey::new(2, "b")).await.unwrap();

        let reaped = mgr.sweep(Duration::ZERO).await;
        assert_eq!(reaped, 2);
        assert_eq!(mgr.session_count(), 0);
        assert_eq!(mgr.backend.removed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sweep_spares_young_instances() {
        let mgr = manager(MockBackend::default());
        let key = SessionKey::new(9, "young");
        mgr.ensure(&key).await.unwrap();

        let reaped = mgr.sweep(Duration::from_secs(3600)).await;
        assert_eq!(reaped, 0);
        assert_eq!(mgr.session_count(), 1);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let mgr = manager(MockBackend::default());
        let key = SessionKey::new(5, "gone");
        mgr.ensure(&key).await.unwrap();

        mgr.terminate(&key).await.unwrap();
        mgr.terminate(&key).await.unwrap();

        assert_eq!(mgr.backend.removed.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.state_of(&key).await, Some(InstanceState::Terminated));
    }

    #[tokio::test]
    async fn test_ensure_after_terminate_reprovisions() {
        let mgr = manager(MockBackend::default());
        let key = SessionKey::new(6, "again");

        let first = mgr.ensure(&key).await.unwrap();
        mgr.terminate(&key).await.unwrap();
        let second = mgr.ensure(&key).await.unwrap();

        assert_ne!(first.container_id, second.container_id);
    }

    #[tokio::test]
    async fn test_startup_timeout_is_sandbox_unavailable() {
        let backend = MockBackend::default();
        backend.never_ready.store(true, Ordering::SeqCst);
        let mgr = manager(backend);

        let err = mgr.ensure(&SessionKey::new(7, "slow")).await.unwrap_err();
        assert!(matches!(err, GradeError::SandboxUnavailable(_)));
        // The unready container must not be leaked
        assert_eq!(mgr.backend.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_busy_ready_transitions() {
        let mgr = manager(MockBackend::default());
        let key = SessionKey::new(8, "busy");
        mgr.ensure(&key).await.unwrap();

        mgr.mark_busy(&key).await;
        assert_eq!(mgr.state_of(&key).await, Some(InstanceState::Busy));
        mgr.mark_ready(&key).await;
        assert_eq!(mgr.state_of(&key).await, Some(InstanceState::Ready));
    }

    #[test]
    fn test_container_name_sanitizes_session_id() {
        let key = SessionKey::new(42, "ab/c;d e");
        assert_eq!(key.container_name(), "sql_sandbox_42_abcde");
    }

    #[test]
    fn test_credentials_differ_across_sessions() {
        let now = Utc::now();
        let (user_a, pass_a) = DockerBackend::derive_credentials(&SessionKey::new(1, "s"), now);
        let (user_b, pass_b) = DockerBackend::derive_credentials(&SessionKey::new(2, "s"), now);
        assert_ne!(user_a, user_b);
        assert_ne!(pass_a, pass_b);
        assert_eq!(pass_a.len(), 32);
    }
}
