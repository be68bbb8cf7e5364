//! Bounded pool of scored sessions with rotation and persistence

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use rand::seq::IndexedRandom;
use tokio::task::JoinHandle;

use super::{Session, SessionState};
use crate::config::SessionPoolConfig;
use crate::events::{EventBus, SystemEvent};
use crate::storage::{KeyValueStore, SESSION_POOL_STATE_KEY};

/// User-supplied constructor for new sessions.
pub type SessionFactory = Box<dyn Fn(&SessionPoolConfig) -> Session + Send + Sync>;

/// Pool of up to `max_pool_size` sessions.
///
/// Sessions are created lazily; every session returned from the pool is
/// usable at the moment of return. Unusable sessions are purged on access.
pub struct SessionPool {
    config: SessionPoolConfig,
    kv: Option<Arc<dyn KeyValueStore>>,
    factory: Option<SessionFactory>,
    sessions: Mutex<Vec<Arc<Session>>>,
}

impl SessionPool {
    #[must_use]
    pub fn new(config: SessionPoolConfig) -> Self {
        Self {
            config,
            kv: None,
            factory: None,
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Attach the key-value store used for persistence.
    #[must_use]
    pub fn with_kv_store(mut self, kv: Arc<dyn KeyValueStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Replace the default session factory.
    #[must_use]
    pub fn with_factory(mut self, factory: SessionFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Reload previously persisted sessions, dropping unusable ones.
    pub async fn initialize(&self) -> Result<()> {
        let Some(kv) = &self.kv else {
            return Ok(());
        };
        let Some(value) = kv.get_value(SESSION_POOL_STATE_KEY).await? else {
            return Ok(());
        };
        let states: Vec<SessionState> =
            serde_json::from_value(value).context("persisted session pool state is corrupt")?;

        let mut restored = Vec::new();
        for state in states {
            let session = Session::from_state(&self.config, state);
            if session.is_usable() {
                restored.push(Arc::new(session));
            }
        }
        info!("restored {} usable session(s) from state", restored.len());
        *self.sessions.lock() = restored;
        Ok(())
    }

    /// Current number of pooled sessions (usable or not yet purged).
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Borrow a usable session, creating one when the pool has room.
    ///
    /// While the pool is not full a new session is created with probability
    /// `1 − size/max`, so a young pool grows quickly and a full pool
    /// recycles. The returned session has its usage counted.
    #[must_use]
    pub fn get_session(&self) -> Arc<Session> {
        let mut sessions = self.sessions.lock();
        sessions.retain(|session| session.is_usable());

        let size = sessions.len();
        let max = self.config.max_pool_size().max(1);
        let create_probability = 1.0 - (size as f64 / max as f64);
        let should_create =
            size < max && (size == 0 || rand::rng().random::<f64>() < create_probability);

        let session = if should_create {
            let session = Arc::new(self.build_session());
            debug!("created session {} (pool size {})", session.id(), size + 1);
            sessions.push(Arc::clone(&session));
            session
        } else {
            // Pool is full (or chance said reuse): pick a random usable one.
            // `retain` above guarantees at least one exists unless max is 0.
            match sessions.choose(&mut rand::rng()) {
                Some(session) => Arc::clone(session),
                None => {
                    let session = Arc::new(self.build_session());
                    sessions.push(Arc::clone(&session));
                    session
                }
            }
        };

        session.note_checkout();
        session
    }

    /// Fetch a specific session; `None` when it was retired or purged.
    #[must_use]
    pub fn get_session_by_id(&self, id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock();
        sessions.retain(|session| session.is_usable());
        let session = sessions
            .iter()
            .find(|session| session.id() == id)
            .map(Arc::clone)?;
        session.note_checkout();
        Some(session)
    }

    fn build_session(&self) -> Session {
        match &self.factory {
            Some(factory) => factory(&self.config),
            None => default_session(&self.config),
        }
    }

    /// Persist all current sessions to the key-value store.
    pub async fn persist_state(&self) -> Result<()> {
        let Some(kv) = &self.kv else {
            return Ok(());
        };
        let states: Vec<SessionState> = {
            let sessions = self.sessions.lock();
            sessions.iter().map(|session| session.to_state()).collect()
        };
        kv.set_value(SESSION_POOL_STATE_KEY, serde_json::to_value(&states)?)
            .await
    }

    /// Persist the pool on every `PersistState` event until the bus closes.
    pub fn listen(self: Arc<Self>, bus: &Arc<EventBus>) -> JoinHandle<()> {
        let pool = self;
        let mut receiver = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                if matches!(
                    event,
                    SystemEvent::PersistState { .. } | SystemEvent::Migrating
                ) && let Err(err) = pool.persist_state().await
                {
                    warn!("session pool persistence failed: {err}");
                }
            }
        })
    }
}

/// Default factory: cookie jar plus a browser-like fingerprint.
fn default_session(config: &SessionPoolConfig) -> Session {
    let mut rng = rand::rng();
    let (width, height) = [(1920, 1080), (1536, 864), (1366, 768), (2560, 1440)]
        .choose(&mut rng)
        .copied()
        .unwrap_or((1920, 1080));
    let chrome_major = rng.random_range(120..=138);

    let fingerprint = serde_json::json!({
        "userAgent": format!(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/{chrome_major}.0.0.0 Safari/537.36"
        ),
        "locale": "en-US",
        "platform": "Win32",
        "viewport": { "width": width, "height": height },
    });

    Session::new(config).with_fingerprint(fingerprint)
}
