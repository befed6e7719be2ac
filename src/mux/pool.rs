//! Session pool: lifecycle and load balancing for physical links
//!
//! The pool owns a set of [`Session`]s to one or more servers and picks the
//! least-loaded one for each new virtual connection. It lazily grows when a
//! session is saturated or the pool is under its minimum, replaces sessions
//! that die (unless liveness declared them game-over), and serializes all
//! creation through one lock so concurrent callers never stampede the
//! remote with dials.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::conn::Conn;
use super::session::{client_handshake, Session, SessionConfig, StreamStatus};
use super::{MuxError, CREATE_RETRIES};
use crate::transport::Dialer;

/// Knows how to produce one authenticated session (dial + handshake),
/// possibly through a distinct transport or credential pair per factory.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> Result<Session, MuxError>;

    /// Where this factory connects to (diagnostics)
    fn endpoint(&self) -> &str;
}

/// Factory for plain-TCP sessions to one server endpoint
pub struct TcpSessionFactory {
    address: String,
    username: String,
    password: String,
    dialer: Arc<dyn Dialer>,
    session_config: SessionConfig,
    connect_timeout: Duration,
}

impl TcpSessionFactory {
    pub fn new(
        address: String,
        username: String,
        password: String,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            address,
            username,
            password,
            dialer,
            session_config: SessionConfig::default(),
            connect_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }
}

#[async_trait]
impl SessionFactory for TcpSessionFactory {
    async fn create(&self) -> Result<Session, MuxError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| MuxError::Timeout("connect"))??;
        stream.set_nodelay(true)?;

        let mut stream = stream;
        client_handshake(&mut stream, &self.username, &self.password).await?;
        info!("Session established to {}", self.address);

        let (reader, writer) = stream.into_split();
        Ok(Session::spawn(
            reader,
            writer,
            Arc::clone(&self.dialer),
            self.address.clone(),
            self.session_config.clone(),
        ))
    }

    fn endpoint(&self) -> &str {
        &self.address
    }
}

/// Pool sizing policy
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Grow whenever fewer live sessions than this remain
    pub min_sessions: usize,
    /// Grow once the least-loaded session carries this many streams
    pub max_conns_per_session: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_sessions: 1,
            max_conns_per_session: 16,
        }
    }
}

/// Read-only snapshot of one pooled session (admin surface)
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub peer: String,
    pub conns: usize,
    pub read_rate: u64,
    pub write_rate: u64,
    pub game_over: bool,
    pub streams: Vec<StreamStatus>,
}

struct PoolInner {
    sessions: Mutex<Vec<Session>>,
    factories: Vec<Arc<dyn SessionFactory>>,
    next_factory: AtomicUsize,
    /// Only one factory call in flight at a time
    create_lock: tokio::sync::Mutex<()>,
    /// A background growth task is already queued or running
    growing: AtomicBool,
    config: PoolConfig,
}

/// Load-balancing manager for a set of sessions. Cheap to clone.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(factories: Vec<Arc<dyn SessionFactory>>, config: PoolConfig) -> Self {
        assert!(!factories.is_empty(), "a pool needs at least one factory");
        Self {
            inner: Arc::new(PoolInner {
                sessions: Mutex::new(Vec::new()),
                factories,
                next_factory: AtomicUsize::new(0),
                create_lock: tokio::sync::Mutex::new(()),
                growing: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// Pick a session for a new virtual connection.
    ///
    /// An empty pool creates one synchronously (serialized, so only the
    /// first caller dials). Otherwise the least-loaded session is returned
    /// immediately, and a saturated pick or an undersized pool triggers one
    /// speculative background growth.
    pub async fn get_or_create(&self) -> Result<Session, MuxError> {
        if let Some(best) = self.least_loaded() {
            if best.conn_count() >= self.inner.config.max_conns_per_session
                || self.len() < self.inner.config.min_sessions
            {
                self.spawn_grow();
            }
            return Ok(best);
        }

        let _guard = self.inner.create_lock.lock().await;
        // Someone else may have created while we waited for the lock
        if let Some(best) = self.least_loaded() {
            return Ok(best);
        }
        let session = self.create_session().await?;
        self.install(session.clone());
        Ok(session)
    }

    /// Open a virtual connection through the least-loaded session
    pub async fn dial(&self, address: &str) -> Result<Conn, MuxError> {
        let session = match self.get_or_create().await {
            Ok(session) => session,
            Err(e) => {
                error!("No session available for {}: {}", address, e);
                return Err(MuxError::NoSession);
            }
        };
        session.dial(address).await
    }

    /// Drop a dead session from the pool (idempotent) and, when the pool
    /// fell under its minimum and the session was not game-over, schedule
    /// one replacement.
    pub fn remove(&self, session: &Session) {
        let removed = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            let before = sessions.len();
            sessions.retain(|s| !s.same_as(session));
            sessions.len() != before
        };
        if !removed {
            return;
        }
        debug!("Session to {} left the pool", session.peer());

        if session.is_game_over() {
            warn!(
                "Session to {} was given up on, not scheduling a replacement",
                session.peer()
            );
            return;
        }
        if self.len() < self.inner.config.min_sessions {
            info!("Pool below minimum, scheduling a replacement session");
            self.spawn_grow();
        }
    }

    /// Force-close every session ("cut everything and reconnect")
    pub async fn cut_all(&self) {
        let snapshot: Vec<Session> = self.inner.sessions.lock().unwrap().clone();
        info!("Cutting {} session(s)", snapshot.len());
        for session in snapshot {
            session.close().await;
        }
    }

    /// Live session count
    pub fn len(&self) -> usize {
        self.inner.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-only snapshot of every pooled session (admin surface)
    pub fn status(&self) -> Vec<SessionStatus> {
        let sessions = self.inner.sessions.lock().unwrap();
        sessions
            .iter()
            .map(|s| SessionStatus {
                peer: s.peer().to_string(),
                conns: s.conn_count(),
                read_rate: s.read_rate(),
                write_rate: s.write_rate(),
                game_over: s.is_game_over(),
                streams: s.streams(),
            })
            .collect()
    }

    fn least_loaded(&self) -> Option<Session> {
        let sessions = self.inner.sessions.lock().unwrap();
        sessions
            .iter()
            .filter(|s| !s.is_closed())
            .min_by_key(|s| s.conn_count())
            .cloned()
    }

    fn install(&self, session: Session) {
        self.inner.sessions.lock().unwrap().push(session.clone());
        let pool = self.clone();
        tokio::spawn(async move {
            session.wait_closed().await;
            pool.remove(&session);
        });
    }

    /// Queue at most one background growth, no matter how many callers saw
    /// the same saturated pool.
    fn spawn_grow(&self) {
        if self.inner.growing.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move {
            let _guard = pool.inner.create_lock.lock().await;
            // Conditions may have changed while we waited for the lock
            if pool.needs_growth() {
                match pool.create_session().await {
                    Ok(session) => pool.install(session),
                    Err(e) => error!("Background pool growth failed: {}", e),
                }
            }
            pool.inner.growing.store(false, Ordering::SeqCst);
        });
    }

    fn needs_growth(&self) -> bool {
        let sessions = self.inner.sessions.lock().unwrap();
        let live: Vec<&Session> = sessions.iter().filter(|s| !s.is_closed()).collect();
        if live.len() < self.inner.config.min_sessions {
            return true;
        }
        live.iter()
            .map(|s| s.conn_count())
            .min()
            .map(|least| least >= self.inner.config.max_conns_per_session)
            .unwrap_or(true)
    }

    /// One creation request: bounded attempts across the factories in
    /// round-robin order, each failure surfaced to the log.
    async fn create_session(&self) -> Result<Session, MuxError> {
        let mut last_err = MuxError::NoSession;
        for attempt in 1..=CREATE_RETRIES {
            let idx =
                self.inner.next_factory.fetch_add(1, Ordering::Relaxed) % self.inner.factories.len();
            let factory = &self.inner.factories[idx];
            match factory.create().await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    warn!(
                        "Session creation attempt {}/{} via {} failed: {}",
                        attempt,
                        CREATE_RETRIES,
                        factory.endpoint(),
                        e
                    );
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpDialer;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A connected client/server session pair over an in-memory link
    async fn session_pair() -> (Session, Session) {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let (cr, cw) = tokio::io::split(client_io);
        let (sr, sw) = tokio::io::split(server_io);
        let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::default());
        let client = Session::spawn(
            cr,
            cw,
            Arc::clone(&dialer),
            "test-peer".to_string(),
            SessionConfig::default(),
        );
        let server = Session::spawn(
            sr,
            sw,
            dialer,
            "test-client".to_string(),
            SessionConfig::default(),
        );
        (client, server)
    }

    struct MockFactory {
        created: AtomicUsize,
        // Server halves must outlive the test or the client sessions die
        servers: Mutex<Vec<Session>>,
    }

    impl MockFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                created: AtomicUsize::new(0),
                servers: Mutex::new(Vec::new()),
            })
        }

        fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }

        fn as_factories(self: &Arc<Self>) -> Vec<Arc<dyn SessionFactory>> {
            vec![Arc::clone(self) as Arc<dyn SessionFactory>]
        }
    }

    #[async_trait]
    impl SessionFactory for MockFactory {
        async fn create(&self) -> Result<Session, MuxError> {
            let (client, server) = session_pair().await;
            self.created.fetch_add(1, Ordering::SeqCst);
            self.servers.lock().unwrap().push(server);
            Ok(client)
        }

        fn endpoint(&self) -> &str {
            "mock"
        }
    }

    async fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if socket.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_empty_pool_creates_exactly_one_session() {
        let factory = MockFactory::new();
        let pool = SessionPool::new(factory.as_factories(), PoolConfig::default());

        let mut picks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            picks.push(tokio::spawn(async move { pool.get_or_create().await }));
        }
        let sessions: Vec<Session> = futures_join(picks).await;

        assert_eq!(factory.created(), 1);
        for session in &sessions[1..] {
            assert!(session.same_as(&sessions[0]));
        }
    }

    async fn futures_join(
        handles: Vec<tokio::task::JoinHandle<Result<Session, MuxError>>>,
    ) -> Vec<Session> {
        let mut out = Vec::new();
        for handle in handles {
            out.push(handle.await.unwrap().unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_least_loaded_selection() {
        let echo = spawn_echo().await;
        let factory = MockFactory::new();
        let pool = SessionPool::new(
            factory.as_factories(),
            PoolConfig {
                min_sessions: 1,
                max_conns_per_session: 100,
            },
        );

        let mut sessions = Vec::new();
        for _ in 0..3 {
            let session = factory.create().await.unwrap();
            pool.install(session.clone());
            sessions.push(session);
        }

        // Loads [3, 1, 4]
        let mut held = Vec::new();
        for (i, load) in [3usize, 1, 4].iter().enumerate() {
            for _ in 0..*load {
                held.push(sessions[i].dial(&echo.to_string()).await.unwrap());
            }
        }

        let picked = pool.get_or_create().await.unwrap();
        assert!(picked.same_as(&sessions[1]));
        assert_eq!(factory.created(), 3);
    }

    #[tokio::test]
    async fn test_saturation_triggers_single_background_growth() {
        let echo = spawn_echo().await;
        let factory = MockFactory::new();
        let pool = SessionPool::new(
            factory.as_factories(),
            PoolConfig {
                min_sessions: 1,
                max_conns_per_session: 1,
            },
        );

        let session = pool.get_or_create().await.unwrap();
        let _held = session.dial(&echo.to_string()).await.unwrap();
        assert_eq!(factory.created(), 1);

        // Every caller sees a saturated pool; background growth fires once,
        // not once per call
        for _ in 0..10 {
            pool.get_or_create().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(factory.created(), 2);
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_dead_session_is_replaced() {
        let factory = MockFactory::new();
        let pool = SessionPool::new(factory.as_factories(), PoolConfig::default());

        let session = pool.get_or_create().await.unwrap();
        assert_eq!(pool.len(), 1);

        session.close().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The dead session left the pool and a replacement was created
        assert_eq!(factory.created(), 2);
        assert_eq!(pool.len(), 1);
        assert!(!pool.get_or_create().await.unwrap().same_as(&session));
    }

    #[tokio::test]
    async fn test_game_over_session_is_not_replaced() {
        let factory = MockFactory::new();
        let pool = SessionPool::new(factory.as_factories(), PoolConfig::default());

        let session = pool.get_or_create().await.unwrap();
        session.shared.set_game_over();
        session.close().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Below minimum, but a game-over session must not be replaced
        assert_eq!(pool.len(), 0);
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let factory = MockFactory::new();
        let pool = SessionPool::new(factory.as_factories(), PoolConfig::default());

        let session = pool.get_or_create().await.unwrap();
        // Mark game-over so removal does not schedule replacements
        session.shared.set_game_over();
        pool.remove(&session);
        pool.remove(&session);
        assert_eq!(pool.len(), 0);
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn test_cut_all_closes_every_session() {
        let factory = MockFactory::new();
        let pool = SessionPool::new(
            factory.as_factories(),
            PoolConfig {
                min_sessions: 0,
                max_conns_per_session: 16,
            },
        );

        let a = pool.get_or_create().await.unwrap();
        let b = factory.create().await.unwrap();
        pool.install(b.clone());

        pool.cut_all().await;
        assert!(a.is_closed());
        assert!(b.is_closed());
    }
}
