use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::codec::Codec;
use crate::network::listener::{self, Listener};
use crate::network::session::{ReadOptions, Session, SessionAware, SessionOptions};
use crate::{AppError, AppResult};

pub const DEFAULT_SESSION_BUCKET_SIZE: u64 = 64;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Handler invoked for every decoded message. `sequence` starts at 1 and
/// increases by one per message within a session.
pub type MessageHandleFn<C> = Arc<
    dyn Fn(Arc<Session<C>>, <C as Codec>::In, u64) -> BoxFuture<'static, AppResult<()>>
        + Send
        + Sync,
>;

/// Replaces the default per-message loop for accepted sessions when set.
pub type SessionHandleFn<C> =
    Arc<dyn Fn(Arc<Session<C>>) -> BoxFuture<'static, AppResult<()>> + Send + Sync>;

/// Application-level configuration.
pub struct AppOptions<C: Codec> {
    /// Template cloned for every accepted session.
    pub session_opts: SessionOptions<C>,
    /// Number of registry shards; sessions land in shard `id % n`.
    pub session_bucket_size: u64,
    /// Lifecycle observer attached to accepted sessions when the
    /// template carries none.
    pub aware: Option<Arc<dyn SessionAware<C>>>,
    pub handle_session: Option<SessionHandleFn<C>>,
}

impl<C: Codec> AppOptions<C> {
    pub fn new(codec: C) -> Self {
        AppOptions {
            session_opts: SessionOptions::new(codec),
            session_bucket_size: DEFAULT_SESSION_BUCKET_SIZE,
            aware: None,
            handle_session: None,
        }
    }
}

type SessionShard<C> = RwLock<HashMap<u64, Arc<Session<C>>>>;

/// Listening server: owns the accept loops and a sharded registry of the
/// accepted sessions.
///
/// [`start`](Application::start) spawns one accept task per listener and
/// is idempotent; every accepted connection becomes a [`Session`] driven
/// by its own task, running either the default per-message loop or the
/// configured session hook. [`stop`](Application::stop) closes the
/// listeners, joins the accept tasks and disconnects every registered
/// session, leaving all shards empty.
pub struct Application<C: Codec> {
    listeners: Mutex<Vec<Box<dyn Listener>>>,
    addresses: Vec<String>,
    handle: MessageHandleFn<C>,
    options: AppOptions<C>,
    running: RwLock<bool>,
    next_id: AtomicU64,
    shards: Vec<SessionShard<C>>,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl<C: Codec + 'static> Application<C> {
    /// Binds one listener address and builds the application around it.
    pub async fn bind(
        address: &str,
        handle: MessageHandleFn<C>,
        options: AppOptions<C>,
    ) -> AppResult<Arc<Self>> {
        Self::bind_all(&[address], handle, options).await
    }

    /// Binds a set of listener addresses, possibly mixing TCP and Unix.
    pub async fn bind_all(
        addresses: &[&str],
        handle: MessageHandleFn<C>,
        options: AppOptions<C>,
    ) -> AppResult<Arc<Self>> {
        let mut listeners = Vec::with_capacity(addresses.len());
        for address in addresses {
            listeners.push(listener::bind(address).await?);
        }
        Ok(Self::with_listeners(listeners, handle, options))
    }

    /// Builds the application over already-bound listeners.
    pub fn with_listeners(
        listeners: Vec<Box<dyn Listener>>,
        handle: MessageHandleFn<C>,
        mut options: AppOptions<C>,
    ) -> Arc<Self> {
        if options.session_bucket_size == 0 {
            options.session_bucket_size = DEFAULT_SESSION_BUCKET_SIZE;
        }
        let addresses = listeners.iter().map(|l| l.local_addr()).collect();
        let shards = (0..options.session_bucket_size)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();

        Arc::new(Application {
            listeners: Mutex::new(listeners),
            addresses,
            handle,
            options,
            running: RwLock::new(false),
            next_id: AtomicU64::new(1),
            shards,
            accept_tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Addresses of the bound listeners, in construction order. Useful
    /// with `:0` binds.
    pub fn local_addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Spawns one accept task per listener. Idempotent.
    pub fn start(self: &Arc<Self>) -> AppResult<()> {
        let mut running = self.running.write();
        if *running {
            return Ok(());
        }
        *running = true;

        let listeners = std::mem::take(&mut *self.listeners.lock());
        let mut tasks = self.accept_tasks.lock();
        for listener in listeners {
            let app = self.clone();
            tasks.push(tokio::spawn(async move {
                app.accept_loop(listener).await;
            }));
        }
        debug!("application started");
        Ok(())
    }

    /// Stops accepting, joins the accept loops, then disconnects every
    /// registered session. Idempotent.
    pub async fn stop(&self) -> AppResult<()> {
        {
            let mut running = self.running.write();
            if !*running {
                return Ok(());
            }
            *running = false;
        }
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.accept_tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        debug!("application listeners closed");

        for shard in &self.shards {
            let sessions: Vec<_> = {
                let mut shard = shard.write();
                shard.drain().map(|(_, session)| session).collect()
            };
            for session in sessions {
                if let Err(err) = session.disconnect().await {
                    error!(
                        session_id = session.id(),
                        "session disconnect failed: {err}"
                    );
                }
            }
        }
        debug!("application stopped");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        *self.running.read()
    }

    /// Looks up a registered session.
    pub fn get_session(&self, id: u64) -> AppResult<Option<Arc<Session<C>>>> {
        if !self.is_started() {
            return Err(AppError::IllegalState("application is not started".into()));
        }
        Ok(self.shard(id).read().get(&id).cloned())
    }

    /// Number of registered sessions across all shards.
    pub fn session_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    async fn accept_loop(self: Arc<Self>, listener: Box<dyn Listener>) {
        debug!(address = %listener.local_addr(), "accept loop started");
        let shutdown = self.shutdown.clone();
        let mut backoff: Option<Duration> = None;

        loop {
            let accepted = tokio::select! {
                result = listener.accept() => result,
                _ = shutdown.cancelled() => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    backoff = None;
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let session = Session::with_stream(id, stream, peer, self.session_options());
                    if !self.add_session(&session) {
                        if let Err(err) = session.close() {
                            error!("close session failed: {err}");
                        }
                        break;
                    }
                    self.spawn_session(session);
                }
                Err(err) => {
                    if !self.is_started() {
                        break;
                    }
                    if is_transient_accept_error(&err) {
                        let delay = match backoff {
                            None => ACCEPT_BACKOFF_MIN,
                            Some(previous) => (previous * 2).min(ACCEPT_BACKOFF_MAX),
                        };
                        backoff = Some(delay);
                        debug!(?delay, "transient accept failure: {err}");
                        time::sleep(delay).await;
                        continue;
                    }
                    error!("accept failed, stopping listener: {err}");
                    break;
                }
            }
        }
        debug!(address = %listener.local_addr(), "accept loop stopped");
    }

    fn session_options(&self) -> SessionOptions<C> {
        let mut opts = self.options.session_opts.clone();
        if opts.aware.is_none() {
            opts.aware = self.options.aware.clone();
        }
        opts
    }

    fn spawn_session(self: &Arc<Self>, session: Arc<Session<C>>) {
        let app = self.clone();
        tokio::spawn(async move {
            let result = match app.options.handle_session.clone() {
                Some(handle) => handle(session.clone()).await,
                None => app.run_session(session.clone()).await,
            };
            if let Err(err) = result {
                error!(session_id = session.id(), "handle session failed: {err}");
            }
            if app.remove_session(&session) {
                if let Err(err) = session.close() {
                    error!(session_id = session.id(), "close session failed: {err}");
                }
            }
        });
    }

    /// Default per-session loop: read, dispatch, repeat until EOF or an
    /// error ends the session.
    async fn run_session(&self, session: Arc<Session<C>>) -> AppResult<()> {
        debug!(
            session_id = session.id(),
            addr = %session.remote_address(),
            "session connected"
        );
        let mut received = 0u64;
        loop {
            let msg = match session.read(ReadOptions::default()).await {
                Ok(msg) => msg,
                Err(AppError::ConnectionClosed) => return Ok(()),
                Err(err) => {
                    info!(session_id = session.id(), "session read failed: {err}");
                    return Err(err);
                }
            };
            received += 1;

            if let Err(err) = (self.handle)(session.clone(), msg, received).await {
                error!(
                    session_id = session.id(),
                    "session handler failed, closing: {err}"
                );
                return Err(err);
            }
        }
    }

    fn shard(&self, id: u64) -> &SessionShard<C> {
        &self.shards[(id % self.options.session_bucket_size) as usize]
    }

    fn add_session(&self, session: &Arc<Session<C>>) -> bool {
        let running = self.running.read();
        if !*running {
            return false;
        }
        self.shard(session.id())
            .write()
            .insert(session.id(), session.clone());
        true
    }

    fn remove_session(&self, session: &Arc<Session<C>>) -> bool {
        let running = self.running.read();
        if !*running {
            return false;
        }
        self.shard(session.id()).write().remove(&session.id());
        true
    }
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
