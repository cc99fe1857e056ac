use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::buf::{Allocator, BufOptions, ByteBuf};
use crate::buf::default_allocator;
use crate::codec::Codec;
use crate::network::listener::dial;
use crate::network::BoxedStream;
use crate::{AppError, AppResult};

pub const DEFAULT_READ_BUF_SIZE: usize = 4 * 1024;
pub const DEFAULT_WRITE_BUF_SIZE: usize = 4 * 1024;

/// Lifecycle states of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Unconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> SessionState {
        match value {
            0 => SessionState::Unconnected,
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            _ => SessionState::Closed,
        }
    }
}

/// Observer notified of session lifecycle events.
pub trait SessionAware<C: Codec>: Send + Sync {
    /// Fired once when the session object is constructed. The impl may
    /// close the session here; construction then returns a Closed
    /// session.
    fn created(&self, _session: &Arc<Session<C>>) {}

    /// Fired once at the terminal close transition, after the connection
    /// and buffers are gone.
    fn closed(&self, _session: &Arc<Session<C>>) {}
}

/// Dial override, e.g. to wrap the stream with TLS.
pub type DialFn = Arc<dyn Fn(String) -> BoxFuture<'static, AppResult<BoxedStream>> + Send + Sync>;

/// Hook handed the outbound message right after encode, whether or not a
/// later flush succeeds.
pub type ReleaseFn<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Per-session configuration. The application clones this template for
/// every accepted connection; clones share the codec, allocator and
/// hooks.
pub struct SessionOptions<C: Codec> {
    pub codec: Arc<C>,
    pub read_buf_size: usize,
    pub write_buf_size: usize,
    pub allocator: Arc<dyn Allocator>,
    pub aware: Option<Arc<dyn SessionAware<C>>>,
    pub release_msg: Option<ReleaseFn<C::Out>>,
    pub dial: Option<DialFn>,
    pub disable_auto_reset_in_buffer: bool,
    pub disable_compact_after_grow: bool,
}

impl<C: Codec> SessionOptions<C> {
    pub fn new(codec: C) -> Self {
        SessionOptions {
            codec: Arc::new(codec),
            read_buf_size: DEFAULT_READ_BUF_SIZE,
            write_buf_size: DEFAULT_WRITE_BUF_SIZE,
            allocator: default_allocator(),
            aware: None,
            release_msg: None,
            dial: None,
            disable_auto_reset_in_buffer: false,
            disable_compact_after_grow: false,
        }
    }
}

impl<C: Codec> Clone for SessionOptions<C> {
    fn clone(&self) -> Self {
        SessionOptions {
            codec: self.codec.clone(),
            read_buf_size: self.read_buf_size,
            write_buf_size: self.write_buf_size,
            allocator: self.allocator.clone(),
            aware: self.aware.clone(),
            release_msg: self.release_msg.clone(),
            dial: self.dial.clone(),
            disable_auto_reset_in_buffer: self.disable_auto_reset_in_buffer,
            disable_compact_after_grow: self.disable_compact_after_grow,
        }
    }
}

/// Per-call read options.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadOptions {
    /// Deadline for each socket read; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

/// Per-call write options.
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    /// Drain the output buffer to the connection after encoding.
    pub flush: bool,
    pub timeout: Option<Duration>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            flush: true,
            timeout: None,
        }
    }
}

struct SessionReader {
    conn: Option<ReadHalf<BoxedStream>>,
    buf: Option<ByteBuf>,
}

struct SessionWriter {
    conn: Option<WriteHalf<BoxedStream>>,
    buf: Option<ByteBuf>,
}

/// Stateful, reference-counted wrapper over one stream connection.
///
/// The state machine is `Unconnected → Connecting → Connected → Closed`
/// with a `Connected → Unconnected` return path on [`disconnect`]; every
/// edge is driven by an atomic compare-and-swap, so concurrent callers
/// observing a mid-transition state get [`AppError::Busy`]. `Closed` is
/// terminal.
///
/// The refcount starts at 1. [`retain`] registers another holder and
/// [`close`] releases one; the connection is dismantled — in-flight I/O
/// cancelled, stream dropped, both buffers returned to the allocator,
/// `aware.closed` fired — only when the count reaches zero.
///
/// Input and output sides are independently locked, so one reader task
/// and one writer task can drive the session concurrently. Bytes reach
/// the socket in call order; decoded messages surface in byte order.
///
/// [`retain`]: Session::retain
/// [`close`]: Session::close
/// [`disconnect`]: Session::disconnect
pub struct Session<C: Codec> {
    id: u64,
    server_side: bool,
    state: AtomicU8,
    refs: AtomicI32,
    options: SessionOptions<C>,
    reader: Mutex<SessionReader>,
    writer: Mutex<SessionWriter>,
    remote_addr: RwLock<String>,
    cancel: RwLock<CancellationToken>,
}

impl<C: Codec + 'static> Session<C> {
    /// Creates an unconnected client session; [`connect`](Session::connect)
    /// establishes the stream.
    pub fn new(options: SessionOptions<C>) -> Arc<Self> {
        Self::build(0, None, String::new(), false, options)
    }

    /// Creates a session over an already-established stream — the
    /// server-side case. It starts Connected and cannot reconnect.
    pub fn with_stream(
        id: u64,
        stream: BoxedStream,
        remote_addr: String,
        options: SessionOptions<C>,
    ) -> Arc<Self> {
        Self::build(id, Some(stream), remote_addr, true, options)
    }

    fn build(
        id: u64,
        stream: Option<BoxedStream>,
        remote_addr: String,
        server_side: bool,
        options: SessionOptions<C>,
    ) -> Arc<Self> {
        let (state, reader, writer) = match stream {
            Some(stream) => {
                let (read_half, write_half) = tokio::io::split(stream);
                (
                    SessionState::Connected,
                    SessionReader {
                        conn: Some(read_half),
                        buf: Some(make_buf(&options, options.read_buf_size)),
                    },
                    SessionWriter {
                        conn: Some(write_half),
                        buf: Some(make_buf(&options, options.write_buf_size)),
                    },
                )
            }
            None => (
                SessionState::Unconnected,
                SessionReader {
                    conn: None,
                    buf: None,
                },
                SessionWriter {
                    conn: None,
                    buf: None,
                },
            ),
        };

        let session = Arc::new(Session {
            id,
            server_side,
            state: AtomicU8::new(state as u8),
            refs: AtomicI32::new(1),
            options,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            remote_addr: RwLock::new(remote_addr),
            cancel: RwLock::new(CancellationToken::new()),
        });
        if let Some(aware) = session.options.aware.clone() {
            aware.created(&session);
        }
        session
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Peer address, cached when the connection was established.
    pub fn remote_address(&self) -> String {
        self.remote_addr.read().clone()
    }

    /// Registers one more holder; every `retain` needs a matching
    /// [`close`](Session::close).
    pub fn retain(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Establishes the stream for a client session. Succeeds idempotently
    /// when already Connected; fails with [`AppError::SessionClosed`] on
    /// a terminal session and [`AppError::ConnectDisabled`] on a
    /// server-side one.
    pub async fn connect(&self, address: &str, timeout: Option<Duration>) -> AppResult<()> {
        if self.server_side {
            return Err(AppError::ConnectDisabled);
        }
        if let Err(observed) = self.cas(SessionState::Unconnected, SessionState::Connecting) {
            return match observed {
                SessionState::Connected => Ok(()),
                SessionState::Closed => Err(AppError::SessionClosed),
                _ => Err(AppError::Busy("connecting")),
            };
        }

        let dial_fut = match &self.options.dial {
            Some(dial_fn) => dial_fn(address.to_string()),
            None => {
                let address = address.to_string();
                Box::pin(async move { dial(&address).await })
            }
        };
        let dialed = match timeout {
            Some(deadline) => match time::timeout(deadline, dial_fut).await {
                Ok(result) => result,
                Err(elapsed) => Err(AppError::Timeout(elapsed)),
            },
            None => dial_fut.await,
        };

        match dialed {
            Ok(stream) => {
                let (read_half, write_half) = tokio::io::split(stream);
                {
                    let mut reader = self.reader.lock().await;
                    reader.conn = Some(read_half);
                    if reader.buf.is_none() {
                        reader.buf = Some(make_buf(&self.options, self.options.read_buf_size));
                    }
                }
                {
                    let mut writer = self.writer.lock().await;
                    writer.conn = Some(write_half);
                    if writer.buf.is_none() {
                        writer.buf = Some(make_buf(&self.options, self.options.write_buf_size));
                    }
                }
                *self.remote_addr.write() = address.to_string();
                *self.cancel.write() = CancellationToken::new();
                self.state
                    .store(SessionState::Connected as u8, Ordering::Release);
                Ok(())
            }
            Err(err) => {
                self.state
                    .store(SessionState::Unconnected as u8, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Reads the next decoded message, filling the input buffer from the
    /// connection as needed. A clean EOF surfaces
    /// [`AppError::ConnectionClosed`]; socket errors and timeouts clear
    /// the input buffer and leave the session Connected.
    pub async fn read(&self, options: ReadOptions) -> AppResult<C::In> {
        if !self.is_connected() {
            return Err(AppError::IllegalState(
                "read on a session that is not connected".into(),
            ));
        }
        let cancel = self.cancel_token();
        let mut reader = self.reader.lock().await;
        let SessionReader { conn, buf } = &mut *reader;
        let (conn, buf) = match (conn.as_mut(), buf.as_mut()) {
            (Some(conn), Some(buf)) => (conn, buf),
            _ => {
                return Err(AppError::IllegalState(
                    "read on a session that is not connected".into(),
                ))
            }
        };

        loop {
            if buf.readable() > 0 {
                if let Some(msg) = self.options.codec.decode(buf)? {
                    if buf.readable() == 0 && !self.options.disable_auto_reset_in_buffer {
                        buf.reset();
                    }
                    return Ok(msg);
                }
            }

            let filled = guarded(&cancel, options.timeout, buf.read_from(conn)).await;
            match filled {
                Ok(0) => {
                    buf.reset();
                    return Err(AppError::ConnectionClosed);
                }
                Ok(_) => {}
                Err(err) => {
                    buf.reset();
                    return Err(err);
                }
            }
        }
    }

    /// Encodes `msg` into the output buffer. The release hook receives
    /// the message as soon as encode returns; when `options.flush` is set
    /// and the buffer is non-empty, the buffer is drained to the
    /// connection.
    pub async fn write(&self, msg: C::Out, options: WriteOptions) -> AppResult<()> {
        if !self.is_connected() {
            return Err(AppError::IllegalState(
                "write on a session that is not connected".into(),
            ));
        }
        let cancel = self.cancel_token();
        let mut writer = self.writer.lock().await;

        let encoded = match writer.buf.as_mut() {
            Some(buf) => self.options.codec.encode(&msg, buf),
            None => Err(AppError::IllegalState(
                "write on a session that is not connected".into(),
            )),
        };
        match &self.options.release_msg {
            Some(release) => release(msg),
            None => drop(msg),
        }
        encoded?;

        if options.flush && writer.buf.as_ref().is_some_and(|buf| buf.readable() > 0) {
            flush_output(&mut writer, &cancel, options.timeout).await?;
        }
        Ok(())
    }

    /// Drains the output buffer to the connection. The buffer is reset
    /// afterwards whether the drain succeeded or not, so a partially
    /// written prefix is never re-sent.
    pub async fn flush(&self, timeout: Option<Duration>) -> AppResult<()> {
        if !self.is_connected() {
            return Err(AppError::IllegalState(
                "flush on a session that is not connected".into(),
            ));
        }
        let cancel = self.cancel_token();
        let mut writer = self.writer.lock().await;
        flush_output(&mut writer, &cancel, timeout).await
    }

    /// Closes the connection but keeps the session reusable: buffers are
    /// retained and a later [`connect`](Session::connect) re-establishes
    /// the stream. In-flight reads and writes fail promptly.
    pub async fn disconnect(&self) -> AppResult<()> {
        if let Err(observed) = self.cas(SessionState::Connected, SessionState::Unconnected) {
            return match observed {
                SessionState::Unconnected | SessionState::Closed => Ok(()),
                _ => Err(AppError::Busy("connecting")),
            };
        }

        self.cancel.read().cancel();
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;
        reader.conn = None;
        if let Some(mut conn) = writer.conn.take() {
            let _ = conn.shutdown().await;
        }
        Ok(())
    }

    /// Releases one reference. When the last reference goes, the session
    /// transitions to Closed: in-flight I/O is cancelled, the stream is
    /// dropped, both buffers are returned to the allocator exactly once
    /// and `aware.closed` fires exactly once. Closing an Unconnected or
    /// already Closed session is a no-op success.
    pub fn close(self: &Arc<Self>) -> AppResult<()> {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(previous >= 1, "session {} refcount underflow", self.id);
        if previous > 1 {
            return Ok(());
        }

        loop {
            match self.state() {
                SessionState::Closed => return Ok(()),
                SessionState::Connecting => {
                    // a concurrent connect owns the transition; hand the
                    // reference back so the caller can retry
                    self.refs.fetch_add(1, Ordering::AcqRel);
                    return Err(AppError::Busy("connecting"));
                }
                from @ (SessionState::Unconnected | SessionState::Connected) => {
                    if self.cas(from, SessionState::Closed).is_ok() {
                        break;
                    }
                }
            }
        }

        self.cancel.read().cancel();
        match (self.reader.try_lock(), self.writer.try_lock()) {
            (Ok(mut reader), Ok(mut writer)) => {
                release_resources(&mut reader, &mut writer);
                self.fire_closed();
            }
            (reader, writer) => {
                // a cancelled holder is still draining out of read/flush;
                // finish the teardown once the locks free up
                drop(reader);
                drop(writer);
                let session = self.clone();
                tokio::spawn(async move {
                    {
                        let mut reader = session.reader.lock().await;
                        let mut writer = session.writer.lock().await;
                        release_resources(&mut reader, &mut writer);
                    }
                    session.fire_closed();
                });
            }
        }
        Ok(())
    }

    /// Takes the split halves of the underlying stream for raw use, such
    /// as bidirectional copying. The session's own read/write primitives
    /// must not be used afterwards.
    pub async fn take_raw_stream(
        &self,
    ) -> AppResult<(ReadHalf<BoxedStream>, WriteHalf<BoxedStream>)> {
        if !self.is_connected() {
            return Err(AppError::IllegalState(
                "raw access on a session that is not connected".into(),
            ));
        }
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;
        match (reader.conn.take(), writer.conn.take()) {
            (Some(read_half), Some(write_half)) => Ok((read_half, write_half)),
            (read_half, write_half) => {
                reader.conn = read_half;
                writer.conn = write_half;
                Err(AppError::IllegalState("raw stream already taken".into()))
            }
        }
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.read().clone()
    }

    fn cas(&self, from: SessionState, to: SessionState) -> Result<(), SessionState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(SessionState::from_u8)
    }

    fn fire_closed(self: &Arc<Self>) {
        if let Some(aware) = self.options.aware.clone() {
            aware.closed(self);
        }
    }
}

fn make_buf<C: Codec>(options: &SessionOptions<C>, capacity: usize) -> ByteBuf {
    ByteBuf::with_options(
        capacity,
        BufOptions {
            allocator: options.allocator.clone(),
            compact_after_grow: !options.disable_compact_after_grow,
            ..BufOptions::default()
        },
    )
}

fn release_resources(reader: &mut SessionReader, writer: &mut SessionWriter) {
    // dropping both halves closes the stream
    reader.conn = None;
    writer.conn = None;
    if let Some(mut buf) = reader.buf.take() {
        buf.close();
    }
    if let Some(mut buf) = writer.buf.take() {
        buf.close();
    }
}

async fn flush_output(
    writer: &mut SessionWriter,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> AppResult<()> {
    let SessionWriter { conn, buf } = writer;
    let (conn, buf) = match (conn.as_mut(), buf.as_mut()) {
        (Some(conn), Some(buf)) => (conn, buf),
        _ => {
            return Err(AppError::IllegalState(
                "flush on a session that is not connected".into(),
            ))
        }
    };

    let drained = guarded(cancel, timeout, buf.write_to(conn)).await;
    buf.reset();
    drained.map(|_| ())
}

/// Runs one socket operation under the session's cancellation token and
/// an optional deadline.
async fn guarded<T>(
    cancel: &CancellationToken,
    timeout: Option<Duration>,
    fut: impl Future<Output = io::Result<T>>,
) -> AppResult<T> {
    let io_fut = async {
        match timeout {
            Some(deadline) => match time::timeout(deadline, fut).await {
                Ok(result) => result.map_err(AppError::Io),
                Err(elapsed) => Err(AppError::Timeout(elapsed)),
            },
            None => fut.await.map_err(AppError::Io),
        }
    };
    tokio::select! {
        result = io_fut => result,
        _ = cancel.cancelled() => Err(AppError::Io(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "session disconnected",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::codec::{LengthFieldCodec, StringCodec};

    type EchoCodec = LengthFieldCodec<StringCodec>;

    fn options() -> SessionOptions<EchoCodec> {
        SessionOptions::new(LengthFieldCodec::new(StringCodec))
    }

    fn duplex_session(
        options: SessionOptions<EchoCodec>,
    ) -> (tokio::io::DuplexStream, Arc<Session<EchoCodec>>) {
        let (remote, local) = tokio::io::duplex(1024);
        let session = Session::with_stream(1, Box::new(local), "duplex".to_string(), options);
        (remote, session)
    }

    struct CountingAllocator {
        allocs: AtomicUsize,
        frees: AtomicUsize,
    }

    impl Allocator for CountingAllocator {
        fn alloc(&self, size: usize) -> Vec<u8> {
            self.allocs.fetch_add(1, Ordering::SeqCst);
            vec![0; size]
        }

        fn free(&self, _buf: Vec<u8>) {
            self.frees.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingAware {
        created: AtomicUsize,
        closed: AtomicUsize,
    }

    impl SessionAware<EchoCodec> for CountingAware {
        fn created(&self, _session: &Arc<Session<EchoCodec>>) {
            self.created.fetch_add(1, Ordering::SeqCst);
        }

        fn closed(&self, _session: &Arc<Session<EchoCodec>>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_read_and_write_framed_messages() {
        let (mut remote, session) = duplex_session(options());

        remote.write_all(&[0, 0, 0, 5]).await.unwrap();
        remote.write_all(b"hello").await.unwrap();
        let msg = session.read(ReadOptions::default()).await.unwrap();
        assert_eq!("hello", msg);

        session
            .write("world".to_string(), WriteOptions::default())
            .await
            .unwrap();
        let mut frame = [0u8; 9];
        remote.read_exact(&mut frame).await.unwrap();
        assert_eq!([0, 0, 0, 5], frame[..4]);
        assert_eq!(b"world", &frame[4..]);
    }

    #[tokio::test]
    async fn test_read_across_partial_arrivals() {
        let (mut remote, session) = duplex_session(options());

        let reader = {
            let session = session.clone();
            tokio::spawn(async move { session.read(ReadOptions::default()).await })
        };
        remote.write_all(&[0, 0, 0, 5, b'h', b'e']).await.unwrap();
        time::sleep(Duration::from_millis(10)).await;
        remote.write_all(b"llo").await.unwrap();

        assert_eq!("hello", reader.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_read_eof_surfaces_connection_closed() {
        let (remote, session) = duplex_session(options());
        drop(remote);

        let err = session.read(ReadOptions::default()).await.unwrap_err();
        assert!(matches!(err, AppError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_read_timeout_keeps_session_connected() {
        let (mut remote, session) = duplex_session(options());

        let err = session
            .read(ReadOptions {
                timeout: Some(Duration::from_millis(20)),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Timeout(_)));
        assert!(session.is_connected());

        remote.write_all(&[0, 0, 0, 2, b'o', b'k']).await.unwrap();
        let msg = session
            .read(ReadOptions {
                timeout: Some(Duration::from_secs(1)),
            })
            .await
            .unwrap();
        assert_eq!("ok", msg);
    }

    #[tokio::test]
    async fn test_flush_timeout_on_blocked_peer() {
        let (_remote, local) = tokio::io::duplex(4);
        let session = Session::with_stream(1, Box::new(local), "duplex".to_string(), options());

        let err = session
            .write(
                "a message larger than the pipe".to_string(),
                WriteOptions {
                    flush: true,
                    timeout: Some(Duration::from_millis(20)),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Timeout(_)));
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_write_without_flush_buffers_output() {
        let (mut remote, session) = duplex_session(options());

        session
            .write(
                "ping".to_string(),
                WriteOptions {
                    flush: false,
                    timeout: None,
                },
            )
            .await
            .unwrap();
        session.flush(None).await.unwrap();

        let mut frame = [0u8; 8];
        remote.read_exact(&mut frame).await.unwrap();
        assert_eq!(b"ping", &frame[4..]);
    }

    #[tokio::test]
    async fn test_release_hook_runs_after_encode() {
        let released = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut opts = options();
        let sink = released.clone();
        opts.release_msg = Some(Arc::new(move |msg: String| {
            sink.lock().push(msg);
        }));
        let (_remote, session) = duplex_session(opts);

        session
            .write("freed".to_string(), WriteOptions::default())
            .await
            .unwrap();
        assert_eq!(vec!["freed".to_string()], *released.lock());
    }

    #[tokio::test]
    async fn test_read_and_write_when_not_connected() {
        let session = Session::new(options());
        assert!(matches!(
            session.read(ReadOptions::default()).await,
            Err(AppError::IllegalState(_))
        ));
        assert!(matches!(
            session.write("x".to_string(), WriteOptions::default()).await,
            Err(AppError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_disabled_on_server_session() {
        let (_remote, session) = duplex_session(options());
        assert!(matches!(
            session.connect("127.0.0.1:1", None).await,
            Err(AppError::ConnectDisabled)
        ));
    }

    #[tokio::test]
    async fn test_close_on_unconnected_session_is_ok() {
        let session = Session::new(options());
        session.close().unwrap();
        assert_eq!(SessionState::Closed, session.state());
    }

    #[tokio::test]
    async fn test_connect_on_closed_session_fails() {
        let session = Session::new(options());
        session.close().unwrap();
        assert!(matches!(
            session.connect("127.0.0.1:1", None).await,
            Err(AppError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_refcount_defers_teardown_to_last_holder() {
        let aware = Arc::new(CountingAware::default());
        let mut opts = options();
        opts.aware = Some(aware.clone());
        let (_remote, session) = duplex_session(opts);

        session.retain();
        session.close().unwrap();
        assert!(session.is_connected());
        assert_eq!(0, aware.closed.load(Ordering::SeqCst));

        session.close().unwrap();
        assert_eq!(SessionState::Closed, session.state());
        assert_eq!(1, aware.created.load(Ordering::SeqCst));
        assert_eq!(1, aware.closed.load(Ordering::SeqCst));

        // further closes on the terminal state stay no-ops
        session.retain();
        session.close().unwrap();
        assert_eq!(1, aware.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_close_releases_buffers_exactly_once() {
        let allocator = Arc::new(CountingAllocator {
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        });
        let mut opts = options();
        opts.allocator = allocator.clone();
        let (_remote, session) = duplex_session(opts);

        session.close().unwrap();
        assert_eq!(2, allocator.allocs.load(Ordering::SeqCst));
        assert_eq!(2, allocator.frees.load(Ordering::SeqCst));
    }

    struct CloseOnCreated;

    impl SessionAware<EchoCodec> for CloseOnCreated {
        fn created(&self, session: &Arc<Session<EchoCodec>>) {
            session.close().unwrap();
        }
    }

    #[tokio::test]
    async fn test_aware_created_may_close_the_session() {
        let mut opts = options();
        opts.aware = Some(Arc::new(CloseOnCreated));
        let (_remote, session) = duplex_session(opts);
        assert_eq!(SessionState::Closed, session.state());
    }

    #[tokio::test]
    async fn test_disconnect_interrupts_blocked_read() {
        let (_remote, session) = duplex_session(options());

        let reader = {
            let session = session.clone();
            tokio::spawn(async move { session.read(ReadOptions::default()).await })
        };
        time::sleep(Duration::from_millis(20)).await;

        session.disconnect().await.unwrap();
        assert_eq!(SessionState::Unconnected, session.state());

        let err = reader.await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::Io(_)));
    }

    #[tokio::test]
    async fn test_disconnect_then_reconnect_via_dial_override() {
        let (remote_a, local_a) = tokio::io::duplex(1024);
        let (mut remote_b, local_b) = tokio::io::duplex(1024);

        let streams = Arc::new(parking_lot::Mutex::new(vec![
            Box::new(local_b) as BoxedStream,
            Box::new(local_a) as BoxedStream,
        ]));
        let mut opts = options();
        let dial_streams = streams.clone();
        opts.dial = Some(Arc::new(move |_address: String| {
            let stream = dial_streams.lock().pop();
            Box::pin(async move {
                stream.ok_or_else(|| AppError::IllegalState("out of test streams".into()))
            })
        }));

        let session = Session::new(opts);
        session.connect("first", None).await.unwrap();
        assert!(session.is_connected());
        assert_eq!("first", session.remote_address());
        drop(remote_a);

        session.disconnect().await.unwrap();
        assert!(matches!(session.disconnect().await, Ok(())));

        session.connect("second", None).await.unwrap();
        session
            .write("again".to_string(), WriteOptions::default())
            .await
            .unwrap();
        let mut frame = [0u8; 9];
        remote_b.read_exact(&mut frame).await.unwrap();
        assert_eq!(b"again", &frame[4..]);
    }
}
