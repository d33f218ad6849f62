//! Component B: the connection pool.
//!
//! Grounded on two sources: the shape (`Pool` as a cheap `Clone`-able handle
//! around an `Arc`-held `SharedPool`, a scoped checkout guard, a reaper-free
//! but semaphore-governed acquisition path) comes from
//! `bb8::{Pool, SharedPool, PooledConnection}`; the checkout/release
//! algorithm itself (pid-stamped fork detection, request-affinity binding,
//! `forced` sockets that bypass the wait queue) is transcribed from
//! `pymongo.pool.Pool`.
//!
//! Tokio 0.2's `Semaphore` has no owned-permit API and no way to hand a
//! permit to a specific waiter out of FIFO order, so permit bookkeeping here
//! is a small hand-rolled semaphore (a counter plus a queue of oneshot
//! senders) in the same spirit as bb8's own waiter queue
//! (`PoolInternals::waiters`).

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::time::timeout as tokio_timeout;

use crate::caller::CallerId;
use crate::error::{Error, Result};
use crate::options::PoolOptions;
use crate::socket::{Address, Socket, Stream};

/// A caller's binding slot within a request. `Pending` means
/// [`Pool::start_request`] was called but no socket has been minted yet;
/// `Bound` holds the socket while it is idle-within-the-request (i.e. not
/// currently checked out by a [`PooledSocket`]).
enum CallerSlot {
    Pending,
    Bound(Socket),
}

struct PoolState {
    idle: VecDeque<Socket>,
    per_caller: HashMap<CallerId, CallerSlot>,
    generation: u64,
}

/// A minimal async semaphore: a counter guarded by a `std::sync::Mutex` plus
/// a FIFO of waiters. `release` hands the permit directly to the oldest live
/// waiter instead of incrementing the counter, so queued callers are served
/// in order the way bb8's `put_idle_conn` hands a connection straight to a
/// waiter when one is present.
struct Semaphore {
    max_waiters: Option<u32>,
    state: Mutex<SemaphoreState>,
}

struct SemaphoreState {
    available: u32,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl Semaphore {
    fn new(permits: u32, max_waiters: Option<u32>) -> Semaphore {
        Semaphore {
            max_waiters,
            state: Mutex::new(SemaphoreState {
                available: permits,
                waiters: VecDeque::new(),
            }),
        }
    }

    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.available > 0 {
            state.available -= 1;
            true
        } else {
            false
        }
    }

    /// Acquire a permit, waiting up to `timeout` (or indefinitely if `None`).
    /// Returns `false` on timeout or if the wait queue is already at
    /// capacity (`PoolOptions::max_waiters`).
    async fn acquire(&self, timeout: Option<Duration>) -> bool {
        let rx = {
            let mut state = self.state.lock().unwrap();
            if state.available > 0 {
                state.available -= 1;
                return true;
            }
            if let Some(max) = self.max_waiters {
                if state.waiters.len() as u32 >= max {
                    return false;
                }
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };
        match timeout {
            Some(d) => tokio_timeout(d, rx).await.map(|r| r.is_ok()).unwrap_or(false),
            None => rx.await.is_ok(),
        }
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return;
            }
            // Receiver already dropped (its wait timed out); try the next.
        }
        state.available += 1;
    }
}

/// The `Arc`-shared guts behind every [`Pool`] clone. Mirrors
/// `bb8::SharedPool`'s split between a cheap handle and its shared state.
pub(crate) struct PoolShared {
    address: Address,
    options: PoolOptions,
    state: Mutex<PoolState>,
    semaphore: Semaphore,
    pid: AtomicU32,
}

/// A cheaply `Clone`-able handle to a connection pool for one remote
/// endpoint, per §4.B.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolShared>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Pool({:p})", self.inner))
    }
}

/// Point-in-time pool occupancy, mirroring `bb8::State`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle_connections: usize,
    pub generation: u64,
}

impl Pool {
    pub fn new(address: Address, options: PoolOptions) -> Pool {
        let max_waiters = options.max_waiters();
        let max_pool_size = options.max_pool_size;
        let inner = Arc::new(PoolShared {
            address,
            options,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                per_caller: HashMap::new(),
                generation: 0,
            }),
            semaphore: Semaphore::new(max_pool_size, max_waiters),
            pid: AtomicU32::new(current_pid()),
        });
        Pool { inner }
    }

    pub(crate) fn from_shared(inner: Arc<PoolShared>) -> Pool {
        Pool { inner }
    }

    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().unwrap();
        PoolStats {
            idle_connections: state.idle.len(),
            generation: state.generation,
        }
    }

    /// Check out a socket, honoring request affinity if `caller` is bound to
    /// this pool (§4.B). Blocks up to `wait_queue_timeout` for a permit.
    pub async fn get_socket(&self, caller: Option<CallerId>) -> Result<PooledSocket> {
        self.get_socket_inner(caller, false).await
    }

    /// As [`Pool::get_socket`], but never waits for a permit: if the pool is
    /// already at `max_pool_size`, a socket is still produced and flagged
    /// `forced` so its eventual return does not release a permit it never
    /// held. Used by callers (topology monitoring, internal recursion) that
    /// must not be blocked behind application traffic.
    pub async fn get_socket_forced(&self, caller: Option<CallerId>) -> Result<PooledSocket> {
        self.get_socket_inner(caller, true).await
    }

    async fn get_socket_inner(&self, caller: Option<CallerId>, force: bool) -> Result<PooledSocket> {
        self.check_fork();
        let check_interval = self.inner.options.socket_check_interval;

        if let Some(cid) = caller {
            let bound = {
                let mut state = self.inner.state.lock().unwrap();
                match state.per_caller.get_mut(&cid) {
                    Some(slot @ CallerSlot::Bound(_)) => {
                        match std::mem::replace(slot, CallerSlot::Pending) {
                            CallerSlot::Bound(socket) => Some(socket),
                            CallerSlot::Pending => unreachable!(),
                        }
                    }
                    _ => None,
                }
            };
            if let Some(socket) = bound {
                let mut socket = self.revalidate(socket).await?;
                socket.last_checkout = tokio::time::Instant::now();
                return Ok(PooledSocket::new(self.clone(), caller, socket));
            }
        }

        let forced = if force {
            !self.inner.semaphore.try_acquire()
        } else {
            let timeout = self.inner.options.wait_queue_timeout;
            if !self.inner.semaphore.acquire(timeout).await {
                return Err(Error::WaitQueueTimeout {
                    max_pool_size: self.inner.options.max_pool_size,
                    wait_queue_timeout_ms: timeout.map(|d| d.as_millis() as u64),
                });
            }
            false
        };

        let idle = {
            let mut state = self.inner.state.lock().unwrap();
            state.idle.pop_front()
        };
        let reusable = idle.filter(|s| {
            !s.looks_dead(check_interval) && s.pool_generation == self.current_generation()
        });

        let mut socket = match reusable {
            Some(s) => s,
            None => match self.connect().await {
                Ok(s) => s,
                Err(e) => {
                    if !forced {
                        self.inner.semaphore.release();
                    }
                    return Err(e);
                }
            },
        };
        socket.forced = forced;
        socket.last_checkout = tokio::time::Instant::now();

        if let Some(cid) = caller {
            let mut state = self.inner.state.lock().unwrap();
            state.per_caller.insert(cid, CallerSlot::Pending);
        }

        Ok(PooledSocket::new(self.clone(), caller, socket))
    }

    /// Liveness-check a request-bound socket pulled out of the per-caller
    /// map, reconnecting in place if it looks dead or belongs to a stale
    /// generation. Does not touch the semaphore: the request's permit stays
    /// held for the life of the request, per pymongo's `_check`/`get_socket`.
    async fn revalidate(&self, socket: Socket) -> Result<Socket> {
        let check_interval = self.inner.options.socket_check_interval;
        if socket.looks_dead(check_interval) || socket.pool_generation != self.current_generation() {
            self.connect().await
        } else {
            Ok(socket)
        }
    }

    fn current_generation(&self) -> u64 {
        self.inner.state.lock().unwrap().generation
    }

    fn check_fork(&self) {
        if self.inner.pid.load(Ordering::SeqCst) != current_pid() {
            log::warn!("pid changed since pool for {} was created, resetting", self.inner.address);
            self.reset();
        }
    }

    /// Invalidate every idle socket and bump the generation counter, so
    /// sockets already checked out close themselves on return instead of
    /// being reused (§4.B: used on fork detection and on topology changes
    /// such as a stepped-down primary).
    pub fn reset(&self) {
        let mut state = self.inner.state.lock().unwrap();
        self.inner.pid.store(current_pid(), Ordering::SeqCst);
        state.generation += 1;
        let idle = std::mem::take(&mut state.idle);
        let generation = state.generation;
        drop(state);
        drop(idle);
        log::debug!("pool for {} reset, generation now {}", self.inner.address, generation);
    }

    /// Start a request: binds a fresh [`CallerId`] to this pool so that
    /// subsequent `get_socket(Some(id))` calls reuse the same underlying
    /// socket (read-your-writes affinity, §4.B). The returned guard's `Drop`
    /// ends the request and releases the bound socket.
    pub fn start_request(&self) -> RequestGuard<'_> {
        let caller = CallerId::fresh();
        let mut state = self.inner.state.lock().unwrap();
        state.per_caller.insert(caller, CallerSlot::Pending);
        drop(state);
        RequestGuard { pool: self, caller }
    }

    pub fn in_request(&self, caller: CallerId) -> bool {
        self.inner.state.lock().unwrap().per_caller.contains_key(&caller)
    }

    async fn connect(&self) -> Result<Socket> {
        let address = self.inner.address.clone();
        let connect_timeout = self.inner.options.connect_timeout;

        let stream = match &address {
            Address::Tcp(host, port) => {
                let tcp = tokio_timeout(connect_timeout, TcpStream::connect((host.as_str(), *port)))
                    .await
                    .map_err(|_| Error::Connection(format!("timed out connecting to {}", address)))?
                    .map_err(Error::from)?;
                tcp.set_nodelay(true).ok();
                if self.inner.options.socket_keepalive {
                    apply_keepalive(&tcp, SOCKET_KEEPALIVE_IDLE);
                }
                Stream::Tcp(tcp)
            }
            #[cfg(unix)]
            Address::Unix(path) => {
                let unix = tokio_timeout(connect_timeout, UnixStream::connect(path))
                    .await
                    .map_err(|_| Error::Connection(format!("timed out connecting to {}", address)))?
                    .map_err(Error::from)?;
                Stream::Unix(unix)
            }
            #[cfg(not(unix))]
            Address::Unix(_) => {
                return Err(Error::Configuration(
                    "Unix-domain sockets are not supported on this platform".to_string(),
                ));
            }
        };

        if self.inner.options.tls {
            if !cfg!(feature = "tls") {
                return Err(Error::Configuration(
                    "tls requested but the `tls` feature is not enabled".to_string(),
                ));
            }
            #[cfg(feature = "tls")]
            {
                // Wrapping `stream` requires a certificate store, which §1
                // keeps out of this crate's scope; without a caller-supplied
                // connector there is nothing safe to do but fail loudly
                // rather than connect in plaintext.
                return Err(Error::Configuration(
                    "tls is enabled but no TLS connector was supplied".to_string(),
                ));
            }
        }

        let generation = self.current_generation();
        Ok(Socket::new(
            stream,
            address,
            generation,
            Arc::downgrade(&self.inner),
            self.inner.options.socket_timeout,
        ))
    }
}

/// Idle time after which the OS starts probing a kept-alive TCP connection,
/// once `socketKeepAlive` is enabled. Not user-configurable, matching
/// `pymongo.pool`'s fixed `socket.SO_KEEPALIVE` enable-only behavior.
const SOCKET_KEEPALIVE_IDLE: Duration = Duration::from_secs(120);

/// Enable `SO_KEEPALIVE` on a connected `TcpStream`. Tokio 0.2's `TcpStream`
/// exposes no socket-option setter for this, so the underlying fd/handle is
/// borrowed into a `socket2::Socket` just long enough to set the option; the
/// borrowed `Socket` is forgotten afterward so it doesn't close the fd out
/// from under the `TcpStream` that still owns it.
#[cfg(unix)]
fn apply_keepalive(tcp: &TcpStream, keepalive: Duration) {
    use std::os::unix::io::{AsRawFd, FromRawFd};
    let sock = unsafe { socket2::Socket::from_raw_fd(tcp.as_raw_fd()) };
    let params = socket2::TcpKeepalive::new().with_time(keepalive);
    if let Err(e) = sock.set_tcp_keepalive(&params) {
        log::warn!("failed to set SO_KEEPALIVE: {}", e);
    }
    std::mem::forget(sock);
}

#[cfg(windows)]
fn apply_keepalive(tcp: &TcpStream, keepalive: Duration) {
    use std::os::windows::io::{AsRawSocket, FromRawSocket};
    let sock = unsafe { socket2::Socket::from_raw_socket(tcp.as_raw_socket()) };
    let params = socket2::TcpKeepalive::new().with_time(keepalive);
    if let Err(e) = sock.set_tcp_keepalive(&params) {
        log::warn!("failed to set SO_KEEPALIVE: {}", e);
    }
    std::mem::forget(sock);
}

fn current_pid() -> u32 {
    std::process::id()
}

/// Release path shared by [`PooledSocket::drop`] and [`RequestGuard::drop`].
/// Grounded on `pymongo.pool.Pool.maybe_return_socket`.
fn maybe_return(shared: &Arc<PoolShared>, caller: Option<CallerId>, mut socket: Socket) {
    if shared.pid.load(Ordering::SeqCst) != current_pid() {
        let forced = socket.forced;
        drop(socket);
        if !forced {
            shared.semaphore.release();
        }
        Pool::from_shared(shared.clone()).reset();
        return;
    }

    if let Some(cid) = caller {
        let mut state = shared.state.lock().unwrap();
        if state.per_caller.contains_key(&cid) {
            state.per_caller.insert(cid, CallerSlot::Bound(socket));
            return;
        }
    }

    let forced = socket.forced;
    if socket.is_closed() || socket.is_exhaust() {
        if !forced {
            shared.semaphore.release();
        }
        return;
    }

    let mut state = shared.state.lock().unwrap();
    let keep = socket.pool_generation == state.generation
        && state.idle.len() < shared.options.max_pool_size as usize;
    if keep {
        state.idle.push_back(socket);
    }
    drop(state);
    if !forced {
        shared.semaphore.release();
    }
}

/// A scoped checkout, grounded on bb8's `PooledConnection`. Unlike that
/// guard, `Drop` here never blocks: the whole release path
/// ([`maybe_return`]) is synchronous, since nothing on it performs I/O
/// (closing a socket is just dropping its stream). Holds a cloned [`Pool`]
/// handle (cheap: it's an `Arc`) rather than a borrow, so a checkout can
/// outlive the scope that requested it -- needed for exhaust-mode replies,
/// where the caller keeps reading further batches off the same socket.
#[derive(Debug)]
pub struct PooledSocket {
    pool: Pool,
    caller: Option<CallerId>,
    socket: Option<Socket>,
}

impl PooledSocket {
    fn new(pool: Pool, caller: Option<CallerId>, socket: Socket) -> PooledSocket {
        PooledSocket {
            pool,
            caller,
            socket: Some(socket),
        }
    }
}

impl std::ops::Deref for PooledSocket {
    type Target = Socket;
    fn deref(&self) -> &Socket {
        self.socket.as_ref().expect("socket taken before drop")
    }
}

impl std::ops::DerefMut for PooledSocket {
    fn deref_mut(&mut self) -> &mut Socket {
        self.socket.as_mut().expect("socket taken before drop")
    }
}

impl Drop for PooledSocket {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.take() {
            maybe_return(&self.pool.inner, self.caller, socket);
        }
    }
}

/// Returned by [`Pool::start_request`]. Dropping it ends the request,
/// releasing whatever socket is currently bound to it.
pub struct RequestGuard<'a> {
    pool: &'a Pool,
    caller: CallerId,
}

impl<'a> RequestGuard<'a> {
    pub fn caller_id(&self) -> CallerId {
        self.caller
    }
}

impl<'a> Drop for RequestGuard<'a> {
    fn drop(&mut self) {
        let slot = {
            let mut state = self.pool.inner.state.lock().unwrap();
            state.per_caller.remove(&self.caller)
        };
        if let Some(CallerSlot::Bound(socket)) = slot {
            maybe_return(&self.pool.inner, None, socket);
        }
    }
}
