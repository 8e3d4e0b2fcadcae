//! `InferenceClient`: micro-batching client for the v1 inference protocol.
//!
//! Callers `submit` one sparse sample at a time and get a [`Ticket`] back.
//! Requests wait in a bounded queue until a flush drains up to
//! `max_batch_size` of them into one network call. Flushes run from a
//! periodic scheduler thread, and out of band whenever the queue reaches a
//! full batch. At most `max_concurrency` calls are ever in flight; a flush
//! that finds no free permit leaves the queue alone. A call that times out
//! fails its tickets at once but keeps its permit until the server answers
//! it or the connection drops.
//!
//! Threads: the scheduler (flush + timeout sweep), a writer that owns the
//! socket's write half, and a reader that routes replies by `call_id`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::codec::{
    decode_header, decode_message, decode_results, encode_batch_request, encode_message,
    DecodeError, Value,
};
use crate::frame::{read_frame, write_frame, FrameError};
use crate::protocol::{BatchRequest, EvaluationResult, MsgKind};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("health check failed: {0}")]
    Health(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("backpressure: {0}")]
    Backpressure(&'static str),
    #[error("client disconnected")]
    Disconnected,
    #[error("request timed out")]
    Timeout,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Coalesce queued requests into batched calls. When off, every call
    /// carries exactly one request.
    pub batching: bool,
    pub max_batch_size: usize,
    /// Period of the scheduler's flush attempts.
    pub flush_interval: Duration,
    /// Concurrency permits: maximum simultaneous in-flight calls.
    pub max_concurrency: usize,
    /// Requests older than this (queued or in flight) fail with `Timeout`.
    pub request_timeout: Duration,
    /// Bound on connect and on the construction-time health probe.
    pub connect_timeout: Duration,
    /// Bound on queued, not yet dispatched requests.
    pub max_queue: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            batching: true,
            max_batch_size: 32,
            flush_interval: Duration::from_micros(2500),
            max_concurrency: 2,
            request_timeout: Duration::from_millis(2000),
            connect_timeout: Duration::from_millis(1000),
            max_queue: 4096,
        }
    }
}

impl ClientOptions {
    fn batch_cap(&self) -> usize {
        if self.batching {
            self.max_batch_size.max(1)
        } else {
            1
        }
    }
}

/// Round-trip times of completed calls, bucketed by powers of two.
#[derive(Debug, Clone, Default)]
pub struct LatencySnapshot {
    pub count: u64,
    pub mean_us: f64,
    pub max_us: u64,
    /// Upper edge of the bucket holding the median call.
    pub p50_us: u64,
    pub p95_us: u64,
    /// `buckets[b]` counts calls whose round trip had `floor(log2(us)) == b`;
    /// sub-microsecond calls land in bucket 0.
    pub buckets: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct ClientStatsSnapshot {
    /// Calls currently in flight.
    pub inflight: usize,
    /// Requests waiting for a flush.
    pub queued: usize,
    pub submitted: u64,
    /// Network calls sent.
    pub calls: u64,
    /// Results delivered to tickets.
    pub results: u64,
    pub errors: u64,
    pub timeouts: u64,
    /// Highest number of simultaneous in-flight calls observed.
    pub max_inflight: usize,
    pub latency: LatencySnapshot,
}

type Reply = Result<EvaluationResult, ClientError>;

#[derive(Debug)]
struct Queued {
    ticket: u64,
    indices: Vec<i64>,
    tx: mpsc::Sender<Reply>,
    enqueued: Instant,
}

#[derive(Debug)]
struct PendingCall {
    start: Instant,
    txs: Vec<mpsc::Sender<Reply>>,
}

/// Handle to one submitted request.
pub struct Ticket {
    id: u64,
    rx: mpsc::Receiver<Reply>,
    shared: Weak<Shared>,
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket").field("id", &self.id).finish()
    }
}

impl Ticket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn recv(&self) -> Result<EvaluationResult, ClientError> {
        match self.rx.recv() {
            Ok(r) => r,
            Err(_) => Err(ClientError::Disconnected),
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<EvaluationResult, ClientError> {
        match self.rx.recv_timeout(timeout) {
            Ok(r) => r,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(ClientError::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ClientError::Disconnected),
        }
    }

    pub fn try_recv(&self) -> Result<Option<EvaluationResult>, ClientError> {
        match self.rx.try_recv() {
            Ok(r) => Ok(Some(r?)),
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => Err(ClientError::Disconnected),
        }
    }

    /// Give up on the result. A request still in the queue is withdrawn; one
    /// already sent completes normally and its result is dropped.
    pub fn cancel(self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.withdraw(self.id),
            None => false,
        }
    }
}

struct Shared {
    opts: ClientOptions,
    queue: Mutex<VecDeque<Queued>>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    /// Calls whose tickets already failed with `Timeout` but which the server
    /// has not answered yet. Each still holds its permit.
    expired: Mutex<HashSet<u64>>,
    inflight: AtomicUsize,
    next_call_id: AtomicU64,
    next_ticket: AtomicU64,
    /// Dropped (set to `None`) on shutdown, which ends the writer loop.
    outbound: Mutex<Option<mpsc::SyncSender<Vec<u8>>>>,
    shutdown: AtomicBool,
    stats: Mutex<Stats>,
    /// Coalesced "a call completed" signal. Bounded to 1 so bursts collapse
    /// into one wake-up.
    progress_tx: mpsc::SyncSender<()>,
}

pub struct InferenceClient {
    shared: Arc<Shared>,
    progress_rx: Mutex<mpsc::Receiver<()>>,
    stop_tx: Option<mpsc::SyncSender<()>>,
    stream: TcpStream,
    peer: String,
    scheduler_handle: Option<JoinHandle<()>>,
    reader_handle: Option<JoinHandle<()>>,
    writer_handle: Option<JoinHandle<()>>,
}

impl fmt::Debug for InferenceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceClient")
            .field("peer", &self.peer)
            .field("opts", &self.shared.opts)
            .finish()
    }
}

impl InferenceClient {
    /// Connect to `addr` ("host:port") and run the health probe.
    ///
    /// No background thread starts unless the probe succeeds.
    pub fn connect<A: ToSocketAddrs>(addr: A, opts: ClientOptions) -> Result<Self, ClientError> {
        if opts.max_concurrency == 0 || opts.max_batch_size == 0 || opts.max_queue == 0 {
            return Err(ClientError::Protocol(
                "max_concurrency, max_batch_size and max_queue must be positive".to_string(),
            ));
        }
        let mut stream = connect_timeout(addr, opts.connect_timeout)?;
        stream.set_nodelay(true).ok();
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());
        health_check(&mut stream, opts.connect_timeout)?;
        log::debug!("inference server {peer} passed health check");

        let (outbound_tx, outbound_rx) = mpsc::sync_channel::<Vec<u8>>(opts.max_concurrency);
        let (progress_tx, progress_rx) = mpsc::sync_channel::<()>(1);
        let (stop_tx, stop_rx) = mpsc::sync_channel::<()>(1);

        let shared = Arc::new(Shared {
            opts,
            queue: Mutex::new(VecDeque::new()),
            pending: Mutex::new(HashMap::new()),
            expired: Mutex::new(HashSet::new()),
            inflight: AtomicUsize::new(0),
            next_call_id: AtomicU64::new(1),
            next_ticket: AtomicU64::new(1),
            outbound: Mutex::new(Some(outbound_tx)),
            shutdown: AtomicBool::new(false),
            stats: Mutex::new(Stats::default()),
            progress_tx,
        });

        let reader_stream = stream.try_clone()?;
        let writer_stream = stream.try_clone()?;

        let shared_r = Arc::clone(&shared);
        let reader_handle = thread::Builder::new()
            .name("mz-infer-reader".to_string())
            .spawn(move || reader_loop(reader_stream, shared_r))?;
        let shared_w = Arc::clone(&shared);
        let writer_handle = thread::Builder::new()
            .name("mz-infer-writer".to_string())
            .spawn(move || writer_loop(writer_stream, outbound_rx, shared_w))?;
        let shared_s = Arc::clone(&shared);
        let scheduler_handle = thread::Builder::new()
            .name("mz-infer-flush".to_string())
            .spawn(move || scheduler_loop(stop_rx, shared_s))?;

        Ok(Self {
            shared,
            progress_rx: Mutex::new(progress_rx),
            stop_tx: Some(stop_tx),
            stream,
            peer,
            scheduler_handle: Some(scheduler_handle),
            reader_handle: Some(reader_handle),
            writer_handle: Some(writer_handle),
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.shared.opts
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue one sample for evaluation.
    ///
    /// Never blocks on the network. Fails with `Backpressure` when the queue
    /// is at `max_queue`.
    pub fn submit(&self, indices: Vec<i64>) -> Result<Ticket, ClientError> {
        let shared = &self.shared;
        if shared.shutdown.load(Ordering::Relaxed) {
            return Err(ClientError::Disconnected);
        }
        let id = shared.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel::<Reply>();
        let queued = {
            let mut q = lock(&shared.queue);
            if q.len() >= shared.opts.max_queue {
                drop(q);
                lock(&shared.stats).errors += 1;
                return Err(ClientError::Backpressure("request queue full"));
            }
            q.push_back(Queued {
                ticket: id,
                indices,
                tx,
                enqueued: Instant::now(),
            });
            q.len()
        };
        lock(&shared.stats).submitted += 1;

        if queued >= shared.opts.batch_cap() {
            shared.try_flush();
        }
        Ok(Ticket {
            id,
            rx,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Submit and block for the result.
    pub fn evaluate(&self, indices: Vec<i64>) -> Result<EvaluationResult, ClientError> {
        self.submit(indices)?.recv()
    }

    /// Attempt a flush now instead of waiting for the next tick.
    pub fn flush(&self) {
        self.shared.try_flush();
    }

    /// Wait until at least one call has completed (or failed), or `timeout`.
    pub fn wait_for_progress(&self, timeout: Duration) {
        let rx = lock(&self.progress_rx);
        let _ = rx.recv_timeout(timeout);
    }

    pub fn stats_snapshot(&self) -> ClientStatsSnapshot {
        let inflight = self.shared.inflight.load(Ordering::Relaxed);
        let queued = lock(&self.shared.queue).len();
        let s = lock(&self.shared.stats);
        ClientStatsSnapshot {
            inflight,
            queued,
            submitted: s.submitted,
            calls: s.calls,
            results: s.results,
            errors: s.errors,
            timeouts: s.timeouts,
            max_inflight: s.max_inflight,
            latency: s.latency.snapshot(),
        }
    }
}

impl Drop for InferenceClient {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.stop_tx.take();
        let _ = self.stream.shutdown(Shutdown::Both);
        lock(&self.shared.outbound).take();
        // Best-effort join; ignore panics.
        self.scheduler_handle.take().map(|h| h.join().ok());
        self.reader_handle.take().map(|h| h.join().ok());
        self.writer_handle.take().map(|h| h.join().ok());
        self.shared.fail_all(|| ClientError::Disconnected);
    }
}

impl Shared {
    /// Dispatch batches while a permit is free and the queue is non-empty.
    fn try_flush(&self) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            if lock(&self.queue).is_empty() {
                return;
            }
            if !self.try_acquire_permit() {
                return;
            }
            let batch: Vec<Queued> = {
                let mut q = lock(&self.queue);
                let n = q.len().min(self.opts.batch_cap());
                q.drain(..n).collect()
            };
            if batch.is_empty() {
                self.release_permit();
                return;
            }
            self.dispatch(batch);
        }
    }

    /// Send one call carrying `batch`. The caller holds a permit.
    fn dispatch(&self, batch: Vec<Queued>) {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let samples: Vec<&[i64]> = batch.iter().map(|q| q.indices.as_slice()).collect();
        let payload = encode_batch_request(call_id, &BatchRequest::from_samples(&samples));
        let size = batch.len();
        let txs: Vec<mpsc::Sender<Reply>> = batch.into_iter().map(|q| q.tx).collect();

        lock(&self.pending).insert(
            call_id,
            PendingCall {
                start: Instant::now(),
                txs,
            },
        );

        lock(&self.stats).calls += 1;
        let sent = match lock(&self.outbound).as_ref() {
            Some(tx) => match tx.try_send(payload) {
                Ok(()) => Ok(()),
                Err(mpsc::TrySendError::Full(_)) => {
                    Err(ClientError::Backpressure("outbound queue full"))
                }
                Err(mpsc::TrySendError::Disconnected(_)) => Err(ClientError::Disconnected),
            },
            None => Err(ClientError::Disconnected),
        };
        match sent {
            Ok(()) => {
                let mut s = lock(&self.stats);
                s.max_inflight = s.max_inflight.max(self.inflight.load(Ordering::Relaxed));
                log::trace!("call {call_id}: dispatched {size} request(s)");
            }
            Err(e) => {
                log::warn!("call {call_id}: dispatch failed: {e}");
                self.finish_call(call_id, Err(e), false);
            }
        }
    }

    /// Complete a call with per-request results, in submission order.
    fn complete_call(&self, call_id: u64, results: Result<Vec<EvaluationResult>, ClientError>) {
        self.finish_call(call_id, results, true);
    }

    fn finish_call(
        &self,
        call_id: u64,
        results: Result<Vec<EvaluationResult>, ClientError>,
        reflush: bool,
    ) {
        let Some(call) = lock(&self.pending).remove(&call_id) else {
            if lock(&self.expired).remove(&call_id) {
                // The server is done with it; only now is the permit free.
                log::debug!("late reply for timed-out call {call_id} dropped");
                self.release_permit();
                let _ = self.progress_tx.try_send(());
                if reflush
                    && (!self.opts.batching || lock(&self.queue).len() >= self.opts.batch_cap())
                {
                    self.try_flush();
                }
            } else {
                lock(&self.stats).errors += 1;
                log::debug!("dropping reply for unknown call {call_id}");
            }
            return;
        };
        let dt = call.start.elapsed();
        let outcome = match results {
            Ok(rs) if rs.len() == call.txs.len() => Ok(rs),
            Ok(rs) => Err(ClientError::Protocol(format!(
                "call {call_id}: {} results for {} requests",
                rs.len(),
                call.txs.len()
            ))),
            Err(e) => Err(e),
        };
        {
            let mut s = lock(&self.stats);
            s.latency.record(dt);
            match &outcome {
                Ok(rs) => s.results += rs.len() as u64,
                Err(_) => s.errors += 1,
            }
        }
        self.release_permit();
        match outcome {
            Ok(rs) => {
                for (tx, r) in call.txs.into_iter().zip(rs) {
                    let _ = tx.send(Ok(r));
                }
            }
            Err(e) => {
                log::warn!("call {call_id} failed: {e}");
                for tx in call.txs {
                    let _ = tx.send(Err(e.duplicate()));
                }
            }
        }
        let _ = self.progress_tx.try_send(());

        // A freed permit may unblock a full batch that is already waiting.
        if reflush && (!self.opts.batching || lock(&self.queue).len() >= self.opts.batch_cap()) {
            self.try_flush();
        }
    }

    /// Fail queued and in-flight calls older than the request timeout.
    fn expire_timeouts(&self) {
        let timeout = self.opts.request_timeout;
        let expired_calls: Vec<(u64, PendingCall)> = {
            let mut p = lock(&self.pending);
            let ids: Vec<u64> = p
                .iter()
                .filter(|(_, c)| c.start.elapsed() >= timeout)
                .map(|(&id, _)| id)
                .collect();
            ids.into_iter()
                .filter_map(|id| p.remove(&id).map(|c| (id, c)))
                .collect()
        };
        let expired_queued: Vec<Queued> = {
            let mut q = lock(&self.queue);
            let (old, fresh): (VecDeque<Queued>, VecDeque<Queued>) =
                q.drain(..).partition(|e| e.enqueued.elapsed() >= timeout);
            *q = fresh;
            old.into_iter().collect()
        };
        if expired_calls.is_empty() && expired_queued.is_empty() {
            return;
        }
        {
            let mut s = lock(&self.stats);
            s.timeouts += (expired_calls.len() + expired_queued.len()) as u64;
            s.errors += (expired_calls.len() + expired_queued.len()) as u64;
        }
        lock(&self.expired).extend(expired_calls.iter().map(|(id, _)| *id));
        for (call_id, call) in expired_calls {
            log::warn!("call {call_id} timed out after {timeout:?}");
            for tx in call.txs {
                let _ = tx.send(Err(ClientError::Timeout));
            }
        }
        for e in expired_queued {
            let _ = e.tx.send(Err(ClientError::Timeout));
        }
        let _ = self.progress_tx.try_send(());
    }

    /// Remove a still-queued request. Returns whether it was found.
    fn withdraw(&self, ticket: u64) -> bool {
        let mut q = lock(&self.queue);
        match q.iter().position(|e| e.ticket == ticket) {
            Some(i) => {
                q.remove(i);
                true
            }
            None => false,
        }
    }

    /// Fail everything queued or in flight. Used on disconnect.
    fn fail_all<F: Fn() -> ClientError>(&self, mk_err: F) {
        let calls: Vec<PendingCall> = lock(&self.pending).drain().map(|(_, c)| c).collect();
        let queued: Vec<Queued> = lock(&self.queue).drain(..).collect();
        let expired = lock(&self.expired).drain().count();
        if !calls.is_empty() || expired > 0 {
            let n = calls.len() + expired;
            let mut cur = self.inflight.load(Ordering::Relaxed);
            loop {
                let next = cur.saturating_sub(n);
                match self.inflight.compare_exchange_weak(
                    cur,
                    next,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(v) => cur = v,
                }
            }
        }
        if !calls.is_empty() || !queued.is_empty() {
            lock(&self.stats).errors += (calls.len() + queued.len()) as u64;
        }
        for c in calls {
            for tx in c.txs {
                let _ = tx.send(Err(mk_err()));
            }
        }
        for q in queued {
            let _ = q.tx.send(Err(mk_err()));
        }
        let _ = self.progress_tx.try_send(());
    }

    fn try_acquire_permit(&self) -> bool {
        let cap = self.opts.max_concurrency;
        let mut cur = self.inflight.load(Ordering::Relaxed);
        loop {
            if cur >= cap {
                return false;
            }
            match self.inflight.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(next) => cur = next,
            }
        }
    }

    fn release_permit(&self) {
        let _ = self
            .inflight
            .fetch_update(Ordering::SeqCst, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

impl ClientError {
    /// Copy of this error for fanning one failure out to several tickets.
    fn duplicate(&self) -> ClientError {
        match self {
            ClientError::Io(e) => ClientError::Io(io::Error::new(e.kind(), e.to_string())),
            ClientError::Frame(e) => ClientError::Protocol(e.to_string()),
            ClientError::Decode(e) => ClientError::Protocol(e.to_string()),
            ClientError::Health(m) => ClientError::Health(m.clone()),
            ClientError::Server(m) => ClientError::Server(m.clone()),
            ClientError::Protocol(m) => ClientError::Protocol(m.clone()),
            ClientError::Backpressure(m) => ClientError::Backpressure(m),
            ClientError::Disconnected => ClientError::Disconnected,
            ClientError::Timeout => ClientError::Timeout,
        }
    }
}

fn scheduler_loop(stop_rx: mpsc::Receiver<()>, shared: Arc<Shared>) {
    let interval = shared.opts.flush_interval.max(Duration::from_micros(100));
    loop {
        match stop_rx.recv_timeout(interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            _ => break,
        }
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }
        shared.expire_timeouts();
        shared.try_flush();
    }
}

fn reader_loop(mut stream: TcpStream, shared: Arc<Shared>) {
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }
        let payload = match read_frame(&mut stream) {
            Ok(p) => p,
            Err(e) => {
                if !shared.shutdown.load(Ordering::Relaxed) {
                    log::warn!("inference connection lost: {e}");
                }
                let _ = stream.shutdown(Shutdown::Both);
                shared.fail_all(|| ClientError::Disconnected);
                break;
            }
        };
        let msg = match decode_message(&payload) {
            Ok(m) => m,
            Err(e) => {
                // A broken body can still be attributed to its call.
                match decode_header(&payload) {
                    Ok((_, call_id)) => {
                        shared.complete_call(call_id, Err(ClientError::Decode(e)));
                        continue;
                    }
                    Err(_) => {
                        log::warn!("undecodable reply from inference server: {e}");
                        let _ = stream.shutdown(Shutdown::Both);
                        shared.fail_all(|| ClientError::Disconnected);
                        break;
                    }
                }
            }
        };
        match (msg.kind, msg.body) {
            (MsgKind::Result, Some(body)) => {
                let results = decode_results(&body).map_err(ClientError::from);
                shared.complete_call(msg.call_id, results);
            }
            (MsgKind::Error, body) => {
                let text = match body {
                    Some(Value::Str(s)) => s,
                    _ => "unspecified server error".to_string(),
                };
                shared.complete_call(msg.call_id, Err(ClientError::Server(text)));
            }
            (kind, _) => {
                shared.complete_call(
                    msg.call_id,
                    Err(ClientError::Protocol(format!("unexpected reply kind {kind:?}"))),
                );
            }
        }
    }
}

fn writer_loop(mut stream: TcpStream, outbound_rx: mpsc::Receiver<Vec<u8>>, shared: Arc<Shared>) {
    while let Ok(payload) = outbound_rx.recv() {
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }
        if let Err(e) = write_frame(&mut stream, &payload) {
            log::warn!("inference write failed: {e}");
            let _ = stream.shutdown(Shutdown::Both);
            shared.fail_all(|| ClientError::Disconnected);
            break;
        }
    }
}

/// Synchronous `Health` → `HealthOk` exchange on a fresh connection.
fn health_check(stream: &mut TcpStream, timeout: Duration) -> Result<(), ClientError> {
    let timeout = timeout.max(Duration::from_millis(1));
    stream.set_read_timeout(Some(timeout))?;
    let probe = encode_message(MsgKind::Health, 0, None);
    write_frame(stream, &probe)
        .map_err(|e| ClientError::Health(format!("probe not sent: {e}")))?;
    let reply = read_frame(stream)
        .map_err(|e| ClientError::Health(format!("no reply: {e}")))?;
    let msg = decode_message(&reply).map_err(|e| ClientError::Health(format!("bad reply: {e}")))?;
    if msg.kind != MsgKind::HealthOk {
        return Err(ClientError::Health(format!(
            "expected HealthOk, got {:?}",
            msg.kind
        )));
    }
    stream.set_read_timeout(None)?;
    Ok(())
}

fn connect_timeout<A: ToSocketAddrs>(addr: A, timeout: Duration) -> Result<TcpStream, ClientError> {
    let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
    let mut last_err = None;
    for a in addrs {
        match TcpStream::connect_timeout(&a, timeout.max(Duration::from_millis(1))) {
            Ok(s) => return Ok(s),
            Err(e) => last_err = Some(e),
        }
    }
    Err(ClientError::Io(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
    })))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Default)]
struct Stats {
    submitted: u64,
    calls: u64,
    results: u64,
    errors: u64,
    timeouts: u64,
    max_inflight: usize,
    latency: Latency,
}

const LATENCY_BUCKETS: usize = 32;

#[derive(Debug, Default)]
struct Latency {
    buckets: [u64; LATENCY_BUCKETS],
    total_us: u64,
    max_us: u64,
}

impl Latency {
    fn record(&mut self, dt: Duration) {
        let us = u64::try_from(dt.as_micros()).unwrap_or(u64::MAX);
        let b = (u64::BITS - us.leading_zeros()).saturating_sub(1) as usize;
        self.buckets[b.min(LATENCY_BUCKETS - 1)] += 1;
        self.total_us = self.total_us.saturating_add(us);
        self.max_us = self.max_us.max(us);
    }

    fn count(&self) -> u64 {
        self.buckets.iter().sum()
    }

    /// Upper edge of the first bucket at which the cumulative count reaches `q`.
    fn quantile_us(&self, q: f64) -> u64 {
        let count = self.count();
        if count == 0 {
            return 0;
        }
        let rank = ((count as f64) * q).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (b, &n) in self.buckets.iter().enumerate() {
            seen += n;
            if seen >= rank {
                return 1u64.checked_shl(b as u32 + 1).unwrap_or(u64::MAX);
            }
        }
        self.max_us
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count();
        LatencySnapshot {
            count,
            mean_us: if count == 0 {
                0.0
            } else {
                self.total_us as f64 / count as f64
            },
            max_us: self.max_us,
            p50_us: self.quantile_us(0.50),
            p95_us: self.quantile_us(0.95),
            buckets: self.buckets.to_vec(),
        }
    }
}
