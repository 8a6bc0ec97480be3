//! The router connection state machine.
//!
//! One active session per identity. A generation counter guards every
//! background task: connect bumps it, disconnect bumps it again, and a
//! task whose generation no longer matches simply returns, so a stale
//! connect attempt or a racing timer can never resurrect a superseded
//! session. The write half sits behind an async mutex so frames are
//! never interleaved at the byte level.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{broadcast, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant as TokioInstant};
use tracing::{debug, info, trace, warn};

use crate::crypto::KeyPair;
use crate::error::{ConnectivityError, Error, Result};
use crate::identity::{derive_user_id, ChatId, UserId};
use crate::logging::{RedactedBytes, RedactedHex};
use crate::protocol::{data_id_for, decode_post, read_frame, write_frame, Command};
use crate::router::{ConnectionConfig, ConnectivityMonitor, RouterEvent};
use crate::storage::{Completion, ContactResolver, DuplicateFilter, PostStore, Spooler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Disconnected,
    Connecting,
    LoggedIn,
}

/// The write half of the active socket, tagged with the generation that
/// installed it so a superseded connect attempt can take back its own
/// writer without clobbering a newer session's.
struct SessionWriter {
    gen: u64,
    half: OwnedWriteHalf,
}

struct Shared {
    config: ConnectionConfig,
    identity: KeyPair,
    local_user_id: UserId,
    spool: Arc<Spooler>,
    dedup: Arc<DuplicateFilter>,
    store: Arc<dyn PostStore>,
    contacts: Arc<dyn ContactResolver>,
    monitor: ConnectivityMonitor,
    events: broadcast::Sender<RouterEvent>,
    writer: AsyncMutex<Option<SessionWriter>>,
    state: Mutex<SessionState>,
    generation: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pump: Notify,
    ack_notify: Notify,
    last_activity: Mutex<Instant>,
    reconnect_pending: AtomicBool,
}

/// Handle to the single router session of one identity.
pub struct RouterConnection {
    shared: Arc<Shared>,
}

impl RouterConnection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConnectionConfig,
        identity: KeyPair,
        spool: Arc<Spooler>,
        dedup: Arc<DuplicateFilter>,
        store: Arc<dyn PostStore>,
        contacts: Arc<dyn ContactResolver>,
        monitor: ConnectivityMonitor,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let local_user_id = derive_user_id(identity.public());
        Self {
            shared: Arc::new(Shared {
                config,
                identity,
                local_user_id,
                spool,
                dedup,
                store,
                contacts,
                monitor,
                events,
                writer: AsyncMutex::new(None),
                state: Mutex::new(SessionState::Disconnected),
                generation: AtomicU64::new(0),
                tasks: Mutex::new(Vec::new()),
                pump: Notify::new(),
                ack_notify: Notify::new(),
                last_activity: Mutex::new(Instant::now()),
                reconnect_pending: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.shared.events.subscribe()
    }

    pub fn local_user_id(&self) -> UserId {
        self.shared.local_user_id
    }

    pub fn is_logged_in(&self) -> bool {
        self.shared.is_logged_in()
    }

    /// Entries queued or awaiting confirmation.
    pub fn pending_sends(&self) -> usize {
        self.shared.spool.len()
    }

    /// Establish a session. No-op when already connected or when the
    /// network is known to be down.
    pub async fn connect(&self) -> Result<()> {
        connect_shared(self.shared.clone()).await
    }

    /// Tear the session down without scheduling a retry. Idempotent.
    pub async fn disconnect(&self) {
        let gen = self.shared.generation.load(Ordering::SeqCst);
        begin_disconnect(&self.shared, gen, false, "explicit disconnect").await;
    }

    /// Queue a post for at-least-once delivery. Returns the correlation
    /// id the eventual [`RouterEvent::DeliveryConfirmed`] will carry.
    /// The optional completion runs once, on acknowledgment.
    pub fn send_post(
        &self,
        chat_id: ChatId,
        post: Vec<u8>,
        completion: Option<Completion>,
    ) -> Result<[u8; 4]> {
        let payload = Command::SetNewpost { chat_id, post }.encode();
        let (data_id, _) = self.shared.spool.enqueue(payload, completion)?;
        self.shared.pump.notify_one();
        Ok(data_id)
    }

    /// Fire-and-forget send, skipping the spooler. No retry, no
    /// confirmation expected.
    pub async fn send_bypass(&self, payload: &[u8]) -> Result<()> {
        self.shared.write(payload, true).await
    }
}

impl Shared {
    fn is_logged_in(&self) -> bool {
        self.state
            .lock()
            .map(|s| *s == SessionState::LoggedIn)
            .unwrap_or(false)
    }

    fn set_state(&self, new: SessionState) {
        if let Ok(mut state) = self.state.lock() {
            *state = new;
        }
    }

    fn touch_activity(&self) {
        if let Ok(mut at) = self.last_activity.lock() {
            *at = Instant::now();
        }
    }

    fn idle_elapsed(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    async fn write(&self, payload: &[u8], bypass: bool) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::Connectivity(
            ConnectivityError::SendFailure("not connected".into()),
        ))?;
        write_frame(&mut writer.half, payload, bypass).await
    }

    /// Echo a received frame's correlation id through the bypass path.
    async fn confirm(&self, data_id: [u8; 4]) {
        let payload = Command::DataReceivedConfirmation { data_id }.encode();
        if let Err(e) = self.write(&payload, true).await {
            debug!(error = %e, "failed to send confirmation");
        }
    }

    fn handle_post(&self, chat_id: ChatId, post: Vec<u8>) {
        match self.dedup.check_and_insert(&post) {
            Ok(true) => {
                debug!(%chat_id, "dropping redelivered post");
                return;
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "duplicate filter unavailable"),
        }

        let received_at = chrono::Utc::now().timestamp_millis();
        let known = self.contacts.participants_for(&chat_id);
        match decode_post(&post, Some(chat_id), &known, &self.identity, received_at) {
            Ok(mut decoded) => {
                if let Some(contact) = &decoded.contact {
                    self.contacts.register_contact(&chat_id, contact);
                }
                // only verified posts reach the local log; the store's
                // timestamp is the authoritative reception time
                match self.store.append_post(&chat_id, &post) {
                    Ok(stored_at) => decoded.received_at = stored_at,
                    Err(e) => warn!(%chat_id, error = %e, "failed to persist post"),
                }
                let _ = self.events.send(RouterEvent::PostArrived {
                    chat_id,
                    post: decoded,
                });
            }
            Err(e) => {
                debug!(%chat_id, error = %e, post = %RedactedBytes(&post), "dropping undecodable post")
            }
        }
    }

    async fn dispatch(&self, cmd: Command) {
        match cmd {
            Command::Messages { chat_id, posts } => {
                for post in posts {
                    self.handle_post(chat_id, post);
                }
            }
            Command::SetNewpost { chat_id, post } => self.handle_post(chat_id, post),
            Command::Ping => trace!("ping from router"),
            Command::ConnectionEstablished { .. } => {
                debug!("unexpected login frame from router")
            }
            // acknowledgments are routed to the spooler by the read loop
            Command::DataReceivedConfirmation { .. } => {}
        }
    }
}

/// Tear down the session identified by `gen`. A later generation means
/// a newer session owns the connection and nothing happens, which is
/// what makes racing timer callbacks safe.
async fn begin_disconnect(shared: &Arc<Shared>, gen: u64, retry: bool, reason: &str) {
    if shared
        .generation
        .compare_exchange(gen, gen + 1, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }
    let was_connected = shared
        .state
        .lock()
        .map(|s| *s != SessionState::Disconnected)
        .unwrap_or(false);

    {
        let mut writer = shared.writer.lock().await;
        *writer = None;
    }
    shared.spool.return_in_flight();
    shared.set_state(SessionState::Disconnected);

    if was_connected {
        info!(reason, "router session ended");
        let _ = shared.events.send(RouterEvent::Disconnected {
            reason: reason.to_string(),
        });
    }
    if retry {
        schedule_reconnect(shared);
    }

    // abort last: the caller may be one of these tasks
    if let Ok(mut tasks) = shared.tasks.lock() {
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

fn schedule_reconnect(shared: &Arc<Shared>) {
    if shared.reconnect_pending.swap(true, Ordering::SeqCst) {
        return;
    }
    let shared = shared.clone();
    tokio::spawn(async move {
        loop {
            sleep(shared.config.reconnect_interval).await;
            if !shared.monitor.is_available() {
                continue;
            }
            shared.reconnect_pending.store(false, Ordering::SeqCst);
            if let Err(e) = connect_shared(shared.clone()).await {
                debug!(error = %e, "reconnect attempt failed");
            }
            return;
        }
    });
}

async fn connect_shared(shared: Arc<Shared>) -> Result<()> {
    if !shared.monitor.is_available() {
        debug!("network unavailable, not connecting");
        return Ok(());
    }
    {
        let mut state = shared
            .state
            .lock()
            .map_err(|_| Error::Storage("state lock poisoned".into()))?;
        match *state {
            SessionState::Disconnected => *state = SessionState::Connecting,
            _ => return Ok(()),
        }
    }
    let gen = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

    let stream = match dial(&shared).await {
        Ok(stream) => stream,
        Err(e) => {
            if shared.generation.load(Ordering::SeqCst) == gen {
                shared.set_state(SessionState::Disconnected);
                if let Error::Connectivity(err) = &e {
                    let _ = shared.events.send(RouterEvent::ConnectionError {
                        error: err.clone(),
                    });
                }
                schedule_reconnect(&shared);
            }
            return Err(e);
        }
    };

    // a newer connect or disconnect superseded this attempt mid-dial
    if shared.generation.load(Ordering::SeqCst) != gen {
        debug!("connect attempt superseded, discarding socket");
        return Ok(());
    }

    let (read_half, mut write_half) = stream.into_split();

    // logged in only once the login frame's write completes; written on
    // the raw half so a superseded attempt never touches the shared slot
    let login = Command::ConnectionEstablished {
        domain: shared.config.domain,
        user_id: shared.local_user_id,
    }
    .encode();
    if let Err(e) = write_frame(&mut write_half, &login, true).await {
        if shared.generation.load(Ordering::SeqCst) == gen {
            shared.set_state(SessionState::Disconnected);
            schedule_reconnect(&shared);
        }
        return Err(e);
    }

    {
        let mut writer = shared.writer.lock().await;
        *writer = Some(SessionWriter {
            gen,
            half: write_half,
        });
    }

    // commit point: the login-frame write and both awaits above are a
    // window in which a disconnect may have bumped the generation, so the
    // state transition is valid only while the generation still holds
    let committed = {
        let mut state = shared
            .state
            .lock()
            .map_err(|_| Error::Storage("state lock poisoned".into()))?;
        if shared.generation.load(Ordering::SeqCst) == gen {
            *state = SessionState::LoggedIn;
            true
        } else {
            false
        }
    };
    if !committed {
        debug!("connect attempt superseded, discarding socket");
        let mut writer = shared.writer.lock().await;
        if writer.as_ref().is_some_and(|w| w.gen == gen) {
            *writer = None;
        }
        return Ok(());
    }

    shared.touch_activity();
    let uid = shared.local_user_id.to_string();
    info!(user_id = %RedactedHex(&uid), "logged in to router");
    let _ = shared.events.send(RouterEvent::Connected);

    // re-checked under the task lock: a disconnect that raced past the
    // commit drains this vec after we release it, so tasks registered
    // here are either current or about to be aborted
    let registered = {
        let mut tasks = shared
            .tasks
            .lock()
            .map_err(|_| Error::Storage("task lock poisoned".into()))?;
        if shared.generation.load(Ordering::SeqCst) == gen {
            tasks.push(tokio::spawn(read_loop(shared.clone(), gen, read_half)));
            tasks.push(tokio::spawn(send_pump(shared.clone(), gen)));
            if let Some(interval) = shared.config.keep_alive_interval {
                tasks.push(tokio::spawn(keep_alive(shared.clone(), gen, interval)));
            }
            if let Some(idle) = shared.config.idle_timeout {
                tasks.push(tokio::spawn(idle_watcher(shared.clone(), gen, idle)));
            }
            true
        } else {
            false
        }
    };
    if !registered {
        let mut writer = shared.writer.lock().await;
        if writer.as_ref().is_some_and(|w| w.gen == gen) {
            *writer = None;
        }
        return Ok(());
    }
    shared.pump.notify_one();
    Ok(())
}

async fn dial(shared: &Shared) -> Result<TcpStream> {
    let addrs = lookup_host(&shared.config.router_addr)
        .await
        .map_err(|e| Error::Connectivity(ConnectivityError::DnsFailure(e.to_string())))?;

    for addr in addrs {
        match timeout(shared.config.connect_attempt_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => debug!(%addr, error = %e, "connect attempt failed"),
            Err(_) => debug!(%addr, "connect attempt timed out"),
        }
    }
    Err(Error::Connectivity(ConnectivityError::ConnectTimeout))
}

/// Read frames until the stream fails or the session is superseded.
async fn read_loop(shared: Arc<Shared>, gen: u64, mut reader: OwnedReadHalf) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => {
                if shared.generation.load(Ordering::SeqCst) == gen {
                    let _ = shared.events.send(RouterEvent::ConnectionError {
                        error: ConnectivityError::LostConnection(e.to_string()),
                    });
                    begin_disconnect(&shared, gen, true, "read failed").await;
                }
                return;
            }
        };

        if frame.is_keep_alive() {
            // probes never count as activity, or a chatty server would
            // make idle-disconnect unreachable
            trace!("keep-alive frame");
            continue;
        }
        shared.touch_activity();

        let data_id = data_id_for(&frame.payload);
        let cmd = match Command::parse(&frame.payload) {
            Ok(cmd) => cmd,
            Err(e) if e.should_silent_drop() => {
                debug!(error = %e, "dropping frame");
                if !frame.bypass {
                    shared.confirm(data_id).await;
                }
                continue;
            }
            Err(e) => {
                warn!(error = %e, "protocol violation");
                begin_disconnect(&shared, gen, true, "protocol violation").await;
                return;
            }
        };

        match cmd {
            Command::DataReceivedConfirmation { data_id } => {
                match shared.spool.acknowledge(&data_id) {
                    Ok(Some(_)) => {
                        let _ = shared
                            .events
                            .send(RouterEvent::DeliveryConfirmed { data_id });
                        shared.ack_notify.notify_one();
                        shared.pump.notify_one();
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "acknowledgment bookkeeping failed"),
                }
            }
            other => {
                // confirm before processing so slow decryption cannot
                // stall the sender's single-flight queue
                if !frame.bypass {
                    shared.confirm(data_id).await;
                }
                shared.dispatch(other).await;
            }
        }
    }
}

/// Single-flight send loop: one spooled frame in the air at a time,
/// the next released only by its acknowledgment.
async fn send_pump(shared: Arc<Shared>, gen: u64) {
    loop {
        if shared.generation.load(Ordering::SeqCst) != gen {
            return;
        }
        if !shared.is_logged_in() {
            shared.pump.notified().await;
            continue;
        }
        let Some(entry) = shared.spool.take_next() else {
            shared.pump.notified().await;
            continue;
        };

        debug!(seq = entry.seq, bytes = entry.frame.len(), "sending spooled frame");
        if let Err(e) = shared.write(&entry.frame, false).await {
            warn!(error = %e, "send failed, requeueing");
            shared.spool.return_in_flight();
            let _ = shared.events.send(RouterEvent::ConnectionError {
                error: ConnectivityError::SendFailure(e.to_string()),
            });
            begin_disconnect(&shared, gen, true, "send failure").await;
            return;
        }

        // the acknowledgment window scales with the outstanding bytes
        let window = Duration::from_millis(10_000 + entry.frame.len() as u64 / 10);
        let deadline = TokioInstant::now() + window;
        loop {
            tokio::select! {
                _ = shared.ack_notify.notified() => {
                    if !shared.spool.has_in_flight() {
                        break;
                    }
                }
                _ = sleep_until(deadline) => {
                    shared.spool.return_in_flight();
                    begin_disconnect(&shared, gen, true, "pending acknowledgment timed out")
                        .await;
                    return;
                }
            }
        }
    }
}

async fn keep_alive(shared: Arc<Shared>, gen: u64, interval: Duration) {
    let mut failures = 0u32;
    loop {
        sleep(interval).await;
        if shared.generation.load(Ordering::SeqCst) != gen {
            return;
        }
        match shared.write(&[], true).await {
            Ok(()) => failures = 0,
            Err(e) => {
                failures += 1;
                warn!(failures, error = %e, "keep-alive write failed");
                if failures >= 3 {
                    let _ = shared.events.send(RouterEvent::ConnectionError {
                        error: ConnectivityError::SendFailure(
                            "keep-alive failed three times".into(),
                        ),
                    });
                    begin_disconnect(&shared, gen, true, "keep-alive failures").await;
                    return;
                }
            }
        }
    }
}

async fn idle_watcher(shared: Arc<Shared>, gen: u64, idle: Duration) {
    loop {
        let elapsed = shared.idle_elapsed();
        if elapsed >= idle {
            begin_disconnect(&shared, gen, true, "idle timeout").await;
            return;
        }
        sleep(idle - elapsed).await;
        if shared.generation.load(Ordering::SeqCst) != gen {
            return;
        }
    }
}
