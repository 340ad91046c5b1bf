//! Posting engine: connection pool, work queue and retry policy
//!
//! The engine owns every connection and hands queued commands to whichever
//! connection next becomes idle. One mutex guards the ready list, the busy
//! set and the command queue together: with separate locks a producer can
//! observe "no idle connection" while a finishing connection observes "no
//! queued work", both park in opposite lists and the batch stalls forever.
//! The mutex is never held across an await; connections run as tasks on the
//! engine's own runtime and report completions back through handlers that
//! take the lock themselves.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::error::PostError;
use crate::nntp::connection::{ConnectError, NntpConnection, PostOutcome, StatOutcome};
use crate::post::{Article, SegmentKey, NONCE_LENGTH};

type ConnId = usize;

/// Produces the random run nonces embedded in message-ids.
pub type NonceGenerator = Box<dyn Fn() -> String + Send + Sync>;

type PostEvent = Box<dyn Fn(&Article) + Send + Sync>;
type StatEvent = Box<dyn Fn(&str, StatOutcome) + Send + Sync>;

/// 16 lowercase alphanumerics, freshly seeded per process.
pub fn generate_nonce() -> String {
    use rand::Rng;
    const CHOICES: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..NONCE_LENGTH)
        .map(|_| CHOICES[rng.gen_range(0..CHOICES.len())] as char)
        .collect()
}

/// Tuning knobs fixed for the lifetime of one engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Worker threads running connection I/O. One is usually plenty.
    pub io_threads: usize,
    /// Bound on the pending-command queue; 0 means unbounded.
    pub max_queue_size: usize,
    /// Rejections tolerated per segment before the batch aborts.
    pub max_retries: u32,
    /// Deadline applied to every socket read and write.
    pub op_timeout: Duration,
    /// Domain of minted message-ids.
    pub msgid_domain: String,
    /// Where articles that exhaust their retries are dumped.
    pub dump_dir: PathBuf,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            io_threads: 1,
            max_queue_size: 0,
            max_retries: 3,
            op_timeout: Duration::from_secs(5),
            msgid_domain: "ul-nzb".to_string(),
            dump_dir: PathBuf::from("."),
        }
    }
}

/// A deferred command bound to whichever connection next becomes idle.
enum QueuedCommand {
    Post(Arc<Article>),
    Stat(String),
}

/// What the engine sends down a connection's channel.
enum ConnCommand {
    Post(Arc<Article>),
    Stat(String),
    Quit,
}

/// What a connection task should do after a completion handler ran.
enum Directive {
    Continue,
    Reconnect,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AbortCause {
    RetryLimit,
    PoolEmpty,
}

struct Callbacks {
    post_finished: PostEvent,
    post_failed: PostEvent,
    stat_finished: StatEvent,
}

struct ConnHandle {
    commands: mpsc::UnboundedSender<ConnCommand>,
}

#[derive(Default)]
struct State {
    connections: HashMap<ConnId, ConnHandle>,
    ready: VecDeque<ConnId>,
    busy: HashSet<ConnId>,
    queue: VecDeque<QueuedCommand>,
    retries: HashMap<SegmentKey, u32>,
    reminted: HashMap<SegmentKey, String>,
    next_id: ConnId,
    /// Connection tasks that have not yet fully terminated.
    live: usize,
    /// Keep-alive: cleared by `stop()` or an abort.
    running: bool,
    aborted: Option<AbortCause>,
}

struct Inner {
    options: EngineOptions,
    callbacks: Callbacks,
    nonce: NonceGenerator,
    state: Mutex<State>,
    /// Signals producers blocked on the queue bound.
    space: Condvar,
    /// Signals `join()` once every connection has terminated.
    drained: Condvar,
}

/// Builds a [`PostingEngine`]; all callbacks are fixed before the engine
/// starts, so they are read without locking afterwards.
pub struct PostingEngineBuilder {
    options: EngineOptions,
    callbacks: Callbacks,
    nonce: NonceGenerator,
}

impl PostingEngineBuilder {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            options,
            callbacks: Callbacks {
                post_finished: Box::new(|_| {}),
                post_failed: Box::new(|_| {}),
                stat_finished: Box::new(|_, _| {}),
            },
            nonce: Box::new(generate_nonce),
        }
    }

    /// Invoked once per successfully posted article.
    pub fn post_finished(mut self, f: impl Fn(&Article) + Send + Sync + 'static) -> Self {
        self.callbacks.post_finished = Box::new(f);
        self
    }

    /// Invoked once per server-rejected article, before the retry runs.
    pub fn post_failed(mut self, f: impl Fn(&Article) + Send + Sync + 'static) -> Self {
        self.callbacks.post_failed = Box::new(f);
        self
    }

    /// Invoked once per completed STAT probe.
    pub fn stat_finished(mut self, f: impl Fn(&str, StatOutcome) + Send + Sync + 'static) -> Self {
        self.callbacks.stat_finished = Box::new(f);
        self
    }

    /// Replace the nonce source used when re-minting message-ids.
    pub fn nonce_generator(mut self, f: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.nonce = Box::new(f);
        self
    }

    pub fn build(self) -> PostingEngine {
        PostingEngine {
            inner: Arc::new(Inner {
                options: self.options,
                callbacks: self.callbacks,
                nonce: self.nonce,
                state: Mutex::new(State::default()),
                space: Condvar::new(),
                drained: Condvar::new(),
            }),
            runtime: None,
        }
    }
}

/// The connection pool plus queue orchestrator driving all posting.
pub struct PostingEngine {
    inner: Arc<Inner>,
    runtime: Option<tokio::runtime::Runtime>,
}

impl PostingEngine {
    pub fn builder(options: EngineOptions) -> PostingEngineBuilder {
        PostingEngineBuilder::new(options)
    }

    /// Spin up the I/O worker threads. Must precede `add_connections`.
    pub fn start(&mut self) -> std::io::Result<()> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.inner.options.io_threads.max(1))
            .enable_io()
            .enable_time()
            .thread_name("ul-nzb-io")
            .build()?;
        self.runtime = Some(runtime);
        self.inner.state.lock().unwrap().running = true;
        Ok(())
    }

    /// Open `count` connections to `server`; each authenticates in the
    /// background and joins the ready list on success.
    pub fn add_connections(&self, server: ServerConfig, count: usize) -> Result<(), PostError> {
        let runtime = self.runtime.as_ref().ok_or(PostError::NotStarted)?;
        let server = Arc::new(server);

        let mut state = self.inner.state.lock().unwrap();
        for _ in 0..count {
            let id = state.next_id;
            state.next_id += 1;

            let (tx, rx) = mpsc::unbounded_channel();
            state.connections.insert(id, ConnHandle { commands: tx });
            state.busy.insert(id);
            state.live += 1;

            runtime.spawn(connection_task(
                id,
                Arc::clone(&server),
                Arc::clone(&self.inner),
                rx,
            ));
        }
        Ok(())
    }

    /// Hand an article to the next idle connection, or queue it. With a
    /// bounded queue this blocks the caller until space frees up, unless
    /// `bypass_wait` is set (retries must never deadlock against their own
    /// queue).
    pub fn enqueue_post(&self, article: Arc<Article>, bypass_wait: bool) -> Result<(), PostError> {
        self.inner
            .enqueue(QueuedCommand::Post(article), bypass_wait)
    }

    /// Probe for an article by message-id (angle brackets included).
    pub fn enqueue_stat(&self, message_id: String) -> Result<(), PostError> {
        self.inner.enqueue(QueuedCommand::Stat(message_id), false)
    }

    /// Release the keep-alive: once in-flight commands drain and the queue
    /// empties, every idle connection disconnects gracefully.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.running = false;
        if state.queue.is_empty() {
            self.inner.quit_idle_connections(&mut state);
        }
        if state.live == 0 {
            self.inner.drained.notify_all();
        }
    }

    /// Block until every connection has terminated, then tear down the
    /// worker threads.
    pub fn join(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            while state.live > 0 {
                state = self.inner.drained.wait(state).unwrap();
            }
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(5));
        }
    }

    /// Pending commands not yet dispatched to a connection.
    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    /// How often `key` has been retried after server rejections.
    pub fn retry_count(&self, key: SegmentKey) -> u32 {
        self.inner
            .state
            .lock()
            .unwrap()
            .retries
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    /// The most recently minted message-id for `key`, if it was ever
    /// re-minted after a rejection.
    pub fn reminted_message_id(&self, key: SegmentKey) -> Option<String> {
        self.inner.state.lock().unwrap().reminted.get(&key).cloned()
    }

    /// Why the batch died early, if it did.
    pub fn abort_cause(&self) -> Option<PostError> {
        self.inner
            .state
            .lock()
            .unwrap()
            .aborted
            .map(|cause| match cause {
                AbortCause::RetryLimit => PostError::Aborted,
                AbortCause::PoolEmpty => PostError::NoConnectionsLeft,
            })
    }
}

impl Inner {
    fn enqueue(&self, command: QueuedCommand, bypass_wait: bool) -> Result<(), PostError> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(cause) = state.aborted {
                return Err(match cause {
                    AbortCause::RetryLimit => PostError::Aborted,
                    AbortCause::PoolEmpty => PostError::NoConnectionsLeft,
                });
            }
            if let Some(id) = state.ready.pop_front() {
                state.busy.insert(id);
                Self::dispatch(&mut state, id, command);
                return Ok(());
            }
            let max = self.options.max_queue_size;
            if bypass_wait || max == 0 || state.queue.len() < max {
                break;
            }
            state = self.space.wait(state).unwrap();
        }
        state.queue.push_back(command);
        Ok(())
    }

    /// Send a command to a connection already accounted busy. Requeues at
    /// the front if the connection vanished between decision and send.
    fn dispatch(state: &mut State, id: ConnId, command: QueuedCommand) {
        let conn_command = match command {
            QueuedCommand::Post(article) => ConnCommand::Post(article),
            QueuedCommand::Stat(message_id) => ConnCommand::Stat(message_id),
        };
        let sent = match state.connections.get(&id) {
            Some(handle) => handle.commands.send(conn_command),
            None => Err(mpsc::error::SendError(conn_command)),
        };
        if let Err(mpsc::error::SendError(conn_command)) = sent {
            let command = match conn_command {
                ConnCommand::Post(article) => QueuedCommand::Post(article),
                ConnCommand::Stat(message_id) => QueuedCommand::Stat(message_id),
                ConnCommand::Quit => return,
            };
            state.queue.push_front(command);
        }
    }

    /// A connection finished a command (or just authenticated): give it
    /// queued work, or park it; after `stop()` an idle pool disconnects.
    fn conn_becomes_ready(&self, state: &mut State, id: ConnId) {
        if state.aborted.is_none() {
            if let Some(command) = state.queue.pop_front() {
                if self.options.max_queue_size != 0 {
                    self.space.notify_one();
                }
                Self::dispatch(state, id, command);
                return;
            }
        }

        state.busy.remove(&id);
        state.ready.push_back(id);

        if !state.running {
            self.quit_idle_connections(state);
        }
    }

    fn quit_idle_connections(&self, state: &mut State) {
        while let Some(id) = state.ready.pop_front() {
            if let Some(handle) = state.connections.get(&id) {
                let _ = handle.commands.send(ConnCommand::Quit);
            }
        }
    }

    /// Give a command to an idle connection or queue it unconditionally
    /// (retry paths skip the queue bound).
    fn dispatch_or_queue(&self, state: &mut State, command: QueuedCommand) {
        if let Some(id) = state.ready.pop_front() {
            state.busy.insert(id);
            Self::dispatch(state, id, command);
        } else {
            state.queue.push_back(command);
        }
    }

    /// Drop a connection from the pool entirely. An empty pool means the
    /// batch can never finish: abort and wake everyone.
    fn discard_connection(&self, state: &mut State, id: ConnId) {
        state.connections.remove(&id);
        state.busy.remove(&id);
        state.ready.retain(|&other| other != id);
        state.live -= 1;

        let remaining = state.connections.len();
        tracing::warn!("connection discarded; {remaining} left in the pool");

        if remaining == 0 && state.aborted.is_none() {
            tracing::error!("no connections left to work with");
            self.abort(state, AbortCause::PoolEmpty);
        }
        if state.live == 0 {
            self.drained.notify_all();
        }
    }

    fn abort(&self, state: &mut State, cause: AbortCause) {
        state.aborted = Some(cause);
        state.running = false;
        if cause == AbortCause::RetryLimit {
            state.queue.clear();
        }
        self.space.notify_all();
        self.quit_idle_connections(state);
    }

    fn on_connected(&self, id: ConnId) {
        tracing::debug!("connection {id} authenticated");
        let mut state = self.state.lock().unwrap();
        self.conn_becomes_ready(&mut state, id);
    }

    fn on_connect_failed(&self, id: ConnId, error: ConnectError) {
        match &error {
            ConnectError::InvalidCredentials(code) => {
                tracing::error!("connection {id} reported invalid credentials ({code})");
            }
            ConnectError::Fatal(e) => {
                tracing::error!("connection {id} could not connect: {e}");
            }
        }
        let mut state = self.state.lock().unwrap();
        self.discard_connection(&mut state, id);
    }

    fn on_connection_closed(&self, id: ConnId) {
        let mut state = self.state.lock().unwrap();
        state.connections.remove(&id);
        state.live -= 1;
        if state.live == 0 {
            self.drained.notify_all();
        }
    }

    fn on_post_finished(&self, id: ConnId, article: Arc<Article>, outcome: PostOutcome) -> Directive {
        match outcome {
            PostOutcome::Success => {
                (self.callbacks.post_finished)(&article);
                let mut state = self.state.lock().unwrap();
                self.conn_becomes_ready(&mut state, id);
                Directive::Continue
            }
            PostOutcome::NotPermitted => {
                tracing::error!(
                    "posting not permitted on connection {id}; discarding it and re-dispatching"
                );
                let mut state = self.state.lock().unwrap();
                self.discard_connection(&mut state, id);
                if state.aborted.is_none() {
                    self.dispatch_or_queue(&mut state, QueuedCommand::Post(article));
                }
                Directive::Shutdown
            }
            PostOutcome::Rejected(_) => {
                (self.callbacks.post_failed)(&article);
                let mut exhausted = false;
                {
                    let mut state = self.state.lock().unwrap();
                    match article.segment_key() {
                        Some(key) if state.aborted.is_none() => {
                            let count = state.retries.entry(key).or_insert(0);
                            if *count >= self.options.max_retries {
                                exhausted = true;
                                tracing::error!(
                                    "segment {key} rejected {} times; aborting the batch",
                                    *count + 1
                                );
                                self.abort(&mut state, AbortCause::RetryLimit);
                            } else {
                                *count += 1;
                                let nonce = (self.nonce)();
                                let message_id =
                                    key.message_id(&nonce, &self.options.msgid_domain);
                                tracing::warn!(
                                    "segment {key} rejected; retrying as {message_id}"
                                );
                                state.reminted.insert(key, message_id.clone());
                                let retry = Arc::new(article.with_message_id(message_id));
                                self.dispatch_or_queue(&mut state, QueuedCommand::Post(retry));
                            }
                        }
                        Some(_) => {}
                        None => {
                            tracing::error!(
                                "rejected article {} has a foreign message-id; giving up on it",
                                article.message_id()
                            );
                        }
                    }
                    self.conn_becomes_ready(&mut state, id);
                }
                if exhausted {
                    self.dump_article(&article);
                }
                Directive::Continue
            }
            PostOutcome::ConnectionError => {
                tracing::error!(
                    "connection error while posting \"{}\"; requeueing and reconnecting",
                    article.subject()
                );
                let mut state = self.state.lock().unwrap();
                if state.aborted.is_none() {
                    state.queue.push_back(QueuedCommand::Post(article));
                    Directive::Reconnect
                } else {
                    self.discard_connection(&mut state, id);
                    Directive::Shutdown
                }
            }
        }
    }

    fn on_stat_finished(&self, id: ConnId, message_id: String, outcome: StatOutcome) -> Directive {
        match outcome {
            StatOutcome::ConnectionError => {
                tracing::error!("stat for {message_id} failed with a connection error; retrying");
                let mut state = self.state.lock().unwrap();
                if state.aborted.is_none() {
                    state.queue.push_back(QueuedCommand::Stat(message_id));
                    Directive::Reconnect
                } else {
                    self.discard_connection(&mut state, id);
                    Directive::Shutdown
                }
            }
            outcome => {
                (self.callbacks.stat_finished)(&message_id, outcome);
                let mut state = self.state.lock().unwrap();
                self.conn_becomes_ready(&mut state, id);
                Directive::Continue
            }
        }
    }

    /// Last resort for a segment the servers will not take: keep the bytes
    /// on disk so the run is not silently lossy.
    fn dump_article(&self, article: &Article) {
        let name = match article.segment_key() {
            Some(key) => format!("segment-{}-{}.dump", key.file_index, key.piece_index),
            None => "segment-unknown.dump".to_string(),
        };
        let path = self.options.dump_dir.join(name);

        let mut data = Vec::with_capacity(article.payload_size() + 512);
        article.header().write_to(&mut data);
        data.extend_from_slice(b"\r\n");
        for chunk in article.payload() {
            data.extend_from_slice(chunk);
        }

        match std::fs::write(&path, &data) {
            Ok(()) => tracing::error!(
                "segment exceeded the retry limit; article dumped to {}",
                path.display()
            ),
            Err(e) => tracing::error!("failed to dump abandoned article: {e}"),
        }
    }
}

/// One connection's lifecycle: connect and authenticate, then serve
/// commands until told to quit, reconnecting after transport failures.
async fn connection_task(
    id: ConnId,
    server: Arc<ServerConfig>,
    inner: Arc<Inner>,
    mut commands: mpsc::UnboundedReceiver<ConnCommand>,
) {
    let op_timeout = inner.options.op_timeout;
    'session: loop {
        let mut conn = match NntpConnection::connect(&server, op_timeout).await {
            Ok(conn) => conn,
            Err(error) => {
                inner.on_connect_failed(id, error);
                return;
            }
        };
        inner.on_connected(id);

        while let Some(command) = commands.recv().await {
            let directive = match command {
                ConnCommand::Post(article) => {
                    let outcome = conn.post(&article).await;
                    inner.on_post_finished(id, article, outcome)
                }
                ConnCommand::Stat(message_id) => {
                    let outcome = conn.stat(&message_id).await;
                    inner.on_stat_finished(id, message_id, outcome)
                }
                ConnCommand::Quit => {
                    conn.quit().await;
                    inner.on_connection_closed(id);
                    return;
                }
            };
            match directive {
                Directive::Continue => {}
                Directive::Reconnect => {
                    conn.close().await;
                    continue 'session;
                }
                Directive::Shutdown => {
                    conn.close().await;
                    return;
                }
            }
        }
        // Engine dropped the sender; nothing further to report.
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nntp::testing::{FakeServer, PostReply, ServerBehavior};
    use crate::post::ArticleHeader;
    use crate::post::FileSet;
    use std::io::Write as _;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    fn options(max_queue_size: usize) -> EngineOptions {
        EngineOptions {
            io_threads: 1,
            max_queue_size,
            max_retries: 3,
            op_timeout: Duration::from_secs(5),
            msgid_domain: "ul-nzb".to_string(),
            dump_dir: std::env::temp_dir(),
        }
    }

    fn plain_article(nonce: &str, file_index: u32, piece_index: u32) -> Arc<Article> {
        let key = SegmentKey::new(file_index, piece_index);
        let header = ArticleHeader {
            from: "tester <t@example.com>".to_string(),
            subject: format!("test ({}/3)", piece_index + 1),
            message_id: key.message_id(nonce, "ul-nzb"),
            newsgroups: vec!["misc.test".to_string()],
            extra: vec![],
        };
        let mut article = Article::new(header);
        article.push_payload(bytes::Bytes::from(vec![b'A'; 64]));
        Arc::new(article)
    }

    fn counting_engine(
        max_queue_size: usize,
        finished: &Arc<AtomicUsize>,
        failed: &Arc<AtomicUsize>,
    ) -> PostingEngine {
        let finished = Arc::clone(finished);
        let failed = Arc::clone(failed);
        PostingEngine::builder(options(max_queue_size))
            .post_finished(move |_| {
                finished.fetch_add(1, Ordering::SeqCst);
            })
            .post_failed(move |_| {
                failed.fetch_add(1, Ordering::SeqCst);
            })
            .build()
    }

    #[test]
    fn posts_every_segment_over_one_connection() {
        let server = FakeServer::start(ServerBehavior::default());

        let mut input = tempfile::NamedTempFile::new().unwrap();
        input.write_all(&vec![0x41u8; 1_048_576]).unwrap();
        input.flush().unwrap();
        let mut set = FileSet::new(400_000, 128);
        set.add_file(input.path()).unwrap();

        let finished = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let mut engine = counting_engine(0, &finished, &failed);
        engine.start().unwrap();
        engine.add_connections(server.server_config(1), 1).unwrap();

        let keys: Vec<SegmentKey> = set.keys().collect();
        for key in keys {
            let message_id = key.message_id("runnonce12345678", "ul-nzb");
            let article = set
                .build_article(
                    key,
                    message_id,
                    "tester <t@example.com>",
                    "testpost",
                    &["misc.test".to_string()],
                )
                .unwrap();
            engine.enqueue_post(Arc::new(article), false).unwrap();
        }
        engine.stop();
        engine.join();

        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert_eq!(failed.load(Ordering::SeqCst), 0);
        assert!(engine.abort_cause().is_none());
        assert_eq!(engine.queue_len(), 0);

        let posts = server.posts.lock().unwrap();
        assert_eq!(posts.len(), 3);
        // One connection serves its commands strictly in order.
        for (i, post) in posts.iter().enumerate() {
            assert!(post.contains(&format!("=ybegin part={} total=3", i + 1)));
            assert!(post.contains(&format!("Message-ID: <runnonce12345678.0.{}@ul-nzb>", i)));
            assert!(post.contains("Newsgroups: misc.test"));
        }
    }

    #[test]
    fn rejected_piece_is_reminted_and_retried() {
        let already_rejected = Arc::new(AtomicBool::new(false));
        let server = FakeServer::start(ServerBehavior {
            respond_post: Arc::new({
                let already_rejected = Arc::clone(&already_rejected);
                move |_, article| {
                    if article.contains(".0.1@") && !already_rejected.swap(true, Ordering::SeqCst)
                    {
                        PostReply::Reject(441)
                    } else {
                        PostReply::Accept
                    }
                }
            }),
            ..ServerBehavior::default()
        });

        let finished = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let mut engine = {
            let finished = Arc::clone(&finished);
            let failed = Arc::clone(&failed);
            let minted = AtomicUsize::new(0);
            PostingEngine::builder(options(0))
                .post_finished(move |_| {
                    finished.fetch_add(1, Ordering::SeqCst);
                })
                .post_failed(move |_| {
                    failed.fetch_add(1, Ordering::SeqCst);
                })
                .nonce_generator(move || {
                    format!("retrynonce{:06}", minted.fetch_add(1, Ordering::SeqCst))
                })
                .build()
        };
        engine.start().unwrap();
        engine.add_connections(server.server_config(1), 1).unwrap();

        for piece in 0..3 {
            engine
                .enqueue_post(plain_article("orignonce1234567", 0, piece), false)
                .unwrap();
        }
        engine.stop();
        engine.join();

        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert!(engine.abort_cause().is_none());

        let key = SegmentKey::new(0, 1);
        assert_eq!(engine.retry_count(key), 1);
        let reminted = engine.reminted_message_id(key).unwrap();
        assert!(reminted.starts_with("<retrynonce"));
        assert_eq!(SegmentKey::from_message_id(&reminted), Some(key));

        // Three originals plus one re-minted attempt hit the server.
        assert_eq!(server.post_count(), 4);
    }

    #[test]
    fn transient_drop_requeues_and_reconnects() {
        let server = FakeServer::start(ServerBehavior {
            drop_on_post: Arc::new(|seq| seq == 0),
            ..ServerBehavior::default()
        });

        let finished = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let mut engine = counting_engine(0, &finished, &failed);
        engine.start().unwrap();
        engine.add_connections(server.server_config(1), 1).unwrap();

        for piece in 0..3 {
            engine
                .enqueue_post(plain_article("droppednonce1234", 0, piece), false)
                .unwrap();
        }
        engine.stop();
        engine.join();

        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert!(engine.abort_cause().is_none());
        // The dropped session forced at least one reconnect and re-auth.
        assert!(server.session_count() >= 2);
        assert_eq!(server.post_count(), 3);
    }

    #[test]
    fn auth_failure_discards_connection_and_work_continues() {
        let bad = FakeServer::start(ServerBehavior {
            accept_auth: false,
            ..ServerBehavior::default()
        });
        let good = FakeServer::start(ServerBehavior::default());

        let finished = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let mut engine = counting_engine(0, &finished, &failed);
        engine.start().unwrap();
        engine.add_connections(bad.server_config(1), 1).unwrap();
        engine.add_connections(good.server_config(2), 2).unwrap();

        for piece in 0..6 {
            engine
                .enqueue_post(plain_article("failovernonce123", 0, piece), false)
                .unwrap();
        }
        engine.stop();
        engine.join();

        assert_eq!(finished.load(Ordering::SeqCst), 6);
        assert!(engine.abort_cause().is_none());
        assert_eq!(bad.post_count(), 0);
        assert_eq!(good.post_count(), 6);
    }

    #[test]
    fn bounded_queue_applies_backpressure() {
        let server = FakeServer::start(ServerBehavior {
            post_delay: Duration::from_millis(25),
            ..ServerBehavior::default()
        });

        let finished = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let mut engine = counting_engine(4, &finished, &failed);
        engine.start().unwrap();
        engine.add_connections(server.server_config(1), 1).unwrap();

        let done = AtomicBool::new(false);
        let max_observed = AtomicUsize::new(0);

        let enqueue_elapsed = std::thread::scope(|scope| {
            let engine = &engine;
            scope.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    max_observed.fetch_max(engine.queue_len(), Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(2));
                }
            });

            let start = Instant::now();
            for piece in 0..20 {
                engine
                    .enqueue_post(plain_article("pressurenonce123", 0, piece), false)
                    .unwrap();
            }
            let elapsed = start.elapsed();
            done.store(true, Ordering::SeqCst);
            elapsed
        });

        engine.stop();
        engine.join();

        assert_eq!(finished.load(Ordering::SeqCst), 20);
        assert!(engine.abort_cause().is_none());
        assert!(
            max_observed.load(Ordering::SeqCst) <= 4,
            "queue grew past its bound: {}",
            max_observed.load(Ordering::SeqCst)
        );
        // The producer had to wait for the slow connection to drain work.
        assert!(enqueue_elapsed >= Duration::from_millis(100));
    }

    #[test]
    fn retry_limit_aborts_and_dumps_the_article() {
        let server = FakeServer::start(ServerBehavior {
            respond_post: Arc::new(|_, _| PostReply::Reject(441)),
            ..ServerBehavior::default()
        });

        let dump_dir = tempfile::tempdir().unwrap();
        let finished = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let mut engine = {
            let finished = Arc::clone(&finished);
            let failed = Arc::clone(&failed);
            PostingEngine::builder(EngineOptions {
                max_retries: 2,
                dump_dir: dump_dir.path().to_path_buf(),
                ..options(0)
            })
            .post_finished(move |_| {
                finished.fetch_add(1, Ordering::SeqCst);
            })
            .post_failed(move |_| {
                failed.fetch_add(1, Ordering::SeqCst);
            })
            .build()
        };
        engine.start().unwrap();
        engine.add_connections(server.server_config(1), 1).unwrap();

        engine
            .enqueue_post(plain_article("doomednonce12345", 0, 0), false)
            .unwrap();
        engine.stop();
        engine.join();

        assert_eq!(finished.load(Ordering::SeqCst), 0);
        // Initial rejection plus two re-minted attempts.
        assert_eq!(failed.load(Ordering::SeqCst), 3);
        assert_eq!(engine.retry_count(SegmentKey::new(0, 0)), 2);
        assert!(matches!(engine.abort_cause(), Some(PostError::Aborted)));

        let dump = dump_dir.path().join("segment-0-0.dump");
        let dumped = std::fs::read(&dump).unwrap();
        assert!(dumped.windows(4).any(|w| w == b"From"));

        // A dead batch refuses further work.
        let err = engine
            .enqueue_post(plain_article("doomednonce12345", 0, 1), false)
            .unwrap_err();
        assert!(matches!(err, PostError::Aborted));
    }

    #[test]
    fn empty_pool_aborts_without_hanging() {
        let server = FakeServer::start(ServerBehavior {
            accept_auth: false,
            ..ServerBehavior::default()
        });

        let finished = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let mut engine = counting_engine(0, &finished, &failed);
        engine.start().unwrap();
        engine.add_connections(server.server_config(1), 1).unwrap();

        // May land in the queue before the connection is discarded; either
        // way the engine must come to rest without posting it.
        let _ = engine.enqueue_post(plain_article("strandednonce123", 0, 0), false);

        engine.stop();
        engine.join();

        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert!(matches!(
            engine.abort_cause(),
            Some(PostError::NoConnectionsLeft)
        ));
        let err = engine
            .enqueue_post(plain_article("strandednonce123", 0, 1), false)
            .unwrap_err();
        assert!(matches!(err, PostError::NoConnectionsLeft));
    }

    #[test]
    fn stat_results_reach_the_callback() {
        let server = FakeServer::start(ServerBehavior {
            stat_exists: Arc::new(|message_id| message_id.contains(".0.0@")),
            ..ServerBehavior::default()
        });

        let results = Arc::new(Mutex::new(Vec::new()));
        let mut engine = {
            let results = Arc::clone(&results);
            PostingEngine::builder(options(0))
                .stat_finished(move |message_id, outcome| {
                    results.lock().unwrap().push((message_id.to_string(), outcome));
                })
                .build()
        };
        engine.start().unwrap();
        engine.add_connections(server.server_config(1), 1).unwrap();

        engine
            .enqueue_stat("<statnonce123456.0.0@ul-nzb>".to_string())
            .unwrap();
        engine
            .enqueue_stat("<statnonce123456.0.1@ul-nzb>".to_string())
            .unwrap();
        engine.stop();
        engine.join();

        let mut results = results.lock().unwrap().clone();
        results.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            results,
            vec![
                ("<statnonce123456.0.0@ul-nzb>".to_string(), StatOutcome::Exists),
                ("<statnonce123456.0.1@ul-nzb>".to_string(), StatOutcome::Missing),
            ]
        );
    }

    #[test]
    fn generated_nonces_are_well_formed() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_eq!(a.len(), NONCE_LENGTH);
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        // Two draws colliding would be a broken generator, not bad luck.
        assert_ne!(a, b);
    }
}
