//! Cursor-based content sync through the tunnel endpoint.
//!
//! [`SyncEngine`] keeps an opaque cursor describing the last content the client has seen. A sync
//! polls the tunnel with that cursor; when the server reports a change, the changed files are
//! downloaded into the [`ContentCache`], the cursor advances and the pending-reload flag is set.
//!
//! At most one tunnel request is outstanding at any time. Callers that arrive while a request is
//! in flight wait for it and share its result.
//!
//! While watching, a background thread long-polls the tunnel in a loop, backing off
//! exponentially on failures. Backgrounding the host application stops the watcher and bumps a
//! generation counter; responses to requests issued under an older generation are discarded.
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        mpsc::{RecvTimeoutError, SyncSender, TryRecvError},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::JoinHandle,
    time::Duration,
};

use crate::backoff::Backoff;
use crate::content::ContentCache;
use crate::reload_listener::{ContentChange, NoopReloadListener, ReloadListener};
use crate::remote_client::{PollMode, PollResponse, RemoteClient};
use crate::{Error, Result};

/// Configuration for [`SyncEngine`].
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Delay before the first retry after a failed poll.
    ///
    /// Defaults to [`SyncConfig::DEFAULT_MIN_BACKOFF`].
    pub min_backoff: Duration,
    /// Upper bound for the delay between retries. Delays double after every consecutive failure
    /// until they reach this value.
    ///
    /// Defaults to [`SyncConfig::DEFAULT_MAX_BACKOFF`].
    pub max_backoff: Duration,
    /// Delay between successful polls while watching. Long-polling makes the server hold each
    /// request, so no extra delay is needed.
    ///
    /// Defaults to [`SyncConfig::DEFAULT_POLL_INTERVAL`].
    pub poll_interval: Duration,
}

impl SyncConfig {
    /// Default value for [`SyncConfig::min_backoff`].
    pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(1);
    /// Default value for [`SyncConfig::max_backoff`].
    pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
    /// Default value for [`SyncConfig::poll_interval`].
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::ZERO;

    /// Create a new `SyncConfig` using default configuration.
    pub fn new() -> SyncConfig {
        SyncConfig::default()
    }

    /// Update minimum backoff with `min_backoff`.
    pub fn with_min_backoff(mut self, min_backoff: Duration) -> SyncConfig {
        self.min_backoff = min_backoff;
        self
    }

    /// Update maximum backoff with `max_backoff`.
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> SyncConfig {
        self.max_backoff = max_backoff;
        self
    }

    /// Update poll interval with `poll_interval`.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> SyncConfig {
        self.poll_interval = poll_interval;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> SyncConfig {
        SyncConfig {
            min_backoff: SyncConfig::DEFAULT_MIN_BACKOFF,
            max_backoff: SyncConfig::DEFAULT_MAX_BACKOFF,
            poll_interval: SyncConfig::DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Result of a sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Content did not change; the cursor was left as is.
    Unchanged,
    /// Content changed and was downloaded; the cursor advanced to `cursor`.
    Changed {
        /// New cursor.
        cursor: String,
    },
    /// The response arrived after the engine was backgrounded, stopped or reset, and was
    /// discarded.
    Stale,
}

/// Snapshot of the sync session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSession {
    /// Current cursor, `None` until the first change is received.
    pub cursor: Option<String>,
    /// Whether the watcher thread is running.
    pub is_watching: bool,
    /// Whether changed content is waiting to be reloaded.
    pub pending_reload: bool,
}

/// A request shared by every caller that asked for a sync while it was in flight.
struct Flight {
    /// Generation the request was issued under. Callers never join a flight from an older
    /// generation.
    generation: u64,
    result: Mutex<Option<Result<SyncOutcome>>>,
    ready: Condvar,
}

impl Flight {
    fn new(generation: u64) -> Flight {
        Flight {
            generation,
            result: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn wait(&self) -> Result<SyncOutcome> {
        let mut lock = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match &*lock {
                Some(result) => return result.clone(),
                None => {
                    lock = self.ready.wait(lock).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    fn publish(&self, result: Result<SyncOutcome>) {
        *self.result.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
        self.ready.notify_all();
    }
}

#[derive(Default)]
struct SyncState {
    cursor: Option<String>,
    pending_reload: bool,
    /// Watching was requested by the host.
    should_watch: bool,
    backgrounded: bool,
    generation: u64,
    in_flight: Option<Arc<Flight>>,
    watcher: Option<Watcher>,
}

impl SyncState {
    /// Invalidate outstanding requests and stop the watcher thread.
    fn suspend(&mut self) {
        self.generation += 1;
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
    }
}

struct Watcher {
    join_handle: JoinHandle<()>,
    /// Used to send a stop command to the watcher thread.
    stop_sender: SyncSender<()>,
}

impl Watcher {
    fn stop(&self) {
        // Error means that the thread already exited or that a stop command is already buffered.
        let _ = self.stop_sender.try_send(());
    }

    fn is_running(&self) -> bool {
        !self.join_handle.is_finished()
    }
}

struct Shared {
    remote: Arc<dyn RemoteClient + Send + Sync>,
    content: ContentCache,
    config: SyncConfig,
    reload_listener: Box<dyn ReloadListener + Send + Sync>,
    state: Mutex<SyncState>,
}

/// Keeps synced content up to date. See the [module documentation](self).
pub struct SyncEngine {
    shared: Arc<Shared>,
}

impl SyncEngine {
    /// Create an idle engine with an empty cursor.
    pub fn new(
        remote: Arc<dyn RemoteClient + Send + Sync>,
        content: ContentCache,
        config: SyncConfig,
    ) -> SyncEngine {
        SyncEngine::from_parts(remote, content, config, Box::new(NoopReloadListener))
    }

    /// Create an idle engine that notifies `reload_listener` whenever content changes.
    pub fn with_reload_listener(
        remote: Arc<dyn RemoteClient + Send + Sync>,
        content: ContentCache,
        config: SyncConfig,
        reload_listener: impl ReloadListener + Send + Sync + 'static,
    ) -> SyncEngine {
        SyncEngine::from_parts(remote, content, config, Box::new(reload_listener))
    }

    pub(crate) fn from_parts(
        remote: Arc<dyn RemoteClient + Send + Sync>,
        content: ContentCache,
        config: SyncConfig,
        reload_listener: Box<dyn ReloadListener + Send + Sync>,
    ) -> SyncEngine {
        SyncEngine {
            shared: Arc::new(Shared {
                remote,
                content,
                config,
                reload_listener,
                state: Mutex::new(SyncState::default()),
            }),
        }
    }

    /// Poll the tunnel once with the current cursor, without waiting for changes.
    ///
    /// Blocks until the request completes. If another request is already in flight, waits for it
    /// and returns its result instead of issuing a new one.
    pub fn sync(&self) -> Result<SyncOutcome> {
        self.shared.sync(PollMode::Immediate, None)
    }

    /// Start watching the tunnel for changes from a background thread. Watching is suspended
    /// while the engine is backgrounded.
    pub fn start_watching(&self) -> Result<()> {
        let mut state = self.shared.state();
        state.should_watch = true;
        self.ensure_watcher(&mut state)
    }

    /// Stop watching. Any outstanding long-poll is abandoned and its response discarded.
    pub fn stop_watching(&self) {
        let mut state = self.shared.state();
        state.should_watch = false;
        state.suspend();
    }

    /// The host application moved to the background: suspend watching. Cursor and pending-reload
    /// flag are kept.
    pub fn background(&self) {
        log::debug!(target: "clutch", "sync engine backgrounded");
        let mut state = self.shared.state();
        state.backgrounded = true;
        state.suspend();
    }

    /// The host application returned to the foreground: catch up with an immediate sync, then
    /// resume watching if it was requested.
    ///
    /// Blocks until the catch-up sync completes and returns its outcome. A request left over
    /// from before backgrounding is never joined.
    pub fn foreground(&self) -> Result<SyncOutcome> {
        let generation = self.enter_foreground();
        self.catch_up(generation)
    }

    /// First half of [`SyncEngine::foreground`]: leave the background. Returns the generation
    /// the catch-up sync belongs to.
    pub(crate) fn enter_foreground(&self) -> u64 {
        log::debug!(target: "clutch", "sync engine foregrounded");
        let mut state = self.shared.state();
        state.backgrounded = false;
        state.generation
    }

    /// Second half of [`SyncEngine::foreground`]: sync and resume watching, unless the engine
    /// was backgrounded, stopped or reset since `generation`.
    pub(crate) fn catch_up(&self, generation: u64) -> Result<SyncOutcome> {
        let outcome = self.shared.sync(PollMode::Immediate, Some(generation));

        let mut state = self.shared.state();
        if state.generation == generation {
            self.ensure_watcher(&mut state)?;
        }
        outcome
    }

    /// Whether changed content is waiting to be reloaded.
    pub fn pending_reload(&self) -> bool {
        self.shared.state().pending_reload
    }

    /// Acknowledge a reload, clearing the pending-reload flag. Returns the previous value.
    pub fn acknowledge_reload(&self) -> bool {
        std::mem::take(&mut self.shared.state().pending_reload)
    }

    /// Current cursor.
    pub fn cursor(&self) -> Option<String> {
        self.shared.state().cursor.clone()
    }

    /// Snapshot of the session state.
    pub fn session(&self) -> SyncSession {
        let state = self.shared.state();
        SyncSession {
            cursor: state.cursor.clone(),
            is_watching: state.watcher.as_ref().is_some_and(Watcher::is_running),
            pending_reload: state.pending_reload,
        }
    }

    /// Local copy of the synced content.
    pub fn content(&self) -> &ContentCache {
        &self.shared.content
    }

    /// Forget the cursor and the pending-reload flag, discarding any in-flight response. Use
    /// this when the client identity changes.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.shared.state();
        state.cursor = None;
        state.pending_reload = false;
        state.suspend();
        self.ensure_watcher(&mut state)
    }

    /// Stop watching and wait for the watcher thread to exit.
    ///
    /// If the watcher is blocked in a long-poll, this waits until the request completes or times
    /// out. Use [`SyncEngine::stop_watching`] to return immediately.
    pub fn shutdown(&self) -> Result<()> {
        let watcher = {
            let mut state = self.shared.state();
            state.should_watch = false;
            state.generation += 1;
            state.watcher.take()
        };

        if let Some(watcher) = watcher {
            watcher.stop();
            // Error means that the thread has panicked and there's nothing useful we can do in
            // that case.
            watcher
                .join_handle
                .join()
                .map_err(|_| Error::SyncPanicked)?;
        }
        Ok(())
    }

    fn ensure_watcher(&self, state: &mut SyncState) -> Result<()> {
        if !state.should_watch || state.backgrounded {
            return Ok(());
        }
        if state.watcher.as_ref().is_some_and(Watcher::is_running) {
            return Ok(());
        }
        state.watcher = Some(spawn_watcher(&self.shared, state.generation)?);
        Ok(())
    }

    #[cfg(test)]
    fn in_flight_sharers(&self) -> usize {
        self.shared
            .state()
            .in_flight
            .as_ref()
            .map_or(0, Arc::strong_count)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        let mut state = self.shared.state();
        state.should_watch = false;
        state.suspend();
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SyncState> {
        // Remote calls run outside the lock and listener panics are contained, so the state is
        // never left half-updated.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state().generation == generation
    }

    /// Sync, joining the in-flight request if there is one. With `Some(generation)`, nothing is
    /// issued unless `generation` is still current.
    fn sync(&self, mode: PollMode, generation: Option<u64>) -> Result<SyncOutcome> {
        loop {
            let (flight, lead) = {
                let mut state = self.state();
                if generation.is_some_and(|generation| generation != state.generation) {
                    return Ok(SyncOutcome::Stale);
                }
                match &state.in_flight {
                    Some(flight) if flight.generation == state.generation => {
                        (Arc::clone(flight), None)
                    }
                    // A flight from an older generation is left to finish on its own; its
                    // response will be discarded.
                    _ => {
                        let flight = Arc::new(Flight::new(state.generation));
                        state.in_flight = Some(Arc::clone(&flight));
                        (flight, Some(state.cursor.clone()))
                    }
                }
            };

            match lead {
                Some(cursor) => return self.lead(&flight, cursor, mode),
                None => {
                    log::trace!(target: "clutch", "joining in-flight sync request");
                    match flight.wait() {
                        // The shared request belonged to an older generation. Issue a new one.
                        Ok(SyncOutcome::Stale) => continue,
                        result => return result,
                    }
                }
            }
        }
    }

    fn lead(
        &self,
        flight: &Arc<Flight>,
        cursor: Option<String>,
        mode: PollMode,
    ) -> Result<SyncOutcome> {
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.poll(cursor.as_deref(), flight.generation, mode)
        }))
        .unwrap_or(Err(Error::SyncPanicked));

        {
            let mut state = self.state();
            // A newer generation may already have replaced this flight.
            if state
                .in_flight
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, flight))
            {
                state.in_flight = None;
            }
        }

        let (outcome, change) = match result {
            Ok((outcome, change)) => (Ok(outcome), change),
            Err(err) => {
                log::warn!(target: "clutch", "sync failed: {:?}", err);
                (Err(err), None)
            }
        };
        flight.publish(outcome.clone());

        if let Some(change) = change {
            let notified = catch_unwind(AssertUnwindSafe(|| {
                self.reload_listener.content_changed(&change)
            }));
            if notified.is_err() {
                log::warn!(target: "clutch", "reload listener panicked");
            }
        }
        outcome
    }

    fn poll(
        &self,
        cursor: Option<&str>,
        generation: u64,
        mode: PollMode,
    ) -> Result<(SyncOutcome, Option<ContentChange>)> {
        log::debug!(target: "clutch", cursor = cursor.unwrap_or_default(), generation; "polling tunnel");

        let response = self.remote.poll_tunnel(cursor, mode)?;

        if !self.is_current(generation) {
            log::debug!(target: "clutch", generation; "discarding stale tunnel response");
            return Ok((SyncOutcome::Stale, None));
        }

        let (cursor, change) = match response {
            PollResponse::Unchanged => return Ok((SyncOutcome::Unchanged, None)),
            PollResponse::Changed { cursor, change } => (cursor, change),
        };

        let updated_files = self.content.apply(&change, &*self.remote)?;

        {
            let mut state = self.state();
            if state.generation != generation {
                log::debug!(target: "clutch", generation; "discarding stale tunnel response");
                return Ok((SyncOutcome::Stale, None));
            }
            state.cursor = Some(cursor.clone());
            state.pending_reload = true;
        }

        log::debug!(target: "clutch",
                    cursor:display = cursor,
                    updated_files = updated_files.len();
                    "content changed");

        Ok((
            SyncOutcome::Changed {
                cursor: cursor.clone(),
            },
            Some(ContentChange {
                cursor,
                updated_files,
            }),
        ))
    }
}

fn spawn_watcher(shared: &Arc<Shared>, generation: u64) -> std::io::Result<Watcher> {
    // Buffer size of 1 is enough: we only ever send a single stop command and ignore the error
    // if the buffer is already full.
    let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);
    let shared = Arc::clone(shared);

    let join_handle = std::thread::Builder::new()
        .name("clutch-sync".to_owned())
        .spawn(move || {
            log::debug!(target: "clutch", generation; "sync watcher started");
            let mut backoff = Backoff::new(shared.config.min_backoff, shared.config.max_backoff);

            loop {
                let delay = match shared.sync(PollMode::LongPoll, Some(generation)) {
                    Ok(SyncOutcome::Stale) if !shared.is_current(generation) => break,
                    Ok(_) => {
                        backoff.reset();
                        shared.config.poll_interval
                    }
                    Err(Error::Unauthorized) => {
                        // Unauthorized means that the app key is not valid and thus is not
                        // recoverable. Stop the watcher.
                        log::warn!(target: "clutch", "sync is not authorized, stopping the watcher");
                        break;
                    }
                    Err(_) => {
                        let delay = backoff.next_delay();
                        log::debug!(target: "clutch", "retrying sync in {:?}", delay);
                        delay
                    }
                };

                let stopped = if delay.is_zero() {
                    match stop_receiver.try_recv() {
                        Err(TryRecvError::Empty) => false,
                        Ok(()) | Err(TryRecvError::Disconnected) => true,
                    }
                } else {
                    match stop_receiver.recv_timeout(delay) {
                        Err(RecvTimeoutError::Timeout) => false,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
                    }
                };
                if stopped {
                    break;
                }
            }

            log::debug!(target: "clutch", generation; "sync watcher stopped");
        })?;

    Ok(Watcher {
        join_handle,
        stop_sender,
    })
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc, Arc, Mutex,
        },
        thread,
        time::{Duration, Instant},
    };

    use serde_json::{Map, Value};

    use super::{SyncConfig, SyncEngine, SyncOutcome};
    use crate::content::ContentCache;
    use crate::reload_listener::ContentChange;
    use crate::remote_client::{
        fake::FakeRemote, ChangeDescriptor, PollMode, PollResponse, RemoteClient,
    };
    use crate::{Error, Result};

    fn changed(cursor: &str) -> PollResponse {
        PollResponse::Changed {
            cursor: cursor.to_owned(),
            change: ChangeDescriptor::default(),
        }
    }

    fn fast_config() -> SyncConfig {
        SyncConfig::new()
            .with_min_backoff(Duration::from_millis(20))
            .with_max_backoff(Duration::from_millis(40))
            .with_poll_interval(Duration::from_millis(5))
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Remote whose polls block until the test releases them. An immediate poll answers with
    /// the `immediate` response right away when one is set.
    struct GatedRemote {
        polls: AtomicUsize,
        modes: Mutex<Vec<PollMode>>,
        immediate: Mutex<Option<PollResponse>>,
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<PollResponse>>,
    }

    impl GatedRemote {
        fn new() -> (Arc<GatedRemote>, mpsc::Receiver<()>, mpsc::Sender<PollResponse>) {
            let (entered_sender, entered) = mpsc::channel();
            let (release, release_receiver) = mpsc::channel();
            let remote = Arc::new(GatedRemote {
                polls: AtomicUsize::new(0),
                modes: Mutex::new(Vec::new()),
                immediate: Mutex::new(None),
                entered: Mutex::new(entered_sender),
                release: Mutex::new(release_receiver),
            });
            (remote, entered, release)
        }
    }

    impl RemoteClient for GatedRemote {
        fn call_method(&self, _method: &str, _params: &Map<String, Value>) -> Result<Value> {
            Ok(Value::Null)
        }

        fn download_file(&self, _file_name: &str, _version: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn poll_tunnel(&self, _cursor: Option<&str>, mode: PollMode) -> Result<PollResponse> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            self.modes.lock().unwrap().push(mode);
            if mode == PollMode::Immediate {
                if let Some(response) = self.immediate.lock().unwrap().take() {
                    return Ok(response);
                }
            }
            let _ = self.entered.lock().unwrap().send(());
            self.release
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(5))
                .map_err(|_| Error::MalformedResponse("test did not release the poll".to_owned()))
        }
    }

    #[test]
    fn cursor_advances_on_change_and_stays_on_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(FakeRemote::default());
        remote.push_poll(Ok(changed("abc")));
        remote.push_poll(Ok(PollResponse::Unchanged));
        let engine = SyncEngine::new(remote.clone(), ContentCache::new(dir.path()), fast_config());

        assert_eq!(
            engine.sync().unwrap(),
            SyncOutcome::Changed {
                cursor: "abc".to_owned()
            }
        );
        assert_eq!(engine.cursor().as_deref(), Some("abc"));
        assert!(engine.pending_reload());

        assert_eq!(engine.sync().unwrap(), SyncOutcome::Unchanged);
        assert_eq!(engine.cursor().as_deref(), Some("abc"));
        assert!(engine.pending_reload());

        assert_eq!(
            *remote.poll_cursors.lock().unwrap(),
            [None, Some("abc".to_owned())]
        );

        assert!(engine.acknowledge_reload());
        assert!(!engine.pending_reload());
        assert!(!engine.acknowledge_reload());
    }

    #[test]
    fn failed_poll_keeps_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(FakeRemote::default());
        remote.push_poll(Ok(changed("abc")));
        remote.push_poll(Err(Error::Status {
            status: 503,
            body: Default::default(),
        }));
        remote.push_poll(Ok(changed("abd")));
        let engine = SyncEngine::new(remote.clone(), ContentCache::new(dir.path()), fast_config());

        engine.sync().unwrap();
        assert!(engine.sync().is_err());
        assert_eq!(engine.cursor().as_deref(), Some("abc"));

        engine.sync().unwrap();
        assert_eq!(engine.cursor().as_deref(), Some("abd"));
        assert_eq!(
            *remote.poll_cursors.lock().unwrap(),
            [None, Some("abc".to_owned()), Some("abc".to_owned())]
        );
    }

    #[test]
    fn failed_download_keeps_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(FakeRemote::default());
        remote.push_poll(Ok(PollResponse::Changed {
            cursor: "abc".to_owned(),
            change: ChangeDescriptor {
                files: [("index.html".to_owned(), "v1".to_owned())].into(),
            },
        }));
        let engine = SyncEngine::new(remote.clone(), ContentCache::new(dir.path()), fast_config());

        assert!(engine.sync().is_err());
        assert_eq!(engine.cursor(), None);
        assert!(!engine.pending_reload());
    }

    #[test]
    fn downloads_changed_files_and_notifies_listener() {
        let dir = tempfile::tempdir().unwrap();
        let remote =
            Arc::new(FakeRemote::default().with_file("index.html", "v1", b"<h1>hello</h1>"));
        remote.push_poll(Ok(PollResponse::Changed {
            cursor: "abc".to_owned(),
            change: ChangeDescriptor {
                files: [("index.html".to_owned(), "v1".to_owned())].into(),
            },
        }));
        let changes = Arc::new(Mutex::new(Vec::new()));
        let engine = {
            let changes = changes.clone();
            SyncEngine::with_reload_listener(
                remote.clone(),
                ContentCache::new(dir.path()),
                fast_config(),
                move |change: &ContentChange| changes.lock().unwrap().push(change.clone()),
            )
        };

        engine.sync().unwrap();

        assert_eq!(
            engine.content().read("index.html").unwrap().unwrap(),
            b"<h1>hello</h1>"
        );
        assert_eq!(
            *changes.lock().unwrap(),
            [ContentChange {
                cursor: "abc".to_owned(),
                updated_files: vec!["index.html".to_owned()],
            }]
        );
    }

    #[test]
    fn concurrent_syncs_share_one_request() {
        let dir = tempfile::tempdir().unwrap();
        let (remote, entered, release) = GatedRemote::new();
        let engine = Arc::new(SyncEngine::new(
            remote.clone(),
            ContentCache::new(dir.path()),
            fast_config(),
        ));

        let spawn_sync = || {
            let engine = engine.clone();
            thread::spawn(move || engine.sync())
        };

        let first = spawn_sync();
        entered.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = spawn_sync();
        let third = spawn_sync();

        // The state, the leader and both followers hold the in-flight request.
        wait_until(|| engine.in_flight_sharers() == 4);
        release.send(changed("abc")).unwrap();

        let expected = SyncOutcome::Changed {
            cursor: "abc".to_owned(),
        };
        for handle in [first, second, third] {
            assert_eq!(handle.join().unwrap().unwrap(), expected);
        }
        assert_eq!(remote.polls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.in_flight_sharers(), 0);
    }

    #[test]
    fn responses_after_background_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let (remote, entered, release) = GatedRemote::new();
        let engine = Arc::new(SyncEngine::new(
            remote.clone(),
            ContentCache::new(dir.path()),
            fast_config(),
        ));

        let handle = {
            let engine = engine.clone();
            thread::spawn(move || engine.sync())
        };
        entered.recv_timeout(Duration::from_secs(5)).unwrap();
        engine.background();
        release.send(changed("abc")).unwrap();

        assert_eq!(handle.join().unwrap().unwrap(), SyncOutcome::Stale);
        assert_eq!(engine.cursor(), None);
        assert!(!engine.pending_reload());
    }

    #[test]
    fn unchanged_after_background_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let (remote, entered, release) = GatedRemote::new();
        let engine = Arc::new(SyncEngine::new(
            remote.clone(),
            ContentCache::new(dir.path()),
            fast_config(),
        ));

        let handle = {
            let engine = engine.clone();
            thread::spawn(move || engine.sync())
        };
        entered.recv_timeout(Duration::from_secs(5)).unwrap();
        engine.background();
        release.send(PollResponse::Unchanged).unwrap();

        assert_eq!(handle.join().unwrap().unwrap(), SyncOutcome::Stale);
    }

    #[test]
    fn foreground_does_not_join_long_poll_from_before_background() {
        let dir = tempfile::tempdir().unwrap();
        let (remote, entered, release) = GatedRemote::new();
        let engine = Arc::new(SyncEngine::new(
            remote.clone(),
            ContentCache::new(dir.path()),
            fast_config(),
        ));

        engine.start_watching().unwrap();
        entered.recv_timeout(Duration::from_secs(5)).unwrap();
        engine.background();

        *remote.immediate.lock().unwrap() = Some(changed("fresh"));
        let foreground = {
            let engine = engine.clone();
            thread::spawn(move || engine.foreground())
        };
        assert_eq!(
            foreground.join().unwrap().unwrap(),
            SyncOutcome::Changed {
                cursor: "fresh".to_owned()
            }
        );
        assert_eq!(
            remote.modes.lock().unwrap()[..2],
            [PollMode::LongPoll, PollMode::Immediate]
        );
        assert_eq!(engine.cursor().as_deref(), Some("fresh"));

        // The abandoned long-poll answers late and must not move the cursor back.
        engine.stop_watching();
        release.send(changed("old")).unwrap();
        for _ in 0..4 {
            let _ = release.send(PollResponse::Unchanged);
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(engine.cursor().as_deref(), Some("fresh"));
    }

    #[test]
    fn watcher_follows_changes_until_backgrounded() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(FakeRemote::default());
        remote.push_poll(Ok(changed("c1")));
        remote.push_poll(Ok(PollResponse::Unchanged));
        remote.push_poll(Ok(changed("c2")));
        let engine = SyncEngine::new(remote.clone(), ContentCache::new(dir.path()), fast_config());

        engine.start_watching().unwrap();
        assert!(engine.session().is_watching);
        wait_until(|| engine.cursor().as_deref() == Some("c2"));
        assert!(engine.pending_reload());

        engine.background();
        assert!(!engine.session().is_watching);

        thread::sleep(Duration::from_millis(30));
        let polls = remote.poll_cursors.lock().unwrap().len();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(remote.poll_cursors.lock().unwrap().len(), polls);

        // Cursor and pending flag survive backgrounding.
        let session = engine.session();
        assert_eq!(session.cursor.as_deref(), Some("c2"));
        assert!(session.pending_reload);
    }

    #[test]
    fn foreground_catches_up_and_resumes_watching() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(FakeRemote::default());
        let engine = SyncEngine::new(remote.clone(), ContentCache::new(dir.path()), fast_config());

        engine.background();
        engine.start_watching().unwrap();
        assert!(!engine.session().is_watching);

        remote.push_poll(Ok(changed("abc")));
        assert_eq!(
            engine.foreground().unwrap(),
            SyncOutcome::Changed {
                cursor: "abc".to_owned()
            }
        );
        assert!(engine.session().is_watching);
        engine.shutdown().unwrap();
        assert!(!engine.session().is_watching);
    }

    #[test]
    fn foreground_without_watching_only_syncs() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(FakeRemote::default());
        let engine = SyncEngine::new(remote.clone(), ContentCache::new(dir.path()), fast_config());

        engine.background();
        assert_eq!(engine.foreground().unwrap(), SyncOutcome::Unchanged);
        assert!(!engine.session().is_watching);
        assert_eq!(remote.poll_cursors.lock().unwrap().len(), 1);
    }

    #[test]
    fn watcher_backs_off_on_errors() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(FakeRemote::default());
        for _ in 0..100 {
            remote.push_poll(Err(Error::Status {
                status: 500,
                body: Default::default(),
            }));
        }
        let engine = SyncEngine::new(remote.clone(), ContentCache::new(dir.path()), fast_config());

        engine.start_watching().unwrap();
        thread::sleep(Duration::from_millis(150));
        engine.shutdown().unwrap();

        let polls = remote.poll_cursors.lock().unwrap().len();
        assert!((2..=10).contains(&polls), "unexpected number of polls: {polls}");
        assert_eq!(engine.cursor(), None);
    }

    #[test]
    fn unauthorized_stops_the_watcher() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(FakeRemote::default());
        remote.push_poll(Err(Error::Unauthorized));
        let engine = SyncEngine::new(remote.clone(), ContentCache::new(dir.path()), fast_config());

        engine.start_watching().unwrap();
        wait_until(|| !engine.session().is_watching);
        assert_eq!(remote.poll_cursors.lock().unwrap().len(), 1);
    }

    #[test]
    fn reset_forgets_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(FakeRemote::default());
        remote.push_poll(Ok(changed("abc")));
        let engine = SyncEngine::new(remote.clone(), ContentCache::new(dir.path()), fast_config());

        engine.sync().unwrap();
        engine.reset().unwrap();

        assert_eq!(
            engine.session(),
            super::SyncSession {
                cursor: None,
                is_watching: false,
                pending_reload: false,
            }
        );
        engine.sync().unwrap();
        assert_eq!(remote.poll_cursors.lock().unwrap()[1], None);
    }
}
