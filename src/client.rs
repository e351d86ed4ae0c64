use std::sync::Arc;

use serde_json::{Map, Value};

use crate::{
    assignment::Assignments,
    content::ContentCache,
    remote_client::{HttpRemoteClient, HttpRemoteClientConfig, RemoteClient},
    sync::{SyncEngine, SyncOutcome, SyncSession},
    worker::Worker,
    ClientConfig, Result, Store,
};

/// A client for Clutch.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// # Examples
/// ```no_run
/// # use clutch::{ClientConfig, Clutch};
/// let client = Clutch::new(ClientConfig::from_app_key("app-key"))?;
///
/// client.test("button_color", &[
///     &|| println!("red button"),
///     &|| println!("green button"),
///     &|| println!("blue button"),
/// ]);
/// client.goal_reached("button_color");
/// # Ok::<(), clutch::Error>(())
/// ```
pub struct Clutch {
    store: Arc<Store>,
    assignments: Arc<Assignments>,
    sync: Arc<SyncEngine>,
    worker: Worker,
}

impl Clutch {
    /// Create a new `Clutch` client talking to the server over HTTP.
    ///
    /// Fails if the configured URLs are invalid or the background worker cannot be started.
    pub fn new(config: ClientConfig) -> Result<Clutch> {
        let store = Arc::new(Store::open(&config.database_path));
        let installation_id = resolve_installation_id(&config, &store);

        let remote = HttpRemoteClient::new(HttpRemoteClientConfig {
            app_key: config.app_key.clone(),
            rpc_url: config.rpc_url.clone(),
            tunnel_url: config.tunnel_url.clone(),
            installation_id: installation_id.clone(),
            long_poll_timeout: config.long_poll_timeout,
        })?;

        Clutch::from_parts(config, store, installation_id, Arc::new(remote))
    }

    /// Create a new `Clutch` client using `remote` for all server communication. The URL
    /// settings of `config` are ignored.
    pub fn with_remote(
        config: ClientConfig,
        remote: Arc<dyn RemoteClient + Send + Sync>,
    ) -> Result<Clutch> {
        let store = Arc::new(Store::open(&config.database_path));
        let installation_id = resolve_installation_id(&config, &store);
        Clutch::from_parts(config, store, installation_id, remote)
    }

    fn from_parts(
        config: ClientConfig,
        store: Arc<Store>,
        installation_id: String,
        remote: Arc<dyn RemoteClient + Send + Sync>,
    ) -> Result<Clutch> {
        let worker = Worker::start()?;

        let assignments = Arc::new(Assignments::new(
            store.clone(),
            remote.clone(),
            config.choice_source,
            installation_id,
        ));

        let sync = Arc::new(SyncEngine::from_parts(
            remote,
            ContentCache::new(config.content_dir),
            config.sync_config,
            config.reload_listener,
        ));

        log::debug!(target: "clutch",
                    installation_id = assignments.installation_id();
                    "client created");

        Ok(Clutch {
            store,
            assignments,
            sync,
            worker,
        })
    }

    /// Run an A/B test: pick this installation's variant of `name` and invoke it.
    ///
    /// The first evaluation chooses a variant uniformly at random and records it; later
    /// evaluations (including after a restart) invoke the same variant. Returns the index of the
    /// invoked variant, or `None` if `variants` is empty.
    ///
    /// At most 10 variants are supported; extra variants are never invoked.
    pub fn test(&self, name: &str, variants: &[&dyn Fn()]) -> Option<usize> {
        let choice = self.assignments.choose(name, variants.len())?;
        let variant = variants.get(choice)?;
        variant();
        Some(choice)
    }

    /// Run a data-driven test: fetch the data for `name` on the background worker and pass it to
    /// `callback`.
    ///
    /// `callback` is invoked exactly once, from the worker thread. It receives an empty mapping if
    /// the server has no data for the test or could not be reached.
    pub fn test_with_data(
        &self,
        name: &str,
        callback: impl FnOnce(Map<String, Value>) + Send + 'static,
    ) {
        let assignments = self.assignments.clone();
        let name = name.to_owned();
        self.worker
            .execute(move || callback(assignments.fetch_test_data(&name)));
    }

    /// Fetch the data for the data-driven test `name`, blocking the calling thread.
    pub fn fetch_test_data(&self, name: &str) -> Map<String, Value> {
        self.assignments.fetch_test_data(name)
    }

    /// Record that the goal of test `name` was reached. Every call is recorded.
    pub fn goal_reached(&self, name: &str) {
        self.assignments.goal_reached(name);
    }

    /// Append an application event to the local event log.
    pub fn log_event(&self, action: &str, data: Option<Value>) {
        self.assignments.log_event(action, data);
    }

    /// Identifier of this installation.
    pub fn installation_id(&self) -> &str {
        self.assignments.installation_id()
    }

    /// Poll for content changes once, blocking until the request completes. Do not call this
    /// from a thread that must stay responsive.
    pub fn sync(&self) -> Result<SyncOutcome> {
        self.sync.sync()
    }

    /// Start watching for content changes from a background thread.
    pub fn start_watching(&self) -> Result<()> {
        self.sync.start_watching()
    }

    /// Stop watching for content changes.
    pub fn stop_watching(&self) {
        self.sync.stop_watching();
    }

    /// Call when the host application moves to the background. Suspends content sync and
    /// uploads the A/B log from the background worker.
    pub fn background(&self) {
        self.sync.background();

        let assignments = self.assignments.clone();
        self.worker.execute(move || {
            if let Err(err) = assignments.flush_ab_logs() {
                log::warn!(target: "clutch", "failed to upload A/B logs: {:?}", err);
            }
        });
    }

    /// Call when the host application returns to the foreground. Returns immediately; content
    /// is synced from the background worker, which then resumes watching if it was started.
    pub fn foreground(&self) {
        let generation = self.sync.enter_foreground();

        let sync = self.sync.clone();
        self.worker.execute(move || {
            if let Err(err) = sync.catch_up(generation) {
                log::warn!(target: "clutch", "failed to sync content on foreground: {:?}", err);
            }
        });
    }

    /// Whether synced content changed and should be reloaded.
    pub fn pending_reload(&self) -> bool {
        self.sync.pending_reload()
    }

    /// Acknowledge that changed content was reloaded. Returns whether a reload was pending.
    pub fn acknowledge_reload(&self) -> bool {
        self.sync.acknowledge_reload()
    }

    /// Snapshot of the content sync state.
    pub fn sync_session(&self) -> SyncSession {
        self.sync.session()
    }

    /// Upload the event log and delete the uploaded entries. Returns the number of uploaded
    /// entries.
    pub fn flush_logs(&self) -> Result<usize> {
        self.assignments.flush_logs()
    }

    /// Upload the A/B log and delete the uploaded entries. Returns the number of uploaded
    /// entries.
    pub fn flush_ab_logs(&self) -> Result<usize> {
        self.assignments.flush_ab_logs()
    }

    /// Local persistent store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Local copy of the synced content.
    pub fn content(&self) -> &ContentCache {
        self.sync.content()
    }

    /// Stop background threads, waiting for queued work to finish.
    pub fn shutdown(self) -> Result<()> {
        self.sync.shutdown()?;
        self.worker.shutdown()
    }
}

fn resolve_installation_id(config: &ClientConfig, store: &Store) -> String {
    if let Some(installation_id) = &config.installation_id {
        return installation_id.clone();
    }
    store.installation_id().unwrap_or_else(|err| {
        log::warn!(target: "clutch",
                   "failed to load installation id, using a temporary one: {:?}", err);
        format!("{:032x}", rand::random::<u128>())
    })
}
