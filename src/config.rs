use std::{path::PathBuf, time::Duration};

use crate::{
    reload_listener::NoopReloadListener, ChoiceSource, Clutch, RandomChoice, ReloadListener,
    Result, SyncConfig,
};

/// Configuration for [`Clutch`].
pub struct ClientConfig {
    pub(crate) app_key: String,
    pub(crate) rpc_url: String,
    pub(crate) tunnel_url: Option<String>,
    pub(crate) database_path: PathBuf,
    pub(crate) content_dir: PathBuf,
    pub(crate) installation_id: Option<String>,
    pub(crate) choice_source: Box<dyn ChoiceSource + Send>,
    pub(crate) sync_config: SyncConfig,
    pub(crate) reload_listener: Box<dyn ReloadListener + Send + Sync>,
    pub(crate) long_poll_timeout: Duration,
}

impl ClientConfig {
    /// Default URL for remote method calls and file downloads.
    pub const DEFAULT_RPC_URL: &'static str = "https://api.clutch.io/rpc/";
    /// Default URL of the tunnel endpoint used for content sync.
    pub const DEFAULT_TUNNEL_URL: &'static str = "https://poll.clutch.io/";
    /// Default location of the local database.
    pub const DEFAULT_DATABASE_PATH: &'static str = "clutch.sqlite";
    /// Default directory for synced content files.
    pub const DEFAULT_CONTENT_DIR: &'static str = "clutch-content";
    /// Default time the server may hold a long-poll before answering.
    pub const DEFAULT_LONG_POLL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

    /// Create a configuration talking to a self-hosted server at `rpc_url`. Content sync needs a
    /// [`tunnel_url`](ClientConfig::tunnel_url) as well.
    ///
    /// ```
    /// # use clutch::ClientConfig;
    /// ClientConfig::new("app-key", "https://clutch.example.com/rpc/");
    /// ```
    pub fn new(app_key: impl Into<String>, rpc_url: impl Into<String>) -> ClientConfig {
        ClientConfig {
            app_key: app_key.into(),
            rpc_url: rpc_url.into(),
            tunnel_url: None,
            database_path: PathBuf::from(ClientConfig::DEFAULT_DATABASE_PATH),
            content_dir: PathBuf::from(ClientConfig::DEFAULT_CONTENT_DIR),
            installation_id: None,
            choice_source: Box::new(RandomChoice::from_entropy()),
            sync_config: SyncConfig::default(),
            reload_listener: Box::new(NoopReloadListener),
            long_poll_timeout: ClientConfig::DEFAULT_LONG_POLL_TIMEOUT,
        }
    }

    /// Create a default configuration using the specified app key.
    ///
    /// ```
    /// # use clutch::ClientConfig;
    /// ClientConfig::from_app_key("app-key");
    /// ```
    pub fn from_app_key(app_key: impl Into<String>) -> ClientConfig {
        ClientConfig::new(app_key, ClientConfig::DEFAULT_RPC_URL)
            .tunnel_url(ClientConfig::DEFAULT_TUNNEL_URL)
    }

    /// Override URL for remote method calls. Clients should use the default setting in most
    /// cases.
    pub fn rpc_url(mut self, rpc_url: impl Into<String>) -> ClientConfig {
        self.rpc_url = rpc_url.into();
        self
    }

    /// Set URL of the tunnel endpoint.
    pub fn tunnel_url(mut self, tunnel_url: impl Into<String>) -> ClientConfig {
        self.tunnel_url = Some(tunnel_url.into());
        self
    }

    /// Set location of the local database. The file is created on first use.
    pub fn database_path(mut self, database_path: impl Into<PathBuf>) -> ClientConfig {
        self.database_path = database_path.into();
        self
    }

    /// Set directory where synced content files are stored.
    pub fn content_dir(mut self, content_dir: impl Into<PathBuf>) -> ClientConfig {
        self.content_dir = content_dir.into();
        self
    }

    /// Use `installation_id` to identify this installation instead of the generated one.
    pub fn installation_id(mut self, installation_id: impl Into<String>) -> ClientConfig {
        self.installation_id = Some(installation_id.into());
        self
    }

    /// Set source of variant choices for new assignments.
    pub fn choice_source(mut self, choice_source: impl ChoiceSource + Send + 'static) -> ClientConfig {
        self.choice_source = Box::new(choice_source);
        self
    }

    /// Set backoff and polling configuration for content sync.
    pub fn sync_config(mut self, sync_config: SyncConfig) -> ClientConfig {
        self.sync_config = sync_config;
        self
    }

    /// Set listener notified when synced content changes.
    ///
    /// ```
    /// # use clutch::ClientConfig;
    /// let config = ClientConfig::from_app_key("app-key").reload_listener(|change: &clutch::ContentChange| {
    ///   println!("content changed: {:?}", change.updated_files);
    /// });
    /// ```
    pub fn reload_listener(
        mut self,
        reload_listener: impl ReloadListener + Send + Sync + 'static,
    ) -> ClientConfig {
        self.reload_listener = Box::new(reload_listener);
        self
    }

    /// Set how long the server may hold a long-poll before answering.
    pub fn long_poll_timeout(mut self, long_poll_timeout: Duration) -> ClientConfig {
        self.long_poll_timeout = long_poll_timeout;
        self
    }

    /// Create a new [`Clutch`] client using the specified configuration.
    ///
    /// ```no_run
    /// # use clutch::{ClientConfig, Clutch};
    /// let client: Clutch = ClientConfig::from_app_key("app-key").to_client()?;
    /// # Ok::<(), clutch::Error>(())
    /// ```
    pub fn to_client(self) -> Result<Clutch> {
        Clutch::new(self)
    }
}
