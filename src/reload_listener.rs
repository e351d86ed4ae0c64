/// Describes content that changed on the server and has been downloaded locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChange {
    /// Cursor after the change.
    pub cursor: String,
    /// Files that were downloaded because their version changed.
    pub updated_files: Vec<String>,
}

/// A trait for receiving notifications that synced content changed and should be reloaded.
pub trait ReloadListener {
    /// Called after the cursor advanced and the pending-reload flag was set.
    ///
    /// # Notes
    ///
    /// This method is called from whichever thread completed the sync, after the request has
    /// been released. It should not block.
    fn content_changed(&self, change: &ContentChange);
}

pub(crate) struct NoopReloadListener;
impl ReloadListener for NoopReloadListener {
    fn content_changed(&self, _change: &ContentChange) {}
}

impl<T: Fn(&ContentChange)> ReloadListener for T {
    fn content_changed(&self, change: &ContentChange) {
        self(change);
    }
}
