//! Client SDK for Clutch: sticky A/B testing, event logging and over-the-air content sync.
//!
//! # Overview
//!
//! The SDK revolves around a [`Clutch`] client created from a [`ClientConfig`].
//!
//! A/B tests are run with [`Clutch::test`], which picks a variant for the installation the first
//! time the test is evaluated and keeps picking the same variant afterwards, across restarts.
//! Assignments, reached goals and test failures are recorded in a local SQLite database (see
//! [`Store`]) and uploaded to the server in batches.
//!
//! Content is kept up to date by a [`SyncEngine`], which tracks an opaque cursor and long-polls
//! the server for changes. Changed files are downloaded into a [`ContentCache`] and a
//! [`ReloadListener`] is notified. Call [`Clutch::background`] and [`Clutch::foreground`] when
//! the host application changes state.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Business operations (running a test, reaching a goal) never fail: storage and network errors
//! are logged and the operation degrades gracefully. Lower-level operations return errors, which
//! are valuable for debugging and usually indicate that developer's attention is needed.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages
//! under the `clutch` target. Consider integrating a `log`-compatible logger implementation for
//! better visibility into SDK operations.
//!
//! # Examples
//!
//! Examples can be found in the `demos` directory of the `clutch` crate repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod assignment;
mod backoff;
mod choice_source;
mod client;
mod config;
mod content;
mod error;
mod event;
mod reload_listener;
mod remote_client;
mod store;
mod sync;
mod worker;

pub use assignment::{FAILURE_MALFORMED_DATA, FAILURE_NO_VARIANTS, MAX_VARIANTS};
pub use choice_source::{ChoiceSource, RandomChoice};
pub use client::Clutch;
pub use config::ClientConfig;
pub use content::ContentCache;
pub use error::{Error, Result};
pub use event::{Assignment, CachedChoice, LogEntry, ACTION_CHOSEN, ACTION_FAILURE, ACTION_GOAL};
pub use reload_listener::{ContentChange, ReloadListener};
pub use remote_client::{
    ChangeDescriptor, HttpRemoteClient, HttpRemoteClientConfig, PollMode, PollResponse,
    RemoteClient, API_VERSION,
};
pub use store::Store;
pub use sync::{SyncConfig, SyncEngine, SyncOutcome, SyncSession};
