//! Polling directory watcher with debounce.
//!
//! A [`DirectoryWatcher`] fingerprints a directory on every tick.  A change
//! is acted upon only once the directory has looked the same for a full
//! interval, and only when that state differs from the one last handed to
//! the [`CertHandler`].  Mounted secret volumes swap their contents through
//! symlink flips, so a half-written rotation is never loaded.
//!
//! ```text
//! tick ─▶ observe(dir) ─▶ same as previous tick? ─▶ differs from last handled?
//!                                                        │
//!                                         loader(dir) ─▶ handler.on_stable_update
//! ```

use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{Error, Result};

/// Default polling interval for watched certificate directories.
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Receives the outcome of watched-directory changes.
pub trait CertHandler<T>: Send + Sync + 'static {
    /// Called with the loader result once a change has stabilised.
    fn on_stable_update(&self, result: Result<Option<T>>);

    /// Called when the directory could not be inspected.  A missing
    /// directory is a state, not an error, and never reaches this hook.
    fn on_watch_error(&self, err: Error);
}

impl<T, H: CertHandler<T> + ?Sized> CertHandler<T> for Arc<H> {
    fn on_stable_update(&self, result: Result<Option<T>>) {
        (**self).on_stable_update(result);
    }

    fn on_watch_error(&self, err: Error) {
        (**self).on_watch_error(err);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DirState {
    Missing,
    Present(String),
}

/// Polls one directory and feeds stable changes through a loader to a handler.
pub struct DirectoryWatcher<T, L, H> {
    dir: PathBuf,
    interval: Duration,
    loader: L,
    handler: H,
    last_observed: Option<DirState>,
    last_handled: Option<DirState>,
    _loaded: PhantomData<fn() -> T>,
}

impl<T, L, H> DirectoryWatcher<T, L, H>
where
    T: 'static,
    L: Fn(&Path) -> Result<Option<T>> + Send + 'static,
    H: CertHandler<T>,
{
    /// Create a watcher; nothing is read until [`Self::load_now`] or a tick.
    pub fn new(dir: impl Into<PathBuf>, interval: Duration, loader: L, handler: H) -> Self {
        Self {
            dir: dir.into(),
            interval,
            loader,
            handler,
            last_observed: None,
            last_handled: None,
            _loaded: PhantomData,
        }
    }

    /// Watched directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the current contents immediately, without waiting for a stable
    /// observation, and mark them handled.
    pub fn load_now(&mut self) {
        match observe(&self.dir) {
            Ok(state) => {
                self.last_observed = Some(state.clone());
                self.last_handled = Some(state);
                self.handler.on_stable_update((self.loader)(&self.dir));
            }
            Err(e) => self.handler.on_watch_error(e),
        }
    }

    /// Run one polling step.  Returns `true` when the handler was invoked
    /// with a new stable state.
    pub fn tick(&mut self) -> bool {
        let state = match observe(&self.dir) {
            Ok(state) => state,
            Err(e) => {
                self.handler.on_watch_error(e);
                return false;
            }
        };

        let stable = self.last_observed.as_ref() == Some(&state);
        self.last_observed = Some(state.clone());
        if !stable || self.last_handled.as_ref() == Some(&state) {
            return false;
        }

        debug!(dir = %self.dir.display(), "Directory contents changed");
        self.last_handled = Some(state);
        self.handler.on_stable_update((self.loader)(&self.dir));
        true
    }

    /// Poll on the configured interval until `token` is cancelled.
    ///
    /// Each tick, loader included, runs on the blocking pool so a slow mount
    /// never stalls the runtime's worker threads.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let dir = self.dir.clone();
            info!(dir = %dir.display(), interval = ?self.interval, "Watching directory");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval completes immediately.
            ticker.tick().await;
            let mut watcher = self;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let step = tokio::task::spawn_blocking(move || {
                            watcher.tick();
                            watcher
                        });
                        match step.await {
                            Ok(w) => watcher = w,
                            Err(e) => {
                                error!(dir = %dir.display(), error = %e, "Directory watcher tick failed, stopping");
                                break;
                            }
                        }
                    }
                    () = token.cancelled() => {
                        debug!(dir = %dir.display(), "Directory watcher shutting down");
                        break;
                    }
                }
            }
        })
    }
}

/// Hash file names and contents of the directory's regular files.
fn observe(dir: &Path) -> Result<DirState> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(DirState::Missing),
        Err(e) => {
            return Err(Error::Io(io::Error::new(
                e.kind(),
                format!("cannot read directory '{}': {e}", dir.display()),
            )));
        }
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("..") {
            continue;
        }
        if fs::metadata(entry.path())?.is_file() {
            files.push((name, entry.path()));
        }
    }
    files.sort();

    let mut hasher = Sha256::new();
    for (name, path) in files {
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(fs::read(path)?);
        hasher.update([0]);
    }
    Ok(DirState::Present(hex::encode(hasher.finalize())))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
