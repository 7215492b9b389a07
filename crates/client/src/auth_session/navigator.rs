//! Where the user is, and how the session moves them.

use std::sync::Arc;

use parking_lot::Mutex;

/// Routing hooks used by the session authority.
pub trait Navigator: Send + Sync + 'static {
    fn current_path(&self) -> String;

    /// Client-side navigation; application state survives.
    fn navigate(&self, path: &str);

    /// Full reload at `path`; no client state survives.
    fn hard_redirect(&self, path: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visit {
    Navigate(String),
    HardRedirect(String),
}

/// In-memory location with a record of every move.
#[derive(Debug, Clone)]
pub struct MemoryNavigator {
    inner: Arc<Mutex<Location>>,
}

#[derive(Debug)]
struct Location {
    path: String,
    history: Vec<Visit>,
}

impl MemoryNavigator {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Location {
                path: path.into(),
                history: Vec::new(),
            })),
        }
    }

    /// Move without recording a visit, as if the user followed a link.
    pub fn set_path(&self, path: impl Into<String>) {
        self.inner.lock().path = path.into();
    }

    pub fn history(&self) -> Vec<Visit> {
        self.inner.lock().history.clone()
    }
}

impl Default for MemoryNavigator {
    fn default() -> Self {
        Self::new("/")
    }
}

impl Navigator for MemoryNavigator {
    fn current_path(&self) -> String {
        self.inner.lock().path.clone()
    }

    fn navigate(&self, path: &str) {
        let mut location = self.inner.lock();
        location.path = path.to_string();
        location.history.push(Visit::Navigate(path.to_string()));
    }

    fn hard_redirect(&self, path: &str) {
        let mut location = self.inner.lock();
        location.path = path.to_string();
        location.history.push(Visit::HardRedirect(path.to_string()));
    }
}
