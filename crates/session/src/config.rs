use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::error::{Result, SessionError};

pub const DEFAULT_INPUT_STREAM: &str = "input_video";
pub const DEFAULT_PREVIEW_STREAM: &str = "output_video";

/// Stream names and queueing policy shared by every task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub input_stream: String,
    pub preview_stream: String,
    /// Bound on each poller queue. `None` keeps every packet until polled.
    pub poller_capacity: Option<usize>,
    /// Wait applied by `OutputPoller::get_output`. `None` blocks.
    pub poll_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            input_stream: DEFAULT_INPUT_STREAM.to_owned(),
            preview_stream: DEFAULT_PREVIEW_STREAM.to_owned(),
            poller_capacity: None,
            poll_timeout: None,
        }
    }
}

impl SessionConfig {
    pub fn with_input_stream(mut self, name: impl Into<String>) -> Self {
        self.input_stream = name.into();
        self
    }

    pub fn with_preview_stream(mut self, name: impl Into<String>) -> Self {
        self.preview_stream = name.into();
        self
    }

    pub fn with_poller_capacity(mut self, capacity: usize) -> Self {
        self.poller_capacity = Some(capacity.max(1));
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }
}

/// Where a graph description comes from.
#[derive(Clone, PartialEq, Eq)]
pub enum GraphSource {
    Text(String),
    File(PathBuf),
}

impl GraphSource {
    pub fn text(text: impl Into<String>) -> Self {
        GraphSource::Text(text.into())
    }

    pub fn file(path: impl AsRef<Path>) -> Self {
        GraphSource::File(path.as_ref().to_path_buf())
    }

    pub(crate) fn load(&self) -> Result<String> {
        match self {
            GraphSource::Text(text) => Ok(text.clone()),
            GraphSource::File(path) => {
                std::fs::read_to_string(path).map_err(|source| SessionError::GraphFile {
                    path: path.display().to_string(),
                    source,
                })
            }
        }
    }
}

impl fmt::Debug for GraphSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphSource::Text(text) => write!(f, "Text({} bytes)", text.len()),
            GraphSource::File(path) => write!(f, "File({})", path.display()),
        }
    }
}

impl From<&str> for GraphSource {
    fn from(text: &str) -> Self {
        GraphSource::text(text)
    }
}

impl From<String> for GraphSource {
    fn from(text: String) -> Self {
        GraphSource::Text(text)
    }
}

impl From<&Path> for GraphSource {
    fn from(path: &Path) -> Self {
        GraphSource::file(path)
    }
}

impl From<PathBuf> for GraphSource {
    fn from(path: PathBuf) -> Self {
        GraphSource::File(path)
    }
}
