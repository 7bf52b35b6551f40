use std::sync::Arc;
use tokio::sync::broadcast;
use url::Url;

use crate::error::StreamResult;
use crate::media::MediaSink;

/// Error class reported by a managed session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Playlist or segment fetch failed
    Network,
    /// The sink rejected decoded media
    Media,
    /// Anything else, e.g. an unparsable playlist
    Other,
}

/// Events raised by a managed decode session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ManifestParsed {
        /// Number of variants offered (1 for a media playlist)
        levels: usize,
        live: bool,
    },
    FragmentLoaded {
        sequence: u64,
        bytes: u64,
    },
    Error {
        kind: ErrorKind,
        fatal: bool,
        details: String,
    },
}

/// Factory for managed decode sessions
pub trait AdaptiveBackend: Send + Sync {
    /// Whether managed sessions can run in this environment
    fn is_supported(&self) -> bool;

    fn create_session(&self) -> StreamResult<Arc<dyn AdaptiveSession>>;
}

/// A managed decode session feeding one sink
///
/// All methods return immediately; loading happens on session-owned tasks
/// and progress is reported through [`subscribe`](Self::subscribe).
pub trait AdaptiveSession: Send + Sync {
    fn id(&self) -> u64;

    /// Bind the sink and make this session its current source
    fn attach_media(&self, sink: Arc<dyn MediaSink>);

    /// Start loading the manifest at `url`
    fn load_source(&self, url: Url);

    /// Restart loading after a network error
    fn start_load(&self);

    /// Try to recover from a media error; `false` if recovery is unavailable
    fn recover_media_error(&self) -> bool;

    /// Cumulative bytes of media fetched
    fn bytes_loaded(&self) -> u64;

    /// Stop all loading and detach from the sink. Idempotent.
    fn destroy(&self);

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
}
