//! Session resource registry
//!
//! Owns every media stream, timer and peer connection a session creates and
//! releases them all through a single teardown call. Teardown works from any
//! partially-initialized state and is idempotent: handles are moved out of the
//! registry before they are released, so a second call finds nothing to do.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::media::{MediaStream, PeerConnection, Timer};

/// Which stream a handle belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamSlot {
    /// Shared screen or captured file
    Screen,
    /// Microphone for voice chat
    Voice,
    LocalVideo,
    LocalAudio,
    RemoteVideo,
    RemoteAudio,
}

/// Which periodic activity a timer drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerSlot {
    Sync,
    Rtt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Side {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    Data,
    Video,
    Audio,
}

/// Which peer connection a handle is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionSlot {
    pub side: Side,
    pub channel: Channel,
}

impl ConnectionSlot {
    pub const fn new(side: Side, channel: Channel) -> Self {
        Self { side, channel }
    }
}

impl fmt::Display for ConnectionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.side, self.channel)
    }
}

/// Callback that revokes a transient media URL
pub type RevokeUrl = Box<dyn FnOnce(&str) + Send>;

/// A transient URL pointing at local media (e.g. a `blob:` object URL)
pub struct MediaUrl {
    pub url: String,
    pub revoke: RevokeUrl,
}

/// A handle handed to the registry
pub enum Resource {
    Stream(StreamSlot, Arc<dyn MediaStream>),
    Timer(TimerSlot, Box<dyn Timer>),
    Connection(ConnectionSlot, Arc<dyn PeerConnection>),
    MediaUrl(MediaUrl),
}

impl Resource {
    /// Wrap an object URL together with the function that revokes it
    pub fn media_url(url: impl Into<String>, revoke: impl FnOnce(&str) + Send + 'static) -> Self {
        Resource::MediaUrl(MediaUrl {
            url: url.into(),
            revoke: Box::new(revoke),
        })
    }
}

/// What a teardown actually released
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub tracks_stopped: usize,
    pub timers_cancelled: usize,
    pub connections_closed: usize,
    /// Connections whose close failed (logged, not propagated)
    pub close_failures: usize,
    pub media_url_released: bool,
}

impl TeardownReport {
    /// Whether nothing was released
    pub fn is_empty(&self) -> bool {
        *self == TeardownReport::default()
    }
}

#[derive(Default)]
struct Slots {
    streams: BTreeMap<StreamSlot, Arc<dyn MediaStream>>,
    timers: BTreeMap<TimerSlot, Box<dyn Timer>>,
    connections: BTreeMap<ConnectionSlot, Arc<dyn PeerConnection>>,
    media_url: Option<MediaUrl>,
}

impl Slots {
    fn is_empty(&self) -> bool {
        self.streams.is_empty()
            && self.timers.is_empty()
            && self.connections.is_empty()
            && self.media_url.is_none()
    }
}

/// Owner of all session resources
#[derive(Default)]
pub struct ResourceRegistry {
    slots: Mutex<Slots>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a handle. A handle already in the same slot is released now.
    pub fn register(&self, resource: Resource) {
        match resource {
            Resource::Stream(slot, stream) => {
                let previous = self.slots.lock().streams.insert(slot, Arc::clone(&stream));
                if let Some(previous) = previous.filter(|p| !same_object(p, &stream)) {
                    debug!("Replacing {:?} stream", slot);
                    let mut keep: HashSet<String> =
                        stream.tracks().iter().map(|t| t.id()).collect();
                    stop_tracks(previous.as_ref(), &mut keep);
                }
            }
            Resource::Timer(slot, timer) => {
                let previous = self.slots.lock().timers.insert(slot, timer);
                if let Some(previous) = previous {
                    debug!("Replacing {:?} timer", slot);
                    previous.cancel();
                }
            }
            Resource::Connection(slot, connection) => {
                let previous = self
                    .slots
                    .lock()
                    .connections
                    .insert(slot, Arc::clone(&connection));
                if let Some(previous) = previous.filter(|p| !same_object(p, &connection)) {
                    debug!("Replacing {} connection", slot);
                    close_connection(slot, previous.as_ref());
                }
            }
            Resource::MediaUrl(media_url) => {
                let previous = self.slots.lock().media_url.replace(media_url);
                if let Some(previous) = previous {
                    release_media_url(previous);
                }
            }
        }
    }

    pub fn has_timer(&self, slot: TimerSlot) -> bool {
        self.slots.lock().timers.contains_key(&slot)
    }

    pub fn has_connection(&self, slot: ConnectionSlot) -> bool {
        self.slots.lock().connections.contains_key(&slot)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Release everything, in order: tracks, timers, connections, media URL.
    ///
    /// Safe to call at any time and any number of times; only the first call
    /// after a registration releases anything.
    pub fn teardown_all(&self) -> TeardownReport {
        // Take everything out first so callbacks run without the lock held
        let slots = std::mem::take(&mut *self.slots.lock());
        let mut report = TeardownReport::default();

        if slots.is_empty() {
            debug!("Teardown: nothing registered");
            return report;
        }

        // 1. Stop all tracks
        let mut stopped = HashSet::new();
        for stream in slots.streams.values() {
            report.tracks_stopped += stop_tracks(stream.as_ref(), &mut stopped);
        }

        // 2. Cancel timers
        for (slot, timer) in &slots.timers {
            debug!("Cancelling {:?} timer", slot);
            timer.cancel();
            report.timers_cancelled += 1;
        }

        // 3. Close peer connections
        let mut closed = HashSet::new();
        for (slot, connection) in &slots.connections {
            if !closed.insert(Arc::as_ptr(connection) as *const ()) {
                continue;
            }
            match close_connection(*slot, connection.as_ref()) {
                CloseOutcome::Closed => report.connections_closed += 1,
                CloseOutcome::AlreadyClosed => {}
                CloseOutcome::Failed => report.close_failures += 1,
            }
        }

        // 4. Release the transient media URL
        if let Some(media_url) = slots.media_url {
            report.media_url_released = release_media_url(media_url);
        }

        info!(
            "Session resources released: {} tracks, {} timers, {} connections ({} failed)",
            report.tracks_stopped,
            report.timers_cancelled,
            report.connections_closed,
            report.close_failures
        );

        report
    }
}

fn same_object<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Stop live tracks not in `stopped`, recording them. Returns how many were stopped.
fn stop_tracks(stream: &dyn MediaStream, stopped: &mut HashSet<String>) -> usize {
    let mut count = 0;
    for track in stream.tracks() {
        if !stopped.insert(track.id()) || !track.is_live() {
            continue;
        }
        track.stop();
        count += 1;
    }
    count
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseOutcome {
    Closed,
    AlreadyClosed,
    /// The close call errored; already logged
    Failed,
}

fn close_connection(slot: ConnectionSlot, connection: &dyn PeerConnection) -> CloseOutcome {
    if connection.is_closed() {
        debug!("{} connection {} already closed", slot, connection.label());
        return CloseOutcome::AlreadyClosed;
    }
    match connection.close() {
        Ok(()) => CloseOutcome::Closed,
        Err(e) => {
            error!("Error closing {} connection {}: {}", slot, connection.label(), e);
            CloseOutcome::Failed
        }
    }
}

/// Revoke object URLs; other URLs need no release. Returns whether it revoked.
fn release_media_url(media_url: MediaUrl) -> bool {
    let MediaUrl { url, revoke } = media_url;
    if url.starts_with("blob:") {
        revoke(&url);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{ConnectionError, MediaKind, MediaTrack};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeTrack {
        id: String,
        live: AtomicBool,
        stops: AtomicUsize,
    }

    impl FakeTrack {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                live: AtomicBool::new(true),
                stops: AtomicUsize::new(0),
            })
        }

        fn stops(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }
    }

    impl MediaTrack for FakeTrack {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn kind(&self) -> MediaKind {
            MediaKind::Video
        }

        fn is_live(&self) -> bool {
            self.live.load(Ordering::SeqCst)
        }

        fn stop(&self) {
            self.live.store(false, Ordering::SeqCst);
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeStream(Vec<Arc<FakeTrack>>);

    impl MediaStream for FakeStream {
        fn tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
            self.0
                .iter()
                .map(|t| Arc::clone(t) as Arc<dyn MediaTrack>)
                .collect()
        }
    }

    #[derive(Default)]
    struct FakeTimer {
        cancels: Arc<AtomicUsize>,
    }

    impl Timer for FakeTimer {
        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeConnection {
        closed: AtomicBool,
        closes: AtomicUsize,
        fail: bool,
    }

    impl FakeConnection {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                closed: AtomicBool::new(false),
                closes: AtomicUsize::new(0),
                fail,
            })
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    impl PeerConnection for FakeConnection {
        fn label(&self) -> String {
            "fake".to_string()
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn close(&self) -> Result<(), ConnectionError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ConnectionError::Close("peer destroyed twice".to_string()));
            }
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    const LOCAL_DATA: ConnectionSlot = ConnectionSlot::new(Side::Local, Channel::Data);
    const LOCAL_VIDEO: ConnectionSlot = ConnectionSlot::new(Side::Local, Channel::Video);
    const REMOTE_DATA: ConnectionSlot = ConnectionSlot::new(Side::Remote, Channel::Data);
    const REMOTE_AUDIO: ConnectionSlot = ConnectionSlot::new(Side::Remote, Channel::Audio);

    #[test]
    fn test_teardown_empty_registry() {
        let registry = ResourceRegistry::new();
        assert!(registry.teardown_all().is_empty());
        assert!(registry.teardown_all().is_empty());
    }

    #[test]
    fn test_full_teardown() {
        let registry = ResourceRegistry::new();

        let screen = FakeTrack::new("screen-video");
        let mic = FakeTrack::new("mic");
        let ended = FakeTrack::new("ended");
        ended.live.store(false, Ordering::SeqCst);

        // The screen stream is also registered as the local video stream
        let shared: Arc<dyn MediaStream> = Arc::new(FakeStream(vec![screen.clone()]));
        registry.register(Resource::Stream(StreamSlot::Screen, Arc::clone(&shared)));
        registry.register(Resource::Stream(StreamSlot::LocalVideo, shared));
        registry.register(Resource::Stream(
            StreamSlot::Voice,
            Arc::new(FakeStream(vec![mic.clone(), ended.clone()])),
        ));

        let cancels = Arc::new(AtomicUsize::new(0));
        registry.register(Resource::Timer(
            TimerSlot::Sync,
            Box::new(FakeTimer {
                cancels: Arc::clone(&cancels),
            }),
        ));
        registry.register(Resource::Timer(
            TimerSlot::Rtt,
            Box::new(FakeTimer {
                cancels: Arc::clone(&cancels),
            }),
        ));

        let data = FakeConnection::new(false);
        let failing = FakeConnection::new(true);
        let already_closed = FakeConnection::new(false);
        already_closed.closed.store(true, Ordering::SeqCst);
        registry.register(Resource::Connection(LOCAL_DATA, data.clone()));
        registry.register(Resource::Connection(LOCAL_VIDEO, failing.clone()));
        registry.register(Resource::Connection(REMOTE_DATA, already_closed.clone()));

        let revoked = Arc::new(AtomicUsize::new(0));
        let revoked_clone = Arc::clone(&revoked);
        registry.register(Resource::media_url("blob:http://localhost/1f2e", move |url| {
            assert!(url.starts_with("blob:"));
            revoked_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let report = registry.teardown_all();
        assert_eq!(
            report,
            TeardownReport {
                tracks_stopped: 2,
                timers_cancelled: 2,
                connections_closed: 1,
                close_failures: 1,
                media_url_released: true,
            }
        );
        assert_eq!(screen.stops(), 1);
        assert_eq!(mic.stops(), 1);
        assert_eq!(ended.stops(), 0);
        assert_eq!(cancels.load(Ordering::SeqCst), 2);
        assert_eq!(data.closes(), 1);
        assert_eq!(failing.closes(), 1);
        assert_eq!(already_closed.closes(), 0);
        assert_eq!(revoked.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());

        // Second teardown releases nothing and touches nothing
        assert!(registry.teardown_all().is_empty());
        assert_eq!(screen.stops(), 1);
        assert_eq!(cancels.load(Ordering::SeqCst), 2);
        assert_eq!(data.closes(), 1);
        assert_eq!(failing.closes(), 1);
        assert_eq!(revoked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_partial_state_teardown() {
        let registry = ResourceRegistry::new();
        let audio = FakeConnection::new(false);
        registry.register(Resource::Connection(REMOTE_AUDIO, audio.clone()));

        let report = registry.teardown_all();
        assert_eq!(report.connections_closed, 1);
        assert_eq!(report.tracks_stopped, 0);
        assert!(!report.media_url_released);
    }

    #[test]
    fn test_same_connection_in_two_slots_closed_once() {
        let registry = ResourceRegistry::new();
        let conn = FakeConnection::new(false);
        registry.register(Resource::Connection(LOCAL_DATA, conn.clone()));
        registry.register(Resource::Connection(REMOTE_DATA, conn.clone()));

        assert_eq!(registry.teardown_all().connections_closed, 1);
        assert_eq!(conn.closes(), 1);
    }

    #[test]
    fn test_close_outcomes() {
        let open = FakeConnection::new(false);
        assert_eq!(close_connection(LOCAL_DATA, open.as_ref()), CloseOutcome::Closed);
        assert_eq!(
            close_connection(LOCAL_DATA, open.as_ref()),
            CloseOutcome::AlreadyClosed
        );
        assert_eq!(open.closes(), 1);

        let broken = FakeConnection::new(true);
        assert_eq!(close_connection(REMOTE_DATA, broken.as_ref()), CloseOutcome::Failed);

        // Each outcome lands in its own report counter
        let registry = ResourceRegistry::new();
        let closed_already = FakeConnection::new(false);
        closed_already.closed.store(true, Ordering::SeqCst);
        registry.register(Resource::Connection(LOCAL_DATA, FakeConnection::new(false)));
        registry.register(Resource::Connection(LOCAL_VIDEO, closed_already));
        registry.register(Resource::Connection(REMOTE_DATA, FakeConnection::new(true)));
        let report = registry.teardown_all();
        assert_eq!(report.connections_closed, 1);
        assert_eq!(report.close_failures, 1);
    }

    #[test]
    fn test_non_blob_url_is_not_revoked() {
        let registry = ResourceRegistry::new();
        let revoked = Arc::new(AtomicBool::new(false));
        let revoked_clone = Arc::clone(&revoked);
        registry.register(Resource::media_url("https://cdn.test/movie.mp4", move |_| {
            revoked_clone.store(true, Ordering::SeqCst);
        }));

        assert!(!registry.teardown_all().media_url_released);
        assert!(!revoked.load(Ordering::SeqCst));
    }

    #[test]
    fn test_replacing_releases_displaced_handles() {
        let registry = ResourceRegistry::new();

        let first_cancels = Arc::new(AtomicUsize::new(0));
        registry.register(Resource::Timer(
            TimerSlot::Rtt,
            Box::new(FakeTimer {
                cancels: Arc::clone(&first_cancels),
            }),
        ));
        registry.register(Resource::Timer(TimerSlot::Rtt, Box::new(FakeTimer::default())));
        assert_eq!(first_cancels.load(Ordering::SeqCst), 1);
        assert!(registry.has_timer(TimerSlot::Rtt));

        let kept = FakeTrack::new("kept");
        let dropped = FakeTrack::new("dropped");
        registry.register(Resource::Stream(
            StreamSlot::LocalAudio,
            Arc::new(FakeStream(vec![kept.clone(), dropped.clone()])),
        ));
        registry.register(Resource::Stream(
            StreamSlot::LocalAudio,
            Arc::new(FakeStream(vec![kept.clone()])),
        ));
        assert_eq!(dropped.stops(), 1);
        assert_eq!(kept.stops(), 0);

        let old = FakeConnection::new(false);
        registry.register(Resource::Connection(LOCAL_DATA, old.clone()));
        registry.register(Resource::Connection(LOCAL_DATA, old.clone()));
        assert_eq!(old.closes(), 0);
        registry.register(Resource::Connection(LOCAL_DATA, FakeConnection::new(false)));
        assert_eq!(old.closes(), 1);
        assert!(registry.has_connection(LOCAL_DATA));
    }
}
