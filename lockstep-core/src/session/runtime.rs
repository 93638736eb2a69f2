//! Session implementation
//!
//! A session is one worker task that owns the [`SyncController`] and consumes a
//! single event queue. Inbound messages, caller commands and ticker fires are
//! all events, so they are handled strictly one at a time. The tickers are
//! plain interval tasks that only post events; they are registered with the
//! [`ResourceRegistry`] so teardown cancels them with everything else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::media::{MediaTrack, PeerConnection, Playback};
use crate::network::{PeerId, Transport};
use crate::quality::{self, CaptureConstraints, QualityPreset};
use crate::registry::{Resource, ResourceRegistry, TeardownReport, TimerSlot};
use crate::sync::{SyncController, SyncRole, SyncState};

use super::types::*;

/// Everything the worker reacts to
#[derive(Debug)]
enum Event {
    Inbound(String),
    SyncTick,
    RttTick,
    Play,
    Pause,
    Seek(f64),
    SetOrigin(String),
    SetVoice(bool),
    SetRestricted(bool),
    Teardown,
}

/// A synchronized viewing session with one peer
///
/// Must be started inside a tokio runtime. Share it behind an `Arc` to call it
/// from callbacks. Dropping the session tears it down.
pub struct Session {
    role: SyncRole,
    peer_id: PeerId,
    config: SyncConfig,
    events: mpsc::UnboundedSender<Event>,
    registry: Arc<ResourceRegistry>,
    status: Arc<Mutex<SyncStatus>>,
    torn_down: Arc<AtomicBool>,
}

impl Session {
    /// Start a session on an attached transport.
    ///
    /// A guest greets the host right away. The RTT ticker starts immediately;
    /// the sync ticker starts once the greeting has been exchanged.
    pub fn start(
        role: SyncRole,
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        player: Arc<dyn Playback>,
        callback: Option<Arc<dyn SessionCallback>>,
        registry: Arc<ResourceRegistry>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SessionError::NoRuntime)?;

        let peer_id = PeerId::random();
        info!("Starting {} session as {}", role, peer_id);

        let torn_down = Arc::new(AtomicBool::new(false));
        let mut controller = SyncController::new(
            role,
            config.clone(),
            peer_id.as_str(),
            transport,
            player,
            callback,
        )
        .with_halt_flag(Arc::clone(&torn_down));
        controller.attach(current_time_ms());

        let status = Arc::new(Mutex::new(controller.status()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let rtt_ticker = spawn_ticker(&runtime, events_tx.clone(), config.rtt_interval(), || {
            Event::RttTick
        });
        registry.register(Resource::Timer(TimerSlot::Rtt, Box::new(rtt_ticker)));

        let worker = Worker {
            controller,
            runtime: runtime.clone(),
            events: events_tx.clone(),
            registry: Arc::clone(&registry),
            status: Arc::clone(&status),
            torn_down: Arc::clone(&torn_down),
            sync_interval: config.sync_interval(),
            sync_armed: false,
        };
        runtime.spawn(worker.run(events_rx));

        Ok(Self {
            role,
            peer_id,
            config,
            events: events_tx,
            registry,
            status,
            torn_down,
        })
    }

    pub fn role(&self) -> SyncRole {
        self.role
    }

    /// Our identifier, to be shared with the other peer
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Hand over a text message received from the peer. Ignored after teardown.
    pub fn deliver(&self, text: impl Into<String>) {
        if self.is_torn_down() {
            return;
        }
        let _ = self.events.send(Event::Inbound(text.into()));
    }

    /// Deliver every message from `inbound` until it ends or the session is torn down
    pub async fn pump<S>(&self, mut inbound: S)
    where
        S: Stream<Item = String> + Unpin,
    {
        while let Some(text) = inbound.next().await {
            if self.is_torn_down() {
                debug!("Session torn down, stopping inbound pump");
                break;
            }
            self.deliver(text);
        }
    }

    /// Host: start playback locally and on the guest
    pub fn play(&self) -> Result<(), SessionError> {
        self.post_host(Event::Play)
    }

    /// Host: pause locally and on the guest
    pub fn pause(&self) -> Result<(), SessionError> {
        self.post_host(Event::Pause)
    }

    /// Host: jump to `position_seconds` locally and on the guest
    pub fn seek(&self, position_seconds: f64) -> Result<(), SessionError> {
        if !position_seconds.is_finite() {
            return Err(SessionError::InvalidConfig(format!(
                "seek position must be finite, got {}",
                position_seconds
            )));
        }
        self.post_host(Event::Seek(position_seconds))
    }

    /// Host: announce the media being played
    pub fn set_origin(&self, origin: impl Into<String>) -> Result<(), SessionError> {
        self.post_host(Event::SetOrigin(origin.into()))
    }

    /// Tell the peer whether our microphone is on
    pub fn set_voice_enabled(&self, enabled: bool) -> Result<(), SessionError> {
        self.post(Event::SetVoice(enabled))
    }

    /// Suppress playback corrections while the local player cannot take them
    /// (e.g. autoplay blocked). Lifting it re-applies the host's play state.
    pub fn set_restricted(&self, restricted: bool) -> Result<(), SessionError> {
        self.post(Event::SetRestricted(restricted))
    }

    /// Latest status snapshot
    pub fn status(&self) -> SyncStatus {
        let mut status = self.status.lock().clone();
        if self.is_torn_down() {
            status.state = SyncState::TornDown;
        }
        status
    }

    pub fn quality_preset(&self) -> QualityPreset {
        self.config.preset
    }

    /// Capture constraints for the configured preset
    pub fn capture_constraints(&self) -> CaptureConstraints {
        quality::constraints_for(self.config.preset)
    }

    /// Cap the video encoder of `connection` to the configured preset
    pub fn apply_bitrate_cap(&self, connection: &dyn PeerConnection) -> bool {
        quality::apply_bitrate_cap(connection, self.config.preset)
    }

    /// Constrain a capture track to the configured preset
    pub fn apply_track_constraints(&self, track: &dyn MediaTrack) -> bool {
        quality::apply_track_constraints(track, self.config.preset)
    }

    /// Tear the session down and release every registered resource.
    ///
    /// Safe to call from anywhere, including session callbacks, and any number
    /// of times; only the first call releases anything.
    pub fn teardown(&self) -> TeardownReport {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            debug!("Session {} already torn down", self.peer_id);
            return TeardownReport::default();
        }

        info!("Tearing down session {}", self.peer_id);
        let report = self.registry.teardown_all();
        // Wake the worker so it can finish
        let _ = self.events.send(Event::Teardown);
        report
    }

    fn post(&self, event: Event) -> Result<(), SessionError> {
        if self.is_torn_down() {
            return Err(SessionError::TornDown);
        }
        self.events.send(event).map_err(|_| SessionError::TornDown)
    }

    fn post_host(&self, event: Event) -> Result<(), SessionError> {
        if self.is_torn_down() {
            return Err(SessionError::TornDown);
        }
        if !self.role.is_host() {
            return Err(SessionError::NotHost);
        }
        self.post(event)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Spawn a task that posts `event()` every `period`, first after one period
fn spawn_ticker(
    runtime: &tokio::runtime::Handle,
    events: mpsc::UnboundedSender<Event>,
    period: Duration,
    event: fn() -> Event,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if events.send(event()).is_err() {
                break;
            }
        }
    })
}

struct Worker {
    controller: SyncController,
    runtime: tokio::runtime::Handle,
    events: mpsc::UnboundedSender<Event>,
    registry: Arc<ResourceRegistry>,
    status: Arc<Mutex<SyncStatus>>,
    torn_down: Arc<AtomicBool>,
    sync_interval: Duration,
    sync_armed: bool,
}

impl Worker {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        debug!("Session worker started");

        while let Some(event) = events.recv().await {
            if self.torn_down.load(Ordering::SeqCst) || matches!(event, Event::Teardown) {
                break;
            }
            self.handle(event);
            self.arm_sync_ticker();
            self.publish();
        }

        self.controller.teardown();
        self.publish();
        debug!("Session worker stopped");
    }

    fn handle(&mut self, event: Event) {
        let now = current_time_ms();
        let result = match event {
            Event::Inbound(text) => {
                self.controller.handle_text(&text, now);
                Ok(())
            }
            Event::SyncTick => {
                self.controller.sync_tick(now);
                Ok(())
            }
            Event::RttTick => {
                self.controller.rtt_tick(now);
                Ok(())
            }
            Event::Play => self.controller.play(),
            Event::Pause => self.controller.pause(),
            Event::Seek(position) => self.controller.seek(position),
            Event::SetOrigin(origin) => self.controller.set_origin(origin),
            Event::SetVoice(enabled) => self.controller.set_voice_enabled(enabled),
            Event::SetRestricted(restricted) => self.controller.set_restricted(restricted),
            Event::Teardown => Ok(()),
        };

        if let Err(e) = result {
            warn!("Session command failed: {}", e);
        }
    }

    /// The host starts broadcasting once the guest has greeted it
    fn arm_sync_ticker(&mut self) {
        if self.sync_armed
            || !self.controller.role().is_host()
            || !self.controller.state().is_established()
            || self.torn_down.load(Ordering::SeqCst)
        {
            return;
        }
        self.sync_armed = true;

        debug!("Sync ticker armed every {:?}", self.sync_interval);
        let ticker = spawn_ticker(&self.runtime, self.events.clone(), self.sync_interval, || {
            Event::SyncTick
        });
        self.registry
            .register(Resource::Timer(TimerSlot::Sync, Box::new(ticker)));

        // Teardown may have raced the registration
        if self.torn_down.load(Ordering::SeqCst) {
            self.registry.teardown_all();
        }
    }

    fn publish(&self) {
        *self.status.lock() = self.controller.status();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::ConnectionError;
    use crate::registry::{Channel, ConnectionSlot, Side};
    use crate::sync::LinkStatus;

    #[derive(Default)]
    struct FakeTransport {
        sent: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        fn sent(&self) -> Vec<String> {
            self.sent.lock().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.sent.lock().iter().filter(|m| m.starts_with(prefix)).count()
        }
    }

    impl Transport for FakeTransport {
        fn send(&self, text: String) {
            self.sent.lock().push(text);
        }
    }

    #[derive(Default)]
    struct FakePlayer {
        position: Mutex<f64>,
        playing: Mutex<bool>,
    }

    impl Playback for FakePlayer {
        fn position_seconds(&self) -> f64 {
            *self.position.lock()
        }

        fn is_playing(&self) -> bool {
            *self.playing.lock()
        }

        fn play(&self) {
            *self.playing.lock() = true;
        }

        fn pause(&self) {
            *self.playing.lock() = false;
        }

        fn seek(&self, position_seconds: f64) {
            *self.position.lock() = position_seconds;
        }
    }

    #[derive(Default)]
    struct FakeConnection {
        closed: AtomicBool,
    }

    impl PeerConnection for FakeConnection {
        fn label(&self) -> String {
            "data".to_string()
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn close(&self) -> Result<(), ConnectionError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Tears the session down as soon as a guest greets
    #[derive(Default)]
    struct TeardownOnGreeting {
        session: Mutex<Option<Arc<Session>>>,
        states: Mutex<Vec<SyncState>>,
    }

    impl SessionCallback for TeardownOnGreeting {
        fn on_state_changed(&self, state: SyncState) {
            self.states.lock().push(state);
        }

        fn on_guest_greeted(&self, _gid: String) {
            let session = self.session.lock().take();
            if let Some(session) = session {
                session.teardown();
            }
        }
    }

    /// Tears the session down the moment the link becomes active
    #[derive(Default)]
    struct TeardownOnActive {
        session: Mutex<Option<Arc<Session>>>,
        sent_at_teardown: Mutex<Option<usize>>,
        transport: Mutex<Option<Arc<FakeTransport>>>,
    }

    impl SessionCallback for TeardownOnActive {
        fn on_state_changed(&self, state: SyncState) {
            if state != SyncState::Active {
                return;
            }
            let session = self.session.lock().take();
            if let Some(session) = session {
                session.teardown();
                let sent = self.transport.lock().as_ref().map(|t| t.sent().len());
                *self.sent_at_teardown.lock() = sent;
            }
        }
    }

    struct Fixture {
        session: Session,
        transport: Arc<FakeTransport>,
        player: Arc<FakePlayer>,
        registry: Arc<ResourceRegistry>,
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            sync_interval_ms: 20,
            rtt_interval_ms: 20,
            ..SyncConfig::default()
        }
    }

    fn start(role: SyncRole) -> Fixture {
        let transport = Arc::new(FakeTransport::default());
        let player = Arc::new(FakePlayer::default());
        let registry = Arc::new(ResourceRegistry::new());
        let session = Session::start(
            role,
            fast_config(),
            transport.clone(),
            player.clone(),
            None,
            registry.clone(),
        )
        .unwrap();
        Fixture {
            session,
            transport,
            player,
            registry,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[test]
    fn test_start_requires_runtime() {
        let result = Session::start(
            SyncRole::Host,
            SyncConfig::default(),
            Arc::new(FakeTransport::default()),
            Arc::new(FakePlayer::default()),
            None,
            Arc::new(ResourceRegistry::new()),
        );
        assert!(matches!(result, Err(SessionError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let result = Session::start(
            SyncRole::Host,
            SyncConfig {
                rtt_interval_ms: 0,
                ..SyncConfig::default()
            },
            Arc::new(FakeTransport::default()),
            Arc::new(FakePlayer::default()),
            None,
            Arc::new(ResourceRegistry::new()),
        );
        assert!(matches!(result, Err(SessionError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_guest_greets_then_pings() {
        let f = start(SyncRole::Guest);
        assert_eq!(
            f.transport.sent().first().cloned(),
            Some(format!("connected|gid={}", f.session.peer_id()))
        );
        assert_eq!(f.session.status().state, SyncState::Negotiating);
        assert!(f.registry.has_timer(TimerSlot::Rtt));

        assert!(eventually(|| f.transport.count("rtt-ping|ts=") >= 2).await);
    }

    #[tokio::test]
    async fn test_host_activates_on_greeting_and_broadcasts() {
        let f = start(SyncRole::Host);
        assert!(!f.registry.has_timer(TimerSlot::Sync));

        f.session.deliver("connected|gid=ffffffffffffffff");
        assert!(eventually(|| f.session.status().state == SyncState::Active).await);
        assert!(f.registry.has_timer(TimerSlot::Sync));

        // One heartbeat answering the greeting plus ticker heartbeats
        assert!(eventually(|| f.transport.count("timestamp|atu=") >= 3).await);
        assert!(f.transport.count("progress|cur=") >= 3);
    }

    #[tokio::test]
    async fn test_guest_follows_host_beacon() {
        let f = start(SyncRole::Guest);
        let now = current_time_ms();
        f.session.deliver(format!("timestamp|atu={}", now));
        f.session.deliver("play");
        f.session.deliver(format!("progress|cur=100&atu={}", now));

        assert!(eventually(|| f.player.position_seconds() > 99.0).await);
        assert!(f.player.is_playing());
        let status = f.session.status();
        assert_eq!(status.state, SyncState::Active);
        assert_eq!(status.corrections, 1);
        assert_eq!(status.link, LinkStatus::Healthy);
    }

    #[tokio::test]
    async fn test_pump_delivers_stream() {
        let f = start(SyncRole::Host);
        let inbound = futures::stream::iter(vec![
            "connected|gid=ffffffffffffffff".to_string(),
            "voice-enabled".to_string(),
        ]);
        f.session.pump(inbound).await;

        assert!(eventually(|| f.session.status().remote_voice_enabled == Some(true)).await);
    }

    #[tokio::test]
    async fn test_host_only_commands() {
        let guest = start(SyncRole::Guest);
        assert_eq!(guest.session.play(), Err(SessionError::NotHost));
        assert_eq!(guest.session.set_origin("x"), Err(SessionError::NotHost));
        assert!(guest.session.set_restricted(true).is_ok());

        let host = start(SyncRole::Host);
        host.session.seek(12.5).unwrap();
        assert!(eventually(|| host.player.position_seconds() == 12.5).await);
        assert!(host.session.seek(f64::NAN).is_err());
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let f = start(SyncRole::Host);
        let connection = Arc::new(FakeConnection::default());
        f.registry.register(Resource::Connection(
            ConnectionSlot::new(Side::Local, Channel::Data),
            connection.clone(),
        ));

        let report = f.session.teardown();
        assert_eq!(report.timers_cancelled, 1);
        assert_eq!(report.connections_closed, 1);
        assert!(connection.is_closed());

        assert!(f.session.teardown().is_empty());
        assert!(f.session.is_torn_down());
        assert_eq!(f.session.status().state, SyncState::TornDown);
        assert_eq!(f.session.play(), Err(SessionError::TornDown));
        assert_eq!(
            f.session.set_voice_enabled(true),
            Err(SessionError::TornDown)
        );

        // Nothing is sent once torn down
        let sent = f.transport.sent().len();
        f.session.deliver("rtt-ping|ts=1");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.transport.sent().len(), sent);
    }

    #[tokio::test]
    async fn test_teardown_from_callback() {
        let callback = Arc::new(TeardownOnGreeting::default());
        let transport = Arc::new(FakeTransport::default());
        let registry = Arc::new(ResourceRegistry::new());
        let session = Arc::new(
            Session::start(
                SyncRole::Host,
                fast_config(),
                transport.clone(),
                Arc::new(FakePlayer::default()),
                Some(callback.clone()),
                registry.clone(),
            )
            .unwrap(),
        );
        *callback.session.lock() = Some(Arc::clone(&session));

        session.deliver("connected|gid=ffffffffffffffff");
        assert!(eventually(|| callback.states.lock().contains(&SyncState::TornDown)).await);
        assert!(session.is_torn_down());
        assert!(registry.is_empty());

        let sent = transport.sent().len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.sent().len(), sent);
    }

    #[tokio::test]
    async fn test_teardown_on_activation_stops_greeting_reply() {
        let callback = Arc::new(TeardownOnActive::default());
        let transport = Arc::new(FakeTransport::default());
        let player = Arc::new(FakePlayer::default());
        player.seek(1.0);
        let session = Arc::new(
            Session::start(
                SyncRole::Host,
                fast_config(),
                transport.clone(),
                player.clone(),
                Some(callback.clone()),
                Arc::new(ResourceRegistry::new()),
            )
            .unwrap(),
        );
        session.set_origin("https://cdn.test/a.mp4").unwrap();
        *callback.transport.lock() = Some(transport.clone());
        *callback.session.lock() = Some(Arc::clone(&session));

        session.deliver("connected|gid=ffffffffffffffff");
        assert!(eventually(|| callback.sent_at_teardown.lock().is_some()).await);
        assert!(session.is_torn_down());

        let sent_at_teardown = callback.sent_at_teardown.lock().unwrap_or_default();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let sent = transport.sent();
        assert_eq!(sent.len(), sent_at_teardown, "sent after teardown: {:?}", sent);
        assert!(!sent.iter().any(|m| m.starts_with("timestamp|")));
    }
}
