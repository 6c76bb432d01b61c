//! The kiosk session state machine.
//!
//! One actor task per kiosk owns all session state. Collaborators (badge
//! reader, voice channel callbacks, UI, timers) communicate exclusively
//! through the event channel, and observers read a `watch`-published
//! snapshot. No lock is ever held across a transition.
//!
//! States: `Idle -> Loading -> Authenticated -> VoiceActive -> Ending ->
//! Idle`, with `Error` reachable from any active state. Every transition
//! that leaves a state cancels the timers that state scheduled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ledger::{Ledger, RecordSessionCost};

use super::exit_intent::ExitIntentDetector;
use super::timers::{TimerPurpose, TimerRegistry};
use super::types::{
    BadgeScan, ChannelUsage, EndReason, KioskIdentity, LoadingProgress, Member, SessionStatus, VoiceStatus,
    LOADING_STEPS,
};

/// Timing knobs of the state machine. All durations in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Inactivity timeout for a basic-tier member.
    pub base_timeout_ms: u64,
    /// Visit count above which the loyalty multiplier applies.
    pub loyalty_visit_threshold: i64,
    pub loyalty_multiplier: f64,
    /// First expiry warning, this long before the timeout fires.
    pub warning_one_before_end_ms: u64,
    /// Second expiry warning, this long before the timeout fires.
    pub warning_two_before_end_ms: u64,
    /// How long a displayed warning stays on screen.
    pub warning_clear_ms: u64,
    /// Hard ceiling on deferring an end while the agent is speaking.
    pub deferred_end_ceiling_ms: u64,
    /// Grace period before an error state ends the session on its own.
    pub error_auto_end_ms: u64,
    /// Farewell display time after a natural end.
    pub farewell_natural_ms: u64,
    /// Farewell display time after a timeout or error end.
    pub farewell_abrupt_ms: u64,
    /// Overrides the built-in exit-intent phrase list when set.
    pub exit_patterns: Option<Vec<String>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_timeout_ms: 180_000,
            loyalty_visit_threshold: 100,
            loyalty_multiplier: 1.2,
            warning_one_before_end_ms: 30_000,
            warning_two_before_end_ms: 10_000,
            warning_clear_ms: 5_000,
            deferred_end_ceiling_ms: 8_000,
            error_auto_end_ms: 15_000,
            farewell_natural_ms: 8_000,
            farewell_abrupt_ms: 4_000,
            exit_patterns: None,
        }
    }
}

impl SessionConfig {
    /// Inactivity timeout adapted to the member: base, times the tier
    /// multiplier, times the loyalty multiplier for frequent visitors.
    pub fn adaptive_timeout(&self, member: &Member) -> Duration {
        let mut ms = self.base_timeout_ms as f64 * member.membership_tier.timeout_multiplier();
        if member.total_visits > self.loyalty_visit_threshold {
            ms *= self.loyalty_multiplier;
        }
        Duration::from_millis(ms.round() as u64)
    }

    pub fn detector(&self) -> ExitIntentDetector {
        match &self.exit_patterns {
            Some(patterns) => ExitIntentDetector::new(patterns.clone()),
            None => ExitIntentDetector::default(),
        }
    }
}

/// The external realtime voice connection, abstracted so the state machine
/// can run against a fake in tests.
#[async_trait]
pub trait VoiceChannel: Send + Sync {
    /// Open the voice connection for a member. Status changes arrive later
    /// as `SessionEvent::VoiceStatusChanged`.
    async fn connect(&self, member: &Member) -> Result<()>;

    /// Tear the connection down.
    async fn disconnect(&self) -> Result<()>;

    /// Usage counters accumulated since `connect`.
    async fn usage(&self) -> Result<ChannelUsage>;
}

/// Everything that can happen to a session, in one funnel.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    BadgeScanned(BadgeScan),
    VoiceStatusChanged(VoiceStatus),
    Transcript { text: String, is_final: bool },
    /// Member asked to retry after an error.
    Retry,
    /// External request to end the session (UI button, exit intent is
    /// detected internally).
    EndRequested,
    TimerFired(TimerPurpose),
    /// Result of a spawned `VoiceChannel::connect` attempt. Tagged with the
    /// session it was started for, so an outcome that arrives after that
    /// session was preempted or ended is dropped.
    ConnectOutcome { session_id: Uuid, error: Option<String> },
}

/// Observable session state, published on every transition.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub session_id: Option<Uuid>,
    pub member: Option<Member>,
    pub loading: Option<LoadingProgress>,
    pub warning: Option<String>,
    pub farewell: Option<String>,
    pub error_message: Option<String>,
    /// An end was requested while the agent was speaking and is waiting for
    /// the utterance to finish.
    pub pending_end: bool,
    pub started_at: Option<DateTime<Utc>>,
    /// Outstanding timers, for diagnostics. Zero when idle.
    pub active_timers: usize,
}

impl SessionSnapshot {
    fn idle() -> Self {
        SessionSnapshot {
            status: SessionStatus::Idle,
            session_id: None,
            member: None,
            loading: None,
            warning: None,
            farewell: None,
            error_message: None,
            pending_end: false,
            started_at: None,
            active_timers: 0,
        }
    }
}

/// Cheap, cloneable front for feeding events into the runtime.
#[derive(Clone)]
pub struct SessionHandle {
    events: mpsc::Sender<SessionEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub async fn scan_badge(&self, scan: BadgeScan) -> Result<()> {
        if scan.member_id.trim().is_empty() {
            return Err(Error::validation("badge scan carries an empty member id"));
        }
        self.send(SessionEvent::BadgeScanned(scan)).await
    }

    pub async fn voice_status(&self, status: VoiceStatus) -> Result<()> {
        self.send(SessionEvent::VoiceStatusChanged(status)).await
    }

    pub async fn transcript(&self, text: impl Into<String>, is_final: bool) -> Result<()> {
        self.send(SessionEvent::Transcript { text: text.into(), is_final }).await
    }

    pub async fn retry(&self) -> Result<()> {
        self.send(SessionEvent::Retry).await
    }

    pub async fn request_end(&self) -> Result<()> {
        self.send(SessionEvent::EndRequested).await
    }

    /// Latest published state.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    async fn send(&self, event: SessionEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| Error::channel("session runtime is no longer running"))
    }
}

pub struct SessionRuntime {
    identity: KioskIdentity,
    config: SessionConfig,
    detector: ExitIntentDetector,
    voice: Arc<dyn VoiceChannel>,
    ledger: Ledger,

    events_rx: mpsc::Receiver<SessionEvent>,
    events_tx: mpsc::Sender<SessionEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    timers: TimerRegistry,

    status: SessionStatus,
    session_id: Option<Uuid>,
    member: Option<Member>,
    voice_status: Option<VoiceStatus>,
    loading: Option<LoadingProgress>,
    warning: Option<String>,
    farewell: Option<String>,
    error_message: Option<String>,
    pending_end: bool,
    pending_reason: EndReason,
    started_at: Option<DateTime<Utc>>,
    started_instant: Option<Instant>,
}

impl SessionRuntime {
    pub fn new(
        identity: KioskIdentity,
        config: SessionConfig,
        voice: Arc<dyn VoiceChannel>,
        ledger: Ledger,
    ) -> (SessionRuntime, SessionHandle) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::idle());

        let detector = config.detector();
        let runtime = SessionRuntime {
            identity,
            detector,
            voice,
            ledger,
            events_rx,
            events_tx: events_tx.clone(),
            snapshot_tx,
            timers: TimerRegistry::new(events_tx.clone()),
            config,
            status: SessionStatus::Idle,
            session_id: None,
            member: None,
            voice_status: None,
            loading: None,
            warning: None,
            farewell: None,
            error_message: None,
            pending_end: false,
            pending_reason: EndReason::Natural,
            started_at: None,
            started_instant: None,
        };
        let handle = SessionHandle {
            events: events_tx,
            snapshot: snapshot_rx,
        };
        (runtime, handle)
    }

    /// Drive the state machine until every handle is dropped.
    pub async fn run(mut self) {
        tracing::info!(gym_id = %self.identity.gym_id, kiosk = %self.identity.kiosk_slug, "session runtime started");
        while let Some(event) = self.events_rx.recv().await {
            self.handle_event(event).await;
        }
        self.timers.cancel_all();
        tracing::info!(gym_id = %self.identity.gym_id, "session runtime stopped");
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::BadgeScanned(scan) => self.handle_badge_scanned(scan).await,
            SessionEvent::VoiceStatusChanged(status) => self.handle_voice_status(status).await,
            SessionEvent::Transcript { text, is_final } => self.handle_transcript(&text, is_final).await,
            SessionEvent::Retry => self.handle_retry().await,
            SessionEvent::EndRequested => self.request_session_end(EndReason::Natural).await,
            SessionEvent::TimerFired(purpose) => self.handle_timer(purpose).await,
            SessionEvent::ConnectOutcome { session_id, error } => {
                self.handle_connect_outcome(session_id, error).await
            }
        }
    }

    async fn handle_badge_scanned(&mut self, scan: BadgeScan) {
        if self.status == SessionStatus::Ending {
            tracing::warn!(member_id = %scan.member_id, "badge scan during farewell ignored");
            return;
        }

        if self.status.is_active() {
            // A new member walked up: finalize the current session right away,
            // without the farewell screen.
            tracing::info!(member_id = %scan.member_id, "badge scan preempts active session");
            self.finalize_session(EndReason::Natural).await;
            self.clear_session_state();
        }

        let member = Member::from(scan);
        self.session_id = Some(Uuid::new_v4());
        tracing::info!(
            member_id = %member.member_id,
            tier = ?member.membership_tier,
            "starting session"
        );
        self.begin_loading(member);
    }

    /// Enter `Loading` for a member: replay the progress steps, arm the
    /// fallback inactivity timer, and kick off the voice connect in the
    /// background. The timer is armed before the connect so a stalled
    /// connect can never wedge the machine in `Loading`.
    fn begin_loading(&mut self, member: Member) {
        self.status = SessionStatus::Loading;
        self.error_message = None;
        self.voice_status = None;
        self.member = Some(member.clone());

        for step in &LOADING_STEPS {
            self.loading = Some(step.clone());
            self.publish();
        }

        let timeout = self.config.adaptive_timeout(&member);
        self.timers.schedule(TimerPurpose::SessionTimeout, timeout);
        self.spawn_connect(member);
    }

    /// Run `VoiceChannel::connect` off the event loop and feed its outcome
    /// back through the channel, so timer events keep flowing while the
    /// connect is in flight.
    fn spawn_connect(&self, member: Member) {
        let Some(session_id) = self.session_id else {
            return;
        };
        let voice = self.voice.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let error = voice.connect(&member).await.err().map(|e| e.to_string());
            let _ = events.send(SessionEvent::ConnectOutcome { session_id, error }).await;
        });
    }

    async fn handle_connect_outcome(&mut self, session_id: Uuid, error: Option<String>) {
        if self.session_id != Some(session_id) || self.status != SessionStatus::Loading {
            tracing::debug!(session_id = %session_id, "dropping connect outcome for a finished session");
            return;
        }

        match error {
            None => {
                self.status = SessionStatus::Authenticated;
                self.loading = None;
                self.started_at = Some(Utc::now());
                self.started_instant = Some(Instant::now());
                self.publish();
            }
            Some(message) => {
                self.started_at.get_or_insert_with(Utc::now);
                self.started_instant.get_or_insert_with(Instant::now);
                self.enter_error(format!("voice connection failed: {message}"));
            }
        }
    }

    async fn handle_voice_status(&mut self, status: VoiceStatus) {
        if !self.status.is_active() {
            return;
        }

        match status {
            VoiceStatus::Error => {
                self.enter_error("voice channel reported an error".to_string());
            }
            VoiceStatus::Connecting => {
                self.voice_status = Some(status);
            }
            VoiceStatus::Connected | VoiceStatus::Listening | VoiceStatus::Speaking => {
                let was_speaking = self.voice_status == Some(VoiceStatus::Speaking);
                self.voice_status = Some(status);

                if self.status == SessionStatus::Authenticated {
                    self.status = SessionStatus::VoiceActive;
                    self.schedule_activity_timers();
                    tracing::info!("voice channel active");
                    self.publish();
                }

                // A deferred end completes the moment the utterance finishes.
                if self.pending_end && was_speaking && status != VoiceStatus::Speaking {
                    self.timers.cancel(TimerPurpose::DeferredEndCeiling);
                    let reason = self.pending_reason;
                    self.graceful_end(reason).await;
                }
            }
        }
    }

    async fn handle_transcript(&mut self, text: &str, is_final: bool) {
        if self.status != SessionStatus::VoiceActive || !is_final {
            return;
        }

        if self.detector.matches(text) {
            tracing::info!("exit intent detected");
            self.request_session_end(EndReason::Natural).await;
            return;
        }

        // Any final utterance counts as activity.
        self.schedule_activity_timers();
        if self.warning.take().is_some() {
            self.timers.cancel(TimerPurpose::WarningClear);
            self.publish();
        }
    }

    async fn handle_retry(&mut self) {
        if self.status != SessionStatus::Error {
            return;
        }
        let Some(member) = self.member.clone() else {
            return;
        };

        // Same member, no new scan: go back through the loading sequence.
        self.timers.cancel(TimerPurpose::ErrorAutoEnd);
        tracing::info!(member_id = %member.member_id, "retrying voice connection");
        self.begin_loading(member);
    }

    async fn handle_timer(&mut self, purpose: TimerPurpose) {
        match purpose {
            TimerPurpose::SessionTimeout => {
                if self.status.is_active() {
                    tracing::info!("session inactivity timeout");
                    self.request_session_end(EndReason::Timeout).await;
                }
            }
            TimerPurpose::WarningOne => {
                self.show_warning("La session se terminera dans 30 secondes".to_string());
            }
            TimerPurpose::WarningTwo => {
                self.show_warning("La session se terminera dans 10 secondes".to_string());
            }
            TimerPurpose::WarningClear => {
                if self.warning.take().is_some() {
                    self.publish();
                }
            }
            TimerPurpose::DeferredEndCeiling => {
                if self.pending_end {
                    tracing::warn!("agent still speaking at the deferred-end ceiling, ending anyway");
                    let reason = self.pending_reason;
                    self.graceful_end(reason).await;
                }
            }
            TimerPurpose::ErrorAutoEnd => {
                if self.status == SessionStatus::Error {
                    self.graceful_end(EndReason::Error).await;
                }
            }
            TimerPurpose::FarewellDone => {
                if self.status == SessionStatus::Ending {
                    self.reset_to_idle();
                }
            }
        }
    }

    async fn request_session_end(&mut self, reason: EndReason) {
        if !self.status.is_active() {
            return;
        }

        if self.voice_status == Some(VoiceStatus::Speaking) {
            if !self.pending_end {
                self.pending_end = true;
                self.pending_reason = reason;
                self.timers.schedule(
                    TimerPurpose::DeferredEndCeiling,
                    Duration::from_millis(self.config.deferred_end_ceiling_ms),
                );
                tracing::info!(reason = %reason, "end deferred until the agent finishes speaking");
                self.publish();
            }
            return;
        }

        self.graceful_end(reason).await;
    }

    /// Tear down the voice channel, record the session's cost, and show the
    /// farewell screen.
    async fn graceful_end(&mut self, reason: EndReason) {
        self.finalize_session(reason).await;

        let farewell = match reason {
            EndReason::Natural => {
                let name = self.member.as_ref().map(|m| m.first_name.as_str()).unwrap_or("");
                format!("Au revoir {name}, à bientôt !")
            }
            EndReason::Timeout | EndReason::Error => "Session terminée".to_string(),
        };
        let display_ms = match reason {
            EndReason::Natural => self.config.farewell_natural_ms,
            EndReason::Timeout | EndReason::Error => self.config.farewell_abrupt_ms,
        };

        self.status = SessionStatus::Ending;
        self.loading = None;
        self.warning = None;
        self.farewell = Some(farewell);
        self.timers.schedule(TimerPurpose::FarewellDone, Duration::from_millis(display_ms));
        self.publish();
    }

    /// Shared teardown for graceful ends and badge-scan preemption: cancel
    /// timers, close the channel, persist the cost breakdown. Persistence
    /// failures are logged, never allowed to wedge the state machine.
    async fn finalize_session(&mut self, reason: EndReason) {
        self.timers.cancel_all();
        self.pending_end = false;

        let usage = match self.voice.usage().await {
            Ok(usage) => usage,
            Err(e) => {
                tracing::warn!(error = %e, "usage fetch failed, recording zero usage");
                ChannelUsage::default()
            }
        };
        if let Err(e) = self.voice.disconnect().await {
            tracing::warn!(error = %e, "voice disconnect failed");
        }
        self.voice_status = None;

        let (Some(session_id), Some(_)) = (self.session_id, self.member.as_ref()) else {
            return;
        };
        let duration_seconds = self
            .started_instant
            .map(|start| start.elapsed().as_secs() as i64)
            .unwrap_or(0);

        let record = RecordSessionCost {
            session_id,
            gym_id: self.identity.gym_id.clone(),
            franchise_id: self.identity.franchise_id.clone(),
            timestamp: self.started_at,
            duration_seconds,
            text_input_tokens: usage.text_input_tokens,
            text_output_tokens: usage.text_output_tokens,
            audio_input_seconds: usage.audio_input_seconds,
            audio_output_seconds: usage.audio_output_seconds,
            user_satisfaction: None,
            error_occurred: self.error_message.is_some() || reason == EndReason::Error,
            end_reason: reason,
        };
        if let Err(e) = self.ledger.record_session_cost(record).await {
            tracing::error!(session_id = %session_id, error = %e, "failed to record session cost");
        }
    }

    fn enter_error(&mut self, message: String) {
        if !self.status.is_active() {
            return;
        }
        tracing::error!(message = %message, "session entered error state");

        self.timers.cancel_all();
        self.pending_end = false;
        self.status = SessionStatus::Error;
        self.error_message = Some(message);
        self.warning = None;
        self.loading = None;
        self.timers.schedule(
            TimerPurpose::ErrorAutoEnd,
            Duration::from_millis(self.config.error_auto_end_ms),
        );
        self.publish();
    }

    fn show_warning(&mut self, message: String) {
        if self.status != SessionStatus::VoiceActive {
            return;
        }
        self.warning = Some(message);
        self.timers
            .schedule(TimerPurpose::WarningClear, Duration::from_millis(self.config.warning_clear_ms));
        self.publish();
    }

    /// (Re)arm the inactivity timeout and both expiry warnings.
    fn schedule_activity_timers(&mut self) {
        let Some(member) = self.member.as_ref() else {
            return;
        };
        let timeout = self.config.adaptive_timeout(member);

        self.timers.schedule(TimerPurpose::SessionTimeout, timeout);
        if let Some(at) = timeout.checked_sub(Duration::from_millis(self.config.warning_one_before_end_ms)) {
            self.timers.schedule(TimerPurpose::WarningOne, at);
        }
        if let Some(at) = timeout.checked_sub(Duration::from_millis(self.config.warning_two_before_end_ms)) {
            self.timers.schedule(TimerPurpose::WarningTwo, at);
        }
    }

    fn clear_session_state(&mut self) {
        self.session_id = None;
        self.member = None;
        self.voice_status = None;
        self.loading = None;
        self.warning = None;
        self.farewell = None;
        self.error_message = None;
        self.pending_end = false;
        self.pending_reason = EndReason::Natural;
        self.started_at = None;
        self.started_instant = None;
    }

    fn reset_to_idle(&mut self) {
        self.timers.cancel_all();
        self.clear_session_state();
        self.status = SessionStatus::Idle;
        self.publish();
        tracing::info!("session machine back to idle");
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(SessionSnapshot {
            status: self.status,
            session_id: self.session_id,
            member: self.member.clone(),
            loading: self.loading.clone(),
            warning: self.warning.clone(),
            farewell: self.farewell.clone(),
            error_message: self.error_message.clone(),
            pending_end: self.pending_end,
            started_at: self.started_at,
            active_timers: self.timers.active_count(),
        });
    }
}
