//! Call orchestrator
//!
//! A [`CallOrchestrator`] is the handle the application holds for one call.
//! Every operation on it, every signaling delivery, every native peer event,
//! every store write completion and every timer becomes a command on a
//! single FIFO queue. One worker task consumes that queue and is the only
//! code that touches call state, so no call state is behind a lock.

use crate::{
    context::CallContext,
    error::{CallError, CallResult},
    outbox::{OnWritten, Outbox, WriteCompletion, WriteKind, WriteOp},
    peer_connection::{PeerConnectionManager, PeerEvent, PeerEventSink},
    session::CallSession,
    state::{CallStateMachine, CallStatus, TransitionOutcome},
    types::{
        CallRole, IceCandidate, IceConnectionState, SdpType, SessionDescription, TrackHandle,
    },
};
use callrtc_signaling::{
    CallPath, OnError, OnValue, SignalingChannel, SignalingError, SubscriptionHandle,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Sub-paths every participant observes
const OBSERVED_PATHS: [CallPath; 5] = [
    CallPath::Sdp,
    CallPath::IceCandidates,
    CallPath::Status,
    CallPath::Error,
    CallPath::CallerId,
];

/// Read-only view of a call, published after every command
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    /// Bound conversation, once a call was started or observed
    pub conversation_id: Option<String>,
    /// Side this orchestrator plays
    pub role: Option<CallRole>,
    /// Current local status
    pub status: CallStatus,
    /// Error message when `status` is `Error`
    pub error: Option<String>,
    /// Caller's user id, once known
    pub caller_id: Option<String>,
    /// Whether an offer is waiting to be accepted
    pub incoming_offer: bool,
    /// Every status reached, oldest first
    pub history: Vec<CallStatus>,
    /// Local camera track
    pub local_video: Option<TrackHandle>,
    /// Remote video track
    pub remote_video: Option<TrackHandle>,
    /// Whether cleanup ran
    pub disposed: bool,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            conversation_id: None,
            role: None,
            status: CallStatus::Pending,
            error: None,
            caller_id: None,
            incoming_offer: false,
            history: vec![CallStatus::Pending],
            local_video: None,
            remote_video: None,
            disposed: false,
        }
    }
}

/// Unit of work for the call worker
#[derive(Debug)]
pub(crate) enum Command {
    Start {
        conversation_id: String,
        callee_id: String,
    },
    Observe {
        conversation_id: String,
    },
    Accept {
        conversation_id: String,
    },
    Reject {
        conversation_id: String,
    },
    End {
        conversation_id: String,
        duration: Duration,
    },
    Cleanup {
        ack: Option<oneshot::Sender<()>>,
    },
    Signal {
        path: CallPath,
        value: Value,
    },
    SignalFailed {
        path: CallPath,
        error: SignalingError,
    },
    Resubscribe {
        path: CallPath,
    },
    Peer(PeerEvent),
    Written(WriteCompletion),
    AnswerTimeout,
}

/// Handle to one call
///
/// Operations enqueue and return immediately; observe progress through
/// [`CallOrchestrator::snapshot`], [`CallOrchestrator::subscribe`] or
/// [`CallOrchestrator::wait_for`]. Dropping the handle cleans the call up.
pub struct CallOrchestrator {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<CallSnapshot>,
    local_user_id: String,
}

impl CallOrchestrator {
    /// Validate `context` and spawn the call worker. Must be called inside a
    /// tokio runtime.
    pub fn new(context: CallContext) -> CallResult<Self> {
        context.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::default());
        let local_user_id = context.local_user_id.clone();

        let worker = CallWorker::new(context, tx.downgrade(), snapshot_tx);
        tokio::spawn(worker.run(rx));

        Ok(Self {
            commands: tx,
            snapshot: snapshot_rx,
            local_user_id,
        })
    }

    /// User id this orchestrator acts for
    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    fn enqueue(&self, command: Command) -> CallResult<()> {
        if self.snapshot.borrow().disposed {
            return Err(CallError::Disposed);
        }
        self.commands.send(command).map_err(|_| CallError::Disposed)
    }

    /// Place a call to `callee_id` on the session `conversation_id`
    pub fn start_call(&self, conversation_id: &str, callee_id: &str) -> CallResult<()> {
        require_id("conversation_id", conversation_id)?;
        require_id("callee_id", callee_id)?;
        self.enqueue(Command::Start {
            conversation_id: conversation_id.to_string(),
            callee_id: callee_id.to_string(),
        })
    }

    /// Watch `conversation_id` for incoming calls as the callee
    pub fn observe(&self, conversation_id: &str) -> CallResult<()> {
        require_id("conversation_id", conversation_id)?;
        self.enqueue(Command::Observe {
            conversation_id: conversation_id.to_string(),
        })
    }

    /// Answer the pending offer, or the first one to arrive
    pub fn accept_call(&self, conversation_id: &str) -> CallResult<()> {
        require_id("conversation_id", conversation_id)?;
        self.enqueue(Command::Accept {
            conversation_id: conversation_id.to_string(),
        })
    }

    /// Decline an incoming call
    pub fn reject_call(&self, conversation_id: &str) -> CallResult<()> {
        require_id("conversation_id", conversation_id)?;
        self.enqueue(Command::Reject {
            conversation_id: conversation_id.to_string(),
        })
    }

    /// Hang up. `duration` is how long the call was connected, for logging.
    pub fn end_call(&self, conversation_id: &str, duration: Duration) -> CallResult<()> {
        require_id("conversation_id", conversation_id)?;
        self.enqueue(Command::End {
            conversation_id: conversation_id.to_string(),
            duration,
        })
    }

    /// Unsubscribe, release media and the peer connection, and stop
    /// accepting commands. Waits until the worker has done so. Idempotent.
    pub async fn cleanup(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Cleanup { ack: Some(ack) }).is_err() {
            return;
        }
        let _ = done.await;
    }

    /// Latest published state
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Current status
    pub fn status(&self) -> CallStatus {
        self.snapshot.borrow().status
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until `predicate` holds for the published state, up to
    /// `timeout`. Returns the matching snapshot.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&CallSnapshot) -> bool,
        timeout: Duration,
    ) -> Option<CallSnapshot> {
        let mut rx = self.snapshot.clone();
        let wait = async move { rx.wait_for(|s| predicate(s)).await.map(|s| s.clone()) };
        tokio::time::timeout(timeout, wait).await.ok()?.ok()
    }
}

impl Drop for CallOrchestrator {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Cleanup { ack: None });
    }
}

fn require_id(field: &str, value: &str) -> CallResult<()> {
    if value.trim().is_empty() {
        return Err(CallError::validation(field, "must not be empty"));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Active,
    Disposed,
}

/// Session this worker is bound to
struct BoundCall {
    role: CallRole,
    channel: Arc<dyn SignalingChannel>,
    session: CallSession,
    outbox: Outbox,
}

/// Single consumer of the command queue; owns all call state
struct CallWorker {
    context: CallContext,
    commands: mpsc::WeakUnboundedSender<Command>,
    snapshot: watch::Sender<CallSnapshot>,
    lifecycle: Lifecycle,
    machine: CallStateMachine,
    call: Option<BoundCall>,
    peer: Option<PeerConnectionManager>,
    subscriptions: HashMap<CallPath, SubscriptionHandle>,
    resubscribe_attempts: HashMap<CallPath, u32>,
    timers: Vec<JoinHandle<()>>,
    answer_timer: Option<JoinHandle<()>>,

    /// Caller: subscriptions wait until the stale node is cleared
    awaiting_clear: bool,
    /// Callee: offer received and not yet answered
    incoming_offer: Option<SessionDescription>,
    accept_requested: bool,
    answered: bool,
    /// A non-terminal status was seen on the node during this call
    remote_active_seen: bool,
    /// Last message found on the `error` sub-path
    remote_error: Option<String>,
    seen_candidate_keys: HashSet<String>,
}

impl CallWorker {
    fn new(
        context: CallContext,
        commands: mpsc::WeakUnboundedSender<Command>,
        snapshot: watch::Sender<CallSnapshot>,
    ) -> Self {
        Self {
            context,
            commands,
            snapshot,
            lifecycle: Lifecycle::Active,
            machine: CallStateMachine::new(),
            call: None,
            peer: None,
            subscriptions: HashMap::new(),
            resubscribe_attempts: HashMap::new(),
            timers: Vec::new(),
            answer_timer: None,
            awaiting_clear: false,
            incoming_offer: None,
            accept_requested: false,
            answered: false,
            remote_active_seen: false,
            remote_error: None,
            seen_candidate_keys: HashSet::new(),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            if let Command::Cleanup { ack } = command {
                self.cleanup().await;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                continue;
            }

            if self.lifecycle == Lifecycle::Disposed {
                tracing::trace!("Dropping command after cleanup: {:?}", command);
                continue;
            }

            self.handle(command).await;
            self.publish_snapshot();
        }
        tracing::debug!(user = %self.context.local_user_id, "Call worker stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start {
                conversation_id,
                callee_id,
            } => self.start(conversation_id, callee_id).await,
            Command::Observe { conversation_id } => self.observe(conversation_id),
            Command::Accept { conversation_id } => self.accept(conversation_id).await,
            Command::Reject { conversation_id } => self.reject(conversation_id).await,
            Command::End {
                conversation_id,
                duration,
            } => self.end(conversation_id, duration).await,
            Command::Signal { path, value } => self.on_signal(path, value).await,
            Command::SignalFailed { path, error } => self.on_subscription_failed(path, error).await,
            Command::Resubscribe { path } => self.on_resubscribe(path),
            Command::Peer(event) => self.on_peer_event(event).await,
            Command::Written(completion) => self.on_written(completion).await,
            Command::AnswerTimeout => self.on_answer_timeout().await,
            Command::Cleanup { .. } => {}
        }
    }

    // ---- binding -------------------------------------------------------

    fn conversation_id(&self) -> Option<&str> {
        self.call.as_ref().map(|c| c.session.conversation_id.as_str())
    }

    fn role(&self) -> Option<CallRole> {
        self.call.as_ref().map(|c| c.role)
    }

    fn bind(&mut self, conversation_id: &str, role: CallRole) {
        let channel = self.context.store.channel(conversation_id);
        let caller_id = match role {
            CallRole::Caller => Some(self.context.local_user_id.clone()),
            CallRole::Callee => None,
        };

        let completions = self.commands.upgrade();
        let on_written: OnWritten = Box::new(move |completion: WriteCompletion| {
            if let Some(tx) = &completions {
                let _ = tx.send(Command::Written(completion));
            }
        });
        let outbox = Outbox::spawn(channel.clone(), &self.context.config, on_written);

        tracing::info!(
            conversation = %conversation_id,
            user = %self.context.local_user_id,
            role = ?role,
            "Bound call session"
        );
        self.call = Some(BoundCall {
            role,
            channel,
            session: CallSession::new(conversation_id, caller_id),
            outbox,
        });
    }

    /// Whether a command for `conversation_id` applies to the bound call
    fn is_bound_to(&self, conversation_id: &str, operation: &str) -> bool {
        match self.conversation_id() {
            Some(bound) if bound == conversation_id => true,
            Some(bound) => {
                tracing::warn!(
                    bound = %bound,
                    requested = %conversation_id,
                    "Ignoring {} for a different conversation",
                    operation
                );
                false
            }
            None => {
                tracing::warn!(conversation = %conversation_id, "Ignoring {} before any call", operation);
                false
            }
        }
    }

    fn submit(&self, op: WriteOp) {
        if let Some(call) = &self.call {
            if !call.outbox.submit(op) {
                tracing::warn!("Outbox closed; dropping store write");
            }
        }
    }

    fn publish_status(&self, status: CallStatus) {
        self.submit(WriteOp::Publish(CallPath::Status, Value::from(status.as_str())));
    }

    // ---- public operations --------------------------------------------

    async fn start(&mut self, conversation_id: String, callee_id: String) {
        if let Some(bound) = self.conversation_id() {
            tracing::warn!(
                bound = %bound,
                requested = %conversation_id,
                "Call already in progress; ignoring start_call"
            );
            return;
        }

        self.bind(&conversation_id, CallRole::Caller);
        tracing::info!(conversation = %conversation_id, callee = %callee_id, "Starting call");

        // Leftovers from an earlier call must not reach the new one
        self.awaiting_clear = true;
        self.submit(WriteOp::Clear);

        if let Err(e) = self.create_peer().await {
            self.fail_call(e).await;
            return;
        }

        let offer = match self.prepare_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                self.fail_call(e).await;
                return;
            }
        };

        if let Some(call) = self.call.as_mut() {
            call.session.set_local_description(offer.clone());
        }
        self.submit(WriteOp::Publish(CallPath::Sdp, offer.to_value()));
        self.submit(WriteOp::Publish(
            CallPath::CallerId,
            Value::from(self.context.local_user_id.as_str()),
        ));
        self.publish_status(CallStatus::Pending);

        self.schedule_answer_timeout();
    }

    async fn prepare_offer(&mut self) -> CallResult<SessionDescription> {
        let peer = self.peer.as_mut().ok_or(CallError::Disposed)?;
        peer.initialize_media().await?;
        peer.create_offer().await
    }

    fn observe(&mut self, conversation_id: String) {
        match (self.conversation_id(), self.role()) {
            (Some(bound), Some(CallRole::Callee)) if bound == conversation_id => {
                tracing::debug!(conversation = %conversation_id, "Already observing");
            }
            (Some(bound), _) => {
                tracing::warn!(
                    bound = %bound,
                    requested = %conversation_id,
                    "Call already in progress; ignoring observe"
                );
            }
            (None, _) => {
                self.bind(&conversation_id, CallRole::Callee);
                self.subscribe_all();
            }
        }
    }

    async fn accept(&mut self, conversation_id: String) {
        if self.call.is_none() {
            self.observe(conversation_id.clone());
        }
        if !self.is_bound_to(&conversation_id, "accept_call") {
            return;
        }
        if self.role() != Some(CallRole::Callee) {
            tracing::warn!(conversation = %conversation_id, "Only the callee can accept a call");
            return;
        }
        if self.accept_requested {
            tracing::debug!(conversation = %conversation_id, "Call already accepted");
            return;
        }

        self.accept_requested = true;
        tracing::info!(conversation = %conversation_id, "Accepting call");
        if self.incoming_offer.is_some() {
            self.answer_offer().await;
        }
    }

    async fn answer_offer(&mut self) {
        if self.answered {
            return;
        }
        let Some(offer) = self.incoming_offer.clone() else {
            return;
        };
        self.answered = true;

        if let Err(e) = self.create_peer().await {
            self.fail_call(e).await;
            return;
        }

        // Candidates that arrived before acceptance go through the
        // manager's buffer like any other early candidate
        let early: Vec<IceCandidate> = self
            .call
            .as_ref()
            .map(|c| c.session.remote_candidates.clone())
            .unwrap_or_default();

        let answer = match self.prepare_answer(&offer, early).await {
            Ok(answer) => answer,
            Err(e) => {
                self.fail_call(e).await;
                return;
            }
        };

        if let Some(call) = self.call.as_mut() {
            call.session.set_remote_description(offer);
            call.session.set_local_description(answer.clone());
        }
        self.incoming_offer = None;

        self.submit(WriteOp::Publish(CallPath::Sdp, answer.to_value()));
        if self.apply_transition(CallStatus::Connecting) {
            self.publish_status(CallStatus::Connecting);
        }
    }

    async fn prepare_answer(
        &mut self,
        offer: &SessionDescription,
        early: Vec<IceCandidate>,
    ) -> CallResult<SessionDescription> {
        let peer = self.peer.as_mut().ok_or(CallError::Disposed)?;
        for candidate in early {
            peer.add_remote_ice_candidate(candidate).await?;
        }
        peer.initialize_media().await?;
        peer.create_answer(offer).await
    }

    async fn reject(&mut self, conversation_id: String) {
        if !self.is_bound_to(&conversation_id, "reject_call") {
            return;
        }
        if self.role() != Some(CallRole::Callee) {
            tracing::warn!(conversation = %conversation_id, "Only the callee can reject a call");
            return;
        }
        if self.machine.status() == CallStatus::Connected || self.machine.is_terminal() {
            tracing::warn!(
                conversation = %conversation_id,
                status = %self.machine.status(),
                "Too late to reject; use end_call"
            );
            return;
        }

        tracing::info!(conversation = %conversation_id, "Rejecting call");
        self.publish_status(CallStatus::Ended);
        self.apply_transition(CallStatus::Ended);
        self.cleanup().await;
    }

    async fn end(&mut self, conversation_id: String, duration: Duration) {
        if !self.is_bound_to(&conversation_id, "end_call") {
            return;
        }
        if self.machine.is_terminal() {
            tracing::debug!(conversation = %conversation_id, "Call already finished");
            return;
        }

        let (age, idle) = self
            .call
            .as_ref()
            .map(|c| (c.session.age(), c.session.idle()))
            .unwrap_or_default();
        tracing::info!(
            conversation = %conversation_id,
            duration_secs = duration.as_secs(),
            session_age_ms = age.as_millis() as u64,
            idle_ms = idle.as_millis() as u64,
            "Ending call"
        );

        self.publish_status(CallStatus::Ended);
        self.submit(WriteOp::Clear);
        self.apply_transition(CallStatus::Ended);
        self.cleanup().await;
    }

    // ---- peer connection -----------------------------------------------

    async fn create_peer(&mut self) -> CallResult<()> {
        if self.peer.is_some() {
            return Ok(());
        }
        let Some(tx) = self.commands.upgrade() else {
            return Err(CallError::Disposed);
        };
        let sink = PeerEventSink::new(move |event| {
            let _ = tx.send(Command::Peer(event));
        });
        let backend = self.context.peers.create(&self.context.config, sink).await?;
        self.peer = Some(PeerConnectionManager::new(backend));
        Ok(())
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalIceCandidate(candidate) => {
                let candidate = candidate.with_sender(self.context.local_user_id.clone());
                tracing::debug!(mid = %candidate.sdp_mid, "Publishing local ICE candidate");
                self.submit(WriteOp::Push(CallPath::IceCandidates, candidate.to_value()));
                if let Some(call) = self.call.as_mut() {
                    call.session.add_local_candidate(candidate);
                }
            }
            PeerEvent::IceConnectionStateChanged(state) => self.on_ice_state(state).await,
            PeerEvent::RemoteTrackAdded(track) => {
                tracing::info!(kind = ?track.kind, stream = %track.stream_id, "Remote track added");
            }
        }
    }

    async fn on_ice_state(&mut self, state: IceConnectionState) {
        tracing::debug!(state = ?state, "ICE connection state changed");
        match state {
            IceConnectionState::Checking => {
                self.apply_transition(CallStatus::Connecting);
            }
            IceConnectionState::Connected => {
                if self.apply_transition(CallStatus::Connected) {
                    tracing::info!(
                        conversation = %self.conversation_id().unwrap_or_default(),
                        "Call connected"
                    );
                    self.publish_status(CallStatus::Connected);
                }
            }
            IceConnectionState::Failed => {
                self.fail_call(CallError::Connectivity("ICE connection failed".to_string()))
                    .await;
            }
            IceConnectionState::Disconnected => {
                self.fail_call(CallError::Connectivity("peer disconnected".to_string()))
                    .await;
            }
            IceConnectionState::New | IceConnectionState::Closed => {}
        }
    }

    // ---- signaling -----------------------------------------------------

    fn subscribe_all(&mut self) {
        for path in OBSERVED_PATHS {
            self.subscribe(path);
        }
    }

    fn subscribe(&mut self, path: CallPath) {
        let Some(call) = self.call.as_ref() else {
            return;
        };
        let Some(tx) = self.commands.upgrade() else {
            return;
        };
        let err_tx = tx.clone();
        let on_value: OnValue = Box::new(move |value| {
            let _ = tx.send(Command::Signal { path, value });
        });
        let on_error: OnError = Box::new(move |error| {
            let _ = err_tx.send(Command::SignalFailed { path, error });
        });

        match call.channel.subscribe(path, on_value, on_error) {
            Ok(handle) => {
                if let Some(previous) = self.subscriptions.insert(path, handle) {
                    call.channel.unsubscribe(&previous);
                }
            }
            Err(error) => {
                // Handled like a subscription that failed right away
                if let Some(tx) = self.commands.upgrade() {
                    let _ = tx.send(Command::SignalFailed { path, error });
                }
            }
        }
    }

    async fn on_subscription_failed(&mut self, path: CallPath, error: SignalingError) {
        self.subscriptions.remove(&path);
        let attempts = {
            let count = self.resubscribe_attempts.entry(path).or_insert(0);
            *count += 1;
            *count
        };

        if attempts > self.context.config.max_resubscribe_attempts {
            tracing::error!(path = %path, "Subscription lost for good: {}", error);
            self.fail_call(CallError::Transport(error)).await;
            return;
        }

        tracing::warn!(path = %path, attempt = attempts, "Subscription failed, re-subscribing: {}", error);
        let delay = self.context.config.resubscribe_backoff();
        if let Some(tx) = self.commands.upgrade() {
            self.timers.push(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(Command::Resubscribe { path });
            }));
        }
    }

    fn on_resubscribe(&mut self, path: CallPath) {
        if self.subscriptions.contains_key(&path) {
            return;
        }
        tracing::debug!(path = %path, "Re-subscribing");
        self.subscribe(path);
    }

    async fn on_signal(&mut self, path: CallPath, value: Value) {
        if self.call.is_none() {
            return;
        }
        tracing::debug!(path = %path, "Signal received");
        match path {
            CallPath::Sdp => self.on_sdp(value).await,
            CallPath::IceCandidates => self.on_candidates(value).await,
            CallPath::Status => self.on_status(value).await,
            CallPath::Error => {
                if let Value::String(message) = value {
                    self.remote_error = Some(message);
                }
            }
            CallPath::CallerId => {
                if let (Value::String(caller), Some(call)) = (value, self.call.as_mut()) {
                    call.session.caller_id = Some(caller);
                }
            }
        }
    }

    async fn on_sdp(&mut self, value: Value) {
        if value.is_null() {
            if self.is_unanswered_callee() {
                if self.incoming_offer.take().is_some() {
                    tracing::debug!("Offer withdrawn");
                }
                self.reset_remote_tracking();
            }
            return;
        }
        let sdp = match SessionDescription::from_value(&value) {
            Ok(sdp) => sdp,
            Err(e) => {
                tracing::warn!("Ignoring session description: {}", e);
                return;
            }
        };

        match (self.role(), sdp.kind) {
            (Some(CallRole::Callee), SdpType::Offer) => self.on_remote_offer(sdp).await,
            (Some(CallRole::Caller), SdpType::Answer) => self.on_remote_answer(sdp).await,
            // Our own description echoed back
            _ => {}
        }
    }

    async fn on_remote_offer(&mut self, offer: SessionDescription) {
        let known = self.incoming_offer.as_ref().or_else(|| {
            self.call
                .as_ref()
                .and_then(|c| c.session.remote_description.as_ref())
        });
        if let Some(known) = known {
            if known.description != offer.description {
                tracing::warn!("Dropping a second offer while one is in negotiation");
            }
            return;
        }

        tracing::info!(
            conversation = %self.conversation_id().unwrap_or_default(),
            "Incoming call offer"
        );
        self.incoming_offer = Some(offer);
        if self.accept_requested {
            self.answer_offer().await;
        }
    }

    async fn on_remote_answer(&mut self, answer: SessionDescription) {
        let outstanding = self
            .peer
            .as_ref()
            .map(|p| p.has_outstanding_offer())
            .unwrap_or(false);

        if !outstanding {
            let duplicate = self
                .call
                .as_ref()
                .and_then(|c| c.session.remote_description.as_ref())
                .map(|applied| applied.description == answer.description)
                .unwrap_or(false);
            if duplicate {
                tracing::debug!("Answer already applied");
            } else {
                tracing::warn!("Ignoring answer without an outstanding offer");
            }
            return;
        }

        let result = match self.peer.as_mut() {
            Some(peer) => peer.apply_remote_answer(&answer).await,
            None => return,
        };
        if let Err(e) = result {
            tracing::error!("Failed to apply answer: {}", e);
            self.fail_call(e).await;
            return;
        }

        if let Some(timer) = self.answer_timer.take() {
            timer.abort();
        }
        if let Some(call) = self.call.as_mut() {
            call.session.set_remote_description(answer);
        }
        self.apply_transition(CallStatus::Connecting);
    }

    async fn on_candidates(&mut self, value: Value) {
        let Value::Object(entries) = value else {
            // Node cleared before we answered: drop what the old call left
            if self.is_unanswered_callee() {
                self.seen_candidate_keys.clear();
                if let Some(call) = self.call.as_mut() {
                    call.session.remote_candidates.clear();
                }
            }
            return;
        };

        let mut keys: Vec<&String> = entries.keys().collect();
        keys.sort();

        for key in keys {
            if !self.seen_candidate_keys.insert(key.clone()) {
                continue;
            }
            let candidate = match IceCandidate::from_value(&entries[key]) {
                Ok(candidate) => candidate,
                Err(e) => {
                    tracing::warn!(key = %key, "Skipping ICE candidate: {}", e);
                    continue;
                }
            };
            if candidate.sender_id.as_deref() == Some(self.context.local_user_id.as_str()) {
                continue;
            }

            if let Some(call) = self.call.as_mut() {
                call.session.add_remote_candidate(candidate.clone());
            }
            let result = match self.peer.as_mut() {
                Some(peer) => peer.add_remote_ice_candidate(candidate).await,
                None => continue,
            };
            match result {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    self.fail_call(e).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(key = %key, "Failed to add remote ICE candidate: {}", e);
                }
            }
        }
    }

    async fn on_status(&mut self, value: Value) {
        let remote = match &value {
            Value::Null => None,
            Value::String(raw) => match CallStatus::from_str(raw) {
                Ok(status) => Some(status),
                Err(e) => {
                    tracing::warn!("Ignoring status: {}", e);
                    return;
                }
            },
            other => {
                tracing::warn!("Ignoring non-string status {}", other);
                return;
            }
        };

        match remote {
            Some(status) if !status.is_terminal() => {
                self.remote_active_seen = true;
            }
            // Node reset under a ringing callee: the active status belonged
            // to an earlier call
            None if self.is_unanswered_callee() => {
                tracing::debug!("Session node reset before answering");
                self.reset_remote_tracking();
            }
            _ if !self.remote_active_seen => {
                tracing::debug!("Ignoring terminal status left over from an earlier call");
            }
            Some(CallStatus::Error) => {
                let message = match self.remote_error.clone() {
                    Some(message) => message,
                    None => self
                        .fetch_remote_error()
                        .await
                        .unwrap_or_else(|| "remote side reported an error".to_string()),
                };
                tracing::info!(error = %message, "Remote side failed the call");
                self.machine.fail(message);
                self.finish_remote_termination().await;
            }
            _ => {
                tracing::info!(
                    conversation = %self.conversation_id().unwrap_or_default(),
                    "Remote side ended the call"
                );
                self.apply_transition(CallStatus::Ended);
                self.finish_remote_termination().await;
            }
        }
    }

    /// Read the `error` sub-path directly when its delivery lags the status
    async fn fetch_remote_error(&self) -> Option<String> {
        let channel = self.call.as_ref()?.channel.clone();
        match channel.fetch(CallPath::Error).await {
            Ok(Some(Value::String(message))) => Some(message),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Failed to read remote error message: {}", e);
                None
            }
        }
    }

    fn is_unanswered_callee(&self) -> bool {
        self.role() == Some(CallRole::Callee) && !self.answered
    }

    /// Forget what was seen on the node; a new caller starts from scratch
    fn reset_remote_tracking(&mut self) {
        self.remote_active_seen = false;
        self.remote_error = None;
        self.seen_candidate_keys.clear();
        if let Some(call) = self.call.as_mut() {
            call.session.remote_candidates.clear();
        }
    }

    async fn finish_remote_termination(&mut self) {
        // Whoever observes the terminal status removes the node
        self.submit(WriteOp::Clear);
        self.cleanup().await;
    }

    async fn on_written(&mut self, completion: WriteCompletion) {
        match (&completion.result, completion.kind) {
            (Ok(()), WriteKind::Clear) => {
                if self.awaiting_clear {
                    // Everything on the node from here on belongs to this call
                    self.awaiting_clear = false;
                    self.remote_active_seen = true;
                    self.subscribe_all();
                }
            }
            (Ok(()), _) => {}
            (Err(e), WriteKind::Clear) => {
                tracing::warn!("Failed to clear session node: {}", e);
                if self.awaiting_clear {
                    self.awaiting_clear = false;
                    self.subscribe_all();
                }
            }
            (Err(e), WriteKind::Push) => {
                tracing::warn!("Failed to publish ICE candidate: {}", e);
            }
            (Err(e), WriteKind::Publish) => match completion.path {
                Some(CallPath::Sdp) | Some(CallPath::CallerId) => {
                    tracing::error!(
                        path = ?completion.path,
                        attempts = completion.attempts,
                        "Failed to publish: {}",
                        e
                    );
                    self.fail_call(CallError::Transport(e.clone())).await;
                }
                _ => {
                    tracing::warn!(path = ?completion.path, "Failed to publish: {}", e);
                }
            },
        }
    }

    // ---- timers --------------------------------------------------------

    fn schedule_answer_timeout(&mut self) {
        let Some(timeout) = self.context.config.answer_timeout() else {
            return;
        };
        let Some(tx) = self.commands.upgrade() else {
            return;
        };
        self.answer_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Command::AnswerTimeout);
        }));
    }

    async fn on_answer_timeout(&mut self) {
        self.answer_timer = None;
        let waiting = self.role() == Some(CallRole::Caller)
            && self.machine.status() == CallStatus::Pending
            && self.peer.as_ref().map(|p| p.has_outstanding_offer()).unwrap_or(false);
        if !waiting {
            return;
        }
        let waited_ms = self.context.config.answer_timeout_ms.unwrap_or_default();
        tracing::warn!(waited_ms, "No answer received");
        self.fail_call(CallError::NoAnswer { waited_ms }).await;
    }

    // ---- state ---------------------------------------------------------

    /// Apply a local transition; returns whether the status changed
    fn apply_transition(&mut self, next: CallStatus) -> bool {
        match self.machine.transition(next) {
            Ok(TransitionOutcome::Applied { from, to }) => {
                tracing::info!(from = %from, to = %to, "Call status changed");
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::warn!("Rejected status change: {}", e);
                false
            }
        }
    }

    /// Record a fatal error, tell the peer, and clean up
    async fn fail_call(&mut self, error: CallError) {
        let message = error.user_message();
        tracing::error!(
            conversation = %self.conversation_id().unwrap_or_default(),
            kind = ?error.kind(),
            "Call failed: {}",
            error
        );

        if self.machine.fail(message.clone()).is_applied() {
            // The message must be readable before the status flips
            self.submit(WriteOp::Publish(CallPath::Error, Value::from(message)));
            self.publish_status(CallStatus::Error);
        }
        self.cleanup().await;
    }

    async fn cleanup(&mut self) {
        if self.lifecycle == Lifecycle::Disposed {
            return;
        }
        self.lifecycle = Lifecycle::Disposed;

        if let Some(call) = self.call.as_ref() {
            for (_, handle) in self.subscriptions.drain() {
                call.channel.unsubscribe(&handle);
            }
        }
        if let Some(timer) = self.answer_timer.take() {
            timer.abort();
        }
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        if let Some(mut peer) = self.peer.take() {
            peer.dispose().await;
        }
        if let Some(call) = self.call.as_mut() {
            call.outbox.close();
        }
        self.incoming_offer = None;

        tracing::info!(
            conversation = %self.conversation_id().unwrap_or_default(),
            status = %self.machine.status(),
            "Call cleaned up"
        );
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        let next = CallSnapshot {
            conversation_id: self.conversation_id().map(str::to_string),
            role: self.role(),
            status: self.machine.status(),
            error: self.machine.error().map(str::to_string),
            caller_id: self.call.as_ref().and_then(|c| c.session.caller_id.clone()),
            incoming_offer: self.incoming_offer.is_some() && !self.answered,
            history: self.machine.history().to_vec(),
            local_video: self.peer.as_ref().and_then(|p| p.local_video_track()),
            remote_video: self.peer.as_ref().and_then(|p| p.remote_video_track()),
            disposed: self.lifecycle == Lifecycle::Disposed,
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
