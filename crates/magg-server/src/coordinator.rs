//! Notification coordinator: fan-in from backends, fan-out to sessions.
//!
//! Backends (and the mount engine, for synthetic events) publish
//! [`NotificationEnvelope`]s here. The coordinator classifies them:
//!
//! - list-change kinds are coalesced per kind within a short window, so each
//!   session sees at most one `tools_changed` per window no matter how many
//!   backends fired;
//! - targeted kinds (`resource_updated`, `progress`, `cancelled`) are routed
//!   1:1 to the sessions that subscribed to the resource or issued the
//!   progress token, and are never dropped;
//! - log kinds pass through a per-backend token bucket.
//!
//! Every session has its own queue drained by its own send loop; a slow
//! client stalls only itself. When a queue exceeds its threshold the oldest
//! list-change entries are dropped first — a later coalesced one supersedes
//! them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use magg_core::{NotificationEnvelope, NotificationKind};

/// Coalesce window for list-change kinds and the dedup horizon.
pub const COALESCE_WINDOW: Duration = Duration::from_millis(50);

/// Queue depth at which list-change entries start being shed.
pub const SESSION_QUEUE_THRESHOLD: usize = 256;

/// Session identifier, unique per process.
pub type SessionId = u64;

/// A notification ready to leave the aggregator, as (method, params).
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundNotification {
    pub method: String,
    pub params: Option<serde_json::Value>,
}

impl OutboundNotification {
    fn from_envelope(envelope: &NotificationEnvelope) -> Self {
        let params = if envelope.kind.is_list_change() {
            None
        } else {
            Some(envelope.payload.clone())
        };
        Self {
            method: envelope.kind.method().to_string(),
            params,
        }
    }
}

/// Single-producer single-consumer session queue with list-change shedding.
#[derive(Debug, Default)]
struct SessionQueue {
    entries: Mutex<VecDeque<OutboundNotification>>,
    ready: Notify,
    closed: Mutex<bool>,
}

impl SessionQueue {
    fn push(&self, item: OutboundNotification, droppable: bool) {
        let mut entries = self.entries.lock().expect("poisoned");
        if entries.len() >= SESSION_QUEUE_THRESHOLD {
            // Shed the oldest list-change first; targeted entries survive.
            let victim = entries
                .iter()
                .position(|n| NotificationKind::from_method(&n.method)
                    .is_some_and(NotificationKind::is_list_change));
            match victim {
                Some(idx) => {
                    entries.remove(idx);
                }
                None if droppable => {
                    // The queue is all targeted traffic; shed the newcomer.
                    return;
                }
                None => {}
            }
        }
        entries.push_back(item);
        drop(entries);
        self.ready.notify_one();
    }

    async fn pop(&self) -> Option<OutboundNotification> {
        loop {
            {
                let mut entries = self.entries.lock().expect("poisoned");
                if let Some(item) = entries.pop_front() {
                    return Some(item);
                }
                if *self.closed.lock().expect("poisoned") {
                    return None;
                }
            }
            self.ready.notified().await;
        }
    }

    fn close(&self) {
        *self.closed.lock().expect("poisoned") = true;
        self.ready.notify_waiters();
    }
}

/// Consumer half of a session's notification queue.
pub struct SessionReceiver {
    queue: Arc<SessionQueue>,
}

impl SessionReceiver {
    /// Next notification for this session; `None` after detach.
    pub async fn recv(&mut self) -> Option<OutboundNotification> {
        self.queue.pop().await
    }
}

/// Token bucket for log-kind notifications, one per backend.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    burst: f64,
    per_second: f64,
    refreshed: Instant,
}

impl TokenBucket {
    fn new(burst: u32, per_second: u32) -> Self {
        Self {
            tokens: f64::from(burst),
            burst: f64::from(burst),
            per_second: f64::from(per_second),
            refreshed: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.refreshed).as_secs_f64();
        self.refreshed = now;
        self.tokens = (self.tokens + elapsed * self.per_second).min(self.burst);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
struct CoalesceState {
    /// Kinds waiting for the current window to flush.
    pending: HashSet<NotificationKind>,
    /// Whether a flush task is scheduled.
    flush_scheduled: bool,
    /// Digests seen within the current horizon, for dropping duplicates.
    recent: HashMap<[u8; 32], Instant>,
}

struct SessionEntry {
    queue: Arc<SessionQueue>,
}

/// The coordinator. Cheap to clone via `Arc`.
pub struct NotificationCoordinator {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    next_session: AtomicU64,
    coalesce: Mutex<CoalesceState>,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    /// Resource URI → subscribed sessions.
    subscriptions: Mutex<HashMap<String, HashSet<SessionId>>>,
    /// Progress token → issuing session.
    progress_tokens: Mutex<HashMap<String, SessionId>>,
    /// `(backend, outbound request id)` → session the request was issued
    /// for; routes backend-originated `cancelled` notifications.
    cancel_targets: Mutex<HashMap<(String, i64), SessionId>>,
    log_rate: (u32, u32),
    window: Duration,
}

impl NotificationCoordinator {
    #[must_use]
    pub fn new(log_rate: (u32, u32)) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            coalesce: Mutex::new(CoalesceState::default()),
            buckets: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            progress_tokens: Mutex::new(HashMap::new()),
            cancel_targets: Mutex::new(HashMap::new()),
            log_rate,
            window: COALESCE_WINDOW,
        })
    }

    /// Attach a client session; returns its id and queue consumer.
    pub fn attach(&self) -> (SessionId, SessionReceiver) {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SessionQueue::default());
        self.sessions
            .lock()
            .expect("poisoned")
            .insert(id, SessionEntry { queue: Arc::clone(&queue) });
        (id, SessionReceiver { queue })
    }

    /// Detach a session: its queue closes and its subscriptions vanish.
    pub fn detach(&self, id: SessionId) {
        if let Some(entry) = self.sessions.lock().expect("poisoned").remove(&id) {
            entry.queue.close();
        }
        for subscribers in self.subscriptions.lock().expect("poisoned").values_mut() {
            subscribers.remove(&id);
        }
        self.progress_tokens
            .lock()
            .expect("poisoned")
            .retain(|_, owner| *owner != id);
        self.cancel_targets
            .lock()
            .expect("poisoned")
            .retain(|_, owner| *owner != id);
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("poisoned").len()
    }

    /// Record a session's interest in a resource URI.
    pub fn subscribe_resource(&self, session: SessionId, uri: &str) {
        self.subscriptions
            .lock()
            .expect("poisoned")
            .entry(uri.to_string())
            .or_default()
            .insert(session);
    }

    pub fn unsubscribe_resource(&self, session: SessionId, uri: &str) {
        let mut subs = self.subscriptions.lock().expect("poisoned");
        if let Some(set) = subs.get_mut(uri) {
            set.remove(&session);
            if set.is_empty() {
                subs.remove(uri);
            }
        }
    }

    /// Record which session issued a progress token.
    pub fn register_progress_token(&self, session: SessionId, token: &str) {
        self.progress_tokens
            .lock()
            .expect("poisoned")
            .insert(token.to_string(), session);
    }

    pub fn release_progress_token(&self, token: &str) {
        self.progress_tokens.lock().expect("poisoned").remove(token);
    }

    /// Record which session a request issued toward a backend belongs to,
    /// keyed by the backend name and our outbound request id.
    pub fn register_cancel_target(&self, session: SessionId, backend: &str, request_id: i64) {
        self.cancel_targets
            .lock()
            .expect("poisoned")
            .insert((backend.to_string(), request_id), session);
    }

    pub fn release_cancel_target(&self, backend: &str, request_id: i64) {
        self.cancel_targets
            .lock()
            .expect("poisoned")
            .remove(&(backend.to_string(), request_id));
    }

    /// Ingest one envelope from a backend or from the aggregator itself.
    pub fn ingest(self: &Arc<Self>, envelope: NotificationEnvelope) {
        if envelope.kind.is_list_change() {
            self.ingest_list_change(envelope.kind);
            return;
        }

        // Identical payloads within the window are duplicates.
        if self.is_duplicate(&envelope) {
            tracing::trace!(
                source = %envelope.source_server,
                kind = ?envelope.kind,
                "dropping duplicate notification"
            );
            return;
        }

        match envelope.kind {
            NotificationKind::Log => self.ingest_log(envelope),
            NotificationKind::ResourceUpdated => self.ingest_resource_updated(&envelope),
            NotificationKind::Progress => self.ingest_progress(&envelope),
            NotificationKind::Cancelled => self.ingest_cancelled(&envelope),
            _ => unreachable!("list-change kinds handled above"),
        }
    }

    fn ingest_list_change(self: &Arc<Self>, kind: NotificationKind) {
        let mut state = self.coalesce.lock().expect("poisoned");
        state.pending.insert(kind);
        if state.flush_scheduled {
            return;
        }
        state.flush_scheduled = true;
        drop(state);

        let coordinator = Arc::clone(self);
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            coordinator.flush_list_changes();
        });
    }

    fn flush_list_changes(&self) {
        let pending: Vec<NotificationKind> = {
            let mut state = self.coalesce.lock().expect("poisoned");
            state.flush_scheduled = false;
            state.pending.drain().collect()
        };

        let sessions = self.sessions.lock().expect("poisoned");
        for kind in pending {
            let outbound = OutboundNotification {
                method: kind.method().to_string(),
                params: None,
            };
            for entry in sessions.values() {
                entry.queue.push(outbound.clone(), true);
            }
        }
    }

    fn is_duplicate(&self, envelope: &NotificationEnvelope) -> bool {
        let digest = envelope.digest();
        let now = Instant::now();
        let mut state = self.coalesce.lock().expect("poisoned");
        state.recent.retain(|_, seen| now.duration_since(*seen) < self.window);
        match state.recent.get(&digest) {
            Some(_) => true,
            None => {
                state.recent.insert(digest, now);
                false
            }
        }
    }

    fn ingest_log(&self, envelope: NotificationEnvelope) {
        let allowed = self
            .buckets
            .lock()
            .expect("poisoned")
            .entry(envelope.source_server.clone())
            .or_insert_with(|| TokenBucket::new(self.log_rate.0, self.log_rate.1))
            .try_take();

        if !allowed {
            tracing::trace!(source = %envelope.source_server, "log notification rate-limited");
            return;
        }
        self.fan_out_all(&envelope, true);
    }

    fn ingest_resource_updated(&self, envelope: &NotificationEnvelope) {
        let uri = envelope
            .payload
            .get("uri")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let targets: Vec<SessionId> = self
            .subscriptions
            .lock()
            .expect("poisoned")
            .get(&uri)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        self.fan_out_to(&targets, envelope);
    }

    fn ingest_progress(&self, envelope: &NotificationEnvelope) {
        let token = envelope
            .payload
            .get("progressToken")
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();

        let target = self
            .progress_tokens
            .lock()
            .expect("poisoned")
            .get(&token)
            .copied();

        match target {
            Some(session) => self.fan_out_to(&[session], envelope),
            // Unclaimed token: nobody asked, nobody hears.
            None => tracing::trace!(token = %token, "progress for unknown token"),
        }
    }

    /// A backend cancelled (or acknowledged cancellation of) one of our
    /// outbound requests; only the session that request was issued for
    /// hears about it.
    fn ingest_cancelled(&self, envelope: &NotificationEnvelope) {
        let Some(request_id) = cancelled_request_id(&envelope.payload) else {
            tracing::trace!(source = %envelope.source_server, "cancelled without requestId");
            return;
        };

        let target = self
            .cancel_targets
            .lock()
            .expect("poisoned")
            .remove(&(envelope.source_server.clone(), request_id));

        match target {
            Some(session) => self.fan_out_to(&[session], envelope),
            None => tracing::trace!(
                source = %envelope.source_server,
                request_id,
                "cancelled for unknown request"
            ),
        }
    }

    fn fan_out_all(&self, envelope: &NotificationEnvelope, droppable: bool) {
        let outbound = OutboundNotification::from_envelope(envelope);
        let sessions = self.sessions.lock().expect("poisoned");
        for entry in sessions.values() {
            entry.queue.push(outbound.clone(), droppable);
        }
    }

    fn fan_out_to(&self, targets: &[SessionId], envelope: &NotificationEnvelope) {
        let outbound = OutboundNotification::from_envelope(envelope);
        let sessions = self.sessions.lock().expect("poisoned");
        for id in targets {
            if let Some(entry) = sessions.get(id) {
                entry.queue.push(outbound.clone(), false);
            }
        }
    }
}

/// The `requestId` of a cancelled notification, numeric or stringly.
fn cancelled_request_id(payload: &serde_json::Value) -> Option<i64> {
    match payload.get("requestId")? {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(kind: NotificationKind, payload: serde_json::Value) -> NotificationEnvelope {
        NotificationEnvelope::new("backend", kind, payload)
    }

    async fn drain_within(
        rx: &mut SessionReceiver,
        budget: Duration,
    ) -> Vec<OutboundNotification> {
        let mut seen = Vec::new();
        let deadline = tokio::time::sleep(budget);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(n) => seen.push(n),
                    None => break,
                },
                () = &mut deadline => break,
            }
        }
        seen
    }

    #[tokio::test]
    async fn list_changes_coalesce_to_one_per_kind() {
        let coordinator = NotificationCoordinator::new((20, 10));
        let (_id, mut rx) = coordinator.attach();

        // A burst from many backends within one window.
        for _ in 0..10 {
            coordinator.ingest(envelope(NotificationKind::ToolsChanged, json!({})));
        }
        coordinator.ingest(envelope(NotificationKind::PromptsChanged, json!({})));

        let seen = drain_within(&mut rx, Duration::from_millis(200)).await;
        let tools = seen
            .iter()
            .filter(|n| n.method == "notifications/tools/list_changed")
            .count();
        let prompts = seen
            .iter()
            .filter(|n| n.method == "notifications/prompts/list_changed")
            .count();
        assert_eq!(tools, 1);
        assert_eq!(prompts, 1);
    }

    #[tokio::test]
    async fn targeted_progress_reaches_only_the_issuer() {
        let coordinator = NotificationCoordinator::new((20, 10));
        let (issuer, mut issuer_rx) = coordinator.attach();
        let (_other, mut other_rx) = coordinator.attach();

        coordinator.register_progress_token(issuer, "tok-1");
        coordinator.ingest(envelope(
            NotificationKind::Progress,
            json!({"progressToken": "tok-1", "progress": 3}),
        ));

        let got = drain_within(&mut issuer_rx, Duration::from_millis(100)).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].method, "notifications/progress");

        let other_got = drain_within(&mut other_rx, Duration::from_millis(100)).await;
        assert!(other_got.is_empty());
    }

    #[tokio::test]
    async fn cancelled_reaches_only_the_requesting_session() {
        let coordinator = NotificationCoordinator::new((20, 10));
        let (requester, mut requester_rx) = coordinator.attach();
        let (_other, mut other_rx) = coordinator.attach();

        coordinator.register_cancel_target(requester, "backend", 42);
        coordinator.ingest(envelope(
            NotificationKind::Cancelled,
            json!({"requestId": 42, "reason": "backend gave up"}),
        ));

        let got = drain_within(&mut requester_rx, Duration::from_millis(100)).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].method, "notifications/cancelled");
        assert!(drain_within(&mut other_rx, Duration::from_millis(100))
            .await
            .is_empty());

        // The target is consumed on delivery; a repeat goes nowhere.
        coordinator.ingest(envelope(
            NotificationKind::Cancelled,
            json!({"requestId": 42, "reason": "still gone"}),
        ));
        assert!(drain_within(&mut requester_rx, Duration::from_millis(100))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn unregistered_cancelled_is_dropped() {
        let coordinator = NotificationCoordinator::new((20, 10));
        let (_id, mut rx) = coordinator.attach();

        coordinator.ingest(envelope(
            NotificationKind::Cancelled,
            json!({"requestId": 7}),
        ));
        assert!(drain_within(&mut rx, Duration::from_millis(100)).await.is_empty());
    }

    #[test]
    fn cancelled_request_id_accepts_both_encodings() {
        assert_eq!(cancelled_request_id(&json!({"requestId": 5})), Some(5));
        assert_eq!(cancelled_request_id(&json!({"requestId": "5"})), Some(5));
        assert_eq!(cancelled_request_id(&json!({"requestId": true})), None);
        assert_eq!(cancelled_request_id(&json!({})), None);
    }

    #[tokio::test]
    async fn resource_updates_follow_subscriptions() {
        let coordinator = NotificationCoordinator::new((20, 10));
        let (subscriber, mut sub_rx) = coordinator.attach();
        let (_bystander, mut other_rx) = coordinator.attach();

        coordinator.subscribe_resource(subscriber, "file:///tmp/x");
        coordinator.ingest(envelope(
            NotificationKind::ResourceUpdated,
            json!({"uri": "file:///tmp/x"}),
        ));

        let got = drain_within(&mut sub_rx, Duration::from_millis(100)).await;
        assert_eq!(got.len(), 1);
        assert!(drain_within(&mut other_rx, Duration::from_millis(100))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn duplicate_payloads_within_window_are_dropped() {
        let coordinator = NotificationCoordinator::new((20, 10));
        let (id, mut rx) = coordinator.attach();
        coordinator.subscribe_resource(id, "file:///a");

        let payload = json!({"uri": "file:///a"});
        coordinator.ingest(envelope(NotificationKind::ResourceUpdated, payload.clone()));
        coordinator.ingest(envelope(NotificationKind::ResourceUpdated, payload));

        let got = drain_within(&mut rx, Duration::from_millis(100)).await;
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn log_notifications_are_rate_limited() {
        let coordinator = NotificationCoordinator::new((2, 1));
        let (_id, mut rx) = coordinator.attach();

        for i in 0..10 {
            coordinator.ingest(envelope(
                NotificationKind::Log,
                json!({"level": "info", "data": i}),
            ));
        }

        let got = drain_within(&mut rx, Duration::from_millis(100)).await;
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn detach_closes_the_queue() {
        let coordinator = NotificationCoordinator::new((20, 10));
        let (id, mut rx) = coordinator.attach();
        coordinator.detach(id);
        assert!(rx.recv().await.is_none());
        assert_eq!(coordinator.session_count(), 0);
    }

    #[test]
    fn queue_sheds_oldest_list_change_first() {
        let queue = SessionQueue::default();
        // Fill to the threshold with alternating kinds.
        for i in 0..SESSION_QUEUE_THRESHOLD {
            let method = if i == 0 {
                "notifications/tools/list_changed".to_string()
            } else {
                "notifications/progress".to_string()
            };
            queue.push(
                OutboundNotification {
                    method,
                    params: None,
                },
                false,
            );
        }

        // One more: the single list-change at the head is the victim.
        queue.push(
            OutboundNotification {
                method: "notifications/progress".to_string(),
                params: None,
            },
            false,
        );

        let entries = queue.entries.lock().unwrap();
        assert_eq!(entries.len(), SESSION_QUEUE_THRESHOLD);
        assert!(entries
            .iter()
            .all(|n| n.method == "notifications/progress"));
    }
}
