//! Typed session events and the dispatch subsystem.
//!
//! Inbound `session.event` notifications are decoded into [`SessionEvent`]
//! by discriminator string and fanned out to subscribers. Dispatch for a
//! single event is sequential and synchronous with respect to the receive
//! path: generic subscribers run first, then subscribers filtered on the
//! event's kind, each set in registration order. A panicking subscriber is
//! handled according to the configured [`EventErrorPolicy`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{
    Arc, RwLock, Weak,
    atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, trace, warn};

use crate::util::{read as read_lock, write as write_lock};

/// Controls dispatch behavior when a subscriber panics.
///
/// The error hook (if any) is invoked regardless of the policy; the policy
/// only decides whether the remaining subscribers still run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EventErrorPolicy {
    /// Report the failure and continue with the remaining subscribers.
    #[default]
    Suppress,
    /// Report the failure and abort dispatch of this event. Subsequent
    /// events dispatch normally.
    Propagate,
}

/// Discriminator of a [`SessionEvent`], usable as a subscription filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `session.start`
    SessionStart,
    /// `session.idle`
    SessionIdle,
    /// `session.error`
    SessionError,
    /// `session.shutdown`
    SessionShutdown,
    /// `session.task_complete`
    SessionTaskComplete,
    /// `session.context_changed`
    SessionContextChanged,
    /// `assistant.message`
    AssistantMessage,
    /// `assistant.streaming_delta`
    AssistantStreamingDelta,
    /// `tool.execution_start`
    ToolExecutionStart,
    /// `tool.execution_complete`
    ToolExecutionComplete,
    /// `tool.execution_progress`
    ToolExecutionProgress,
    /// `skill.invoked`
    SkillInvoked,
    /// Any discriminator this SDK does not recognize.
    Unknown,
}

impl EventKind {
    /// The wire discriminator for this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStart => "session.start",
            Self::SessionIdle => "session.idle",
            Self::SessionError => "session.error",
            Self::SessionShutdown => "session.shutdown",
            Self::SessionTaskComplete => "session.task_complete",
            Self::SessionContextChanged => "session.context_changed",
            Self::AssistantMessage => "assistant.message",
            Self::AssistantStreamingDelta => "assistant.streaming_delta",
            Self::ToolExecutionStart => "tool.execution_start",
            Self::ToolExecutionComplete => "tool.execution_complete",
            Self::ToolExecutionProgress => "tool.execution_progress",
            Self::SkillInvoked => "skill.invoked",
            Self::Unknown => "unknown",
        }
    }
}

/// Payload of `session.start`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionStartData {
    /// Id of the session that started.
    pub session_id: Option<String>,
    /// Component that produced the event.
    pub producer: Option<String>,
    /// Model selected for the session.
    pub selected_model: Option<String>,
    /// Event schema version.
    pub version: Option<f64>,
}

/// Payload of `session.error`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionErrorData {
    /// Error category reported by the server.
    pub error_type: Option<String>,
    /// Human-readable message.
    pub message: Option<String>,
    /// Server-side stack trace, if the server chose to include one.
    pub stack: Option<String>,
    /// HTTP status for provider-originated failures.
    pub status_code: Option<i64>,
}

/// Payload of `session.shutdown`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionShutdownData {
    /// Whether the shutdown was routine or caused by an error.
    pub shutdown_type: Option<String>,
    /// Failure detail for error shutdowns.
    pub error_reason: Option<String>,
    /// Model active when the session shut down.
    pub current_model: Option<String>,
}

/// Payload of `session.task_complete`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionTaskCompleteData {
    /// Summary of the completed task.
    pub summary: Option<String>,
}

/// Payload of `session.context_changed`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionContextChangedData {
    /// New working directory.
    pub cwd: Option<String>,
    /// Git repository root, if inside one.
    pub git_root: Option<String>,
    /// Repository slug.
    pub repository: Option<String>,
    /// Checked-out branch.
    pub branch: Option<String>,
}

/// Payload of `assistant.message`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssistantMessageData {
    /// Id of the assistant message.
    pub message_id: Option<String>,
    /// Full message content.
    pub content: Option<String>,
}

/// Payload of `assistant.streaming_delta`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssistantStreamingDeltaData {
    /// Id of the message being streamed.
    pub message_id: Option<String>,
    /// Incremental content chunk.
    pub delta: Option<String>,
    /// Running size of the full response.
    pub total_response_size_bytes: Option<f64>,
}

/// Payload of `tool.execution_start`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolExecutionStartData {
    /// Correlation id of the tool call.
    pub tool_call_id: Option<String>,
    /// Name of the tool being executed.
    pub tool_name: Option<String>,
}

/// Payload of `tool.execution_complete`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolExecutionCompleteData {
    /// Correlation id of the tool call.
    pub tool_call_id: Option<String>,
    /// Whether the execution succeeded.
    pub success: Option<bool>,
}

/// Payload of `tool.execution_progress`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolExecutionProgressData {
    /// Correlation id of the tool call.
    pub tool_call_id: Option<String>,
    /// Progress description.
    pub progress_message: Option<String>,
}

/// Payload of `skill.invoked`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SkillInvokedData {
    /// Name of the skill.
    pub name: Option<String>,
    /// Path the skill was loaded from.
    pub path: Option<String>,
    /// Skill content handed to the model.
    pub content: Option<String>,
}

/// A server-pushed session event, keyed by its `type` discriminator.
///
/// Produced only by decoding inbound notifications; immutable once
/// constructed. Unrecognized discriminators decode to
/// [`SessionEvent::Unknown`] so new server event types never break the
/// receive path.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session started.
    SessionStart(SessionStartData),
    /// The session became idle.
    SessionIdle,
    /// The session reported an error.
    SessionError(SessionErrorData),
    /// The session shut down.
    SessionShutdown(SessionShutdownData),
    /// A task finished.
    SessionTaskComplete(SessionTaskCompleteData),
    /// The working context changed.
    SessionContextChanged(SessionContextChangedData),
    /// The assistant produced a complete message.
    AssistantMessage(AssistantMessageData),
    /// The assistant streamed an incremental chunk.
    AssistantStreamingDelta(AssistantStreamingDeltaData),
    /// A tool execution began.
    ToolExecutionStart(ToolExecutionStartData),
    /// A tool execution finished.
    ToolExecutionComplete(ToolExecutionCompleteData),
    /// A tool execution reported progress.
    ToolExecutionProgress(ToolExecutionProgressData),
    /// A skill was invoked.
    SkillInvoked(SkillInvokedData),
    /// An event this SDK does not recognize.
    Unknown {
        /// The raw discriminator.
        event_type: String,
        /// The raw payload.
        data: Value,
    },
}

impl SessionEvent {
    /// Decode a wire event by its discriminator.
    ///
    /// Unrecognized discriminators and payloads that fail to decode fall
    /// back to [`SessionEvent::Unknown`].
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let event_type = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let data = value.get("data").cloned().unwrap_or(Value::Null);

        let decoded = match event_type.as_str() {
            "session.start" => decode_data(&data).map(Self::SessionStart),
            "session.idle" => Ok(Self::SessionIdle),
            "session.error" => decode_data(&data).map(Self::SessionError),
            "session.shutdown" => decode_data(&data).map(Self::SessionShutdown),
            "session.task_complete" => decode_data(&data).map(Self::SessionTaskComplete),
            "session.context_changed" => decode_data(&data).map(Self::SessionContextChanged),
            "assistant.message" => decode_data(&data).map(Self::AssistantMessage),
            "assistant.streaming_delta" => decode_data(&data).map(Self::AssistantStreamingDelta),
            "tool.execution_start" => decode_data(&data).map(Self::ToolExecutionStart),
            "tool.execution_complete" => decode_data(&data).map(Self::ToolExecutionComplete),
            "tool.execution_progress" => decode_data(&data).map(Self::ToolExecutionProgress),
            "skill.invoked" => decode_data(&data).map(Self::SkillInvoked),
            _ => return Self::Unknown { event_type, data },
        };

        decoded.unwrap_or_else(|error| {
            warn!(event_type, %error, "event payload did not match its declared type");
            Self::Unknown { event_type, data }
        })
    }

    /// The discriminator of this event.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::SessionStart(_) => EventKind::SessionStart,
            Self::SessionIdle => EventKind::SessionIdle,
            Self::SessionError(_) => EventKind::SessionError,
            Self::SessionShutdown(_) => EventKind::SessionShutdown,
            Self::SessionTaskComplete(_) => EventKind::SessionTaskComplete,
            Self::SessionContextChanged(_) => EventKind::SessionContextChanged,
            Self::AssistantMessage(_) => EventKind::AssistantMessage,
            Self::AssistantStreamingDelta(_) => EventKind::AssistantStreamingDelta,
            Self::ToolExecutionStart(_) => EventKind::ToolExecutionStart,
            Self::ToolExecutionComplete(_) => EventKind::ToolExecutionComplete,
            Self::ToolExecutionProgress(_) => EventKind::ToolExecutionProgress,
            Self::SkillInvoked(_) => EventKind::SkillInvoked,
            Self::Unknown { .. } => EventKind::Unknown,
        }
    }

    /// Content of an assistant message, if this is one.
    #[must_use]
    pub fn assistant_message_content(&self) -> Option<&str> {
        match self {
            Self::AssistantMessage(data) => data.content.as_deref(),
            _ => None,
        }
    }
}

fn decode_data<T>(data: &Value) -> Result<T, serde_json::Error>
where
    T: serde::de::DeserializeOwned + Default,
{
    // Events may arrive with no data member at all.
    if data.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(data.clone())
}

type EventCallback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&SessionEvent, &str) + Send + Sync>;

struct SubscriberEntry {
    id: u64,
    filter: Option<EventKind>,
    callback: EventCallback,
}

/// Fans decoded events out to generic and kind-filtered subscribers.
///
/// Subscriptions may be added and removed concurrently with dispatch;
/// removal during an in-flight dispatch never panics and never skips
/// unrelated entries.
#[derive(Default)]
pub struct EventDispatcher {
    subscribers: RwLock<Vec<SubscriberEntry>>,
    next_id: AtomicU64,
    policy: RwLock<EventErrorPolicy>,
    error_hook: RwLock<Option<ErrorHook>>,
}

impl EventDispatcher {
    /// Create an empty dispatcher with the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for every event.
    pub fn subscribe_all(
        self: &Arc<Self>,
        callback: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.register(None, Arc::new(callback))
    }

    /// Register a callback for events of one kind.
    pub fn subscribe_kind(
        self: &Arc<Self>,
        kind: EventKind,
        callback: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.register(Some(kind), Arc::new(callback))
    }

    fn register(self: &Arc<Self>, filter: Option<EventKind>, callback: EventCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        write_lock(&self.subscribers).push(SubscriberEntry {
            id,
            filter,
            callback,
        });
        Subscription {
            id,
            dispatcher: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        write_lock(&self.subscribers).retain(|entry| entry.id != id);
    }

    /// Drop every subscription. Used by session teardown.
    pub fn clear(&self) {
        write_lock(&self.subscribers).clear();
    }

    /// Set the dispatch error policy.
    pub fn set_policy(&self, policy: EventErrorPolicy) {
        *write_lock(&self.policy) = policy;
    }

    /// Current dispatch error policy.
    #[must_use]
    pub fn policy(&self) -> EventErrorPolicy {
        *read_lock(&self.policy)
    }

    /// Install the error hook invoked when a subscriber panics.
    pub fn set_error_hook(
        &self,
        hook: impl Fn(&SessionEvent, &str) + Send + Sync + 'static,
    ) {
        *write_lock(&self.error_hook) = Some(Arc::new(hook));
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        read_lock(&self.subscribers).len()
    }

    /// Whether no subscriptions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        read_lock(&self.subscribers).is_empty()
    }

    /// Deliver one event: generic subscribers in registration order, then
    /// matching kind-filtered subscribers in registration order.
    ///
    /// Long-running callbacks stall delivery of subsequent events; that is
    /// the contract, not a defect.
    pub fn dispatch(&self, event: &SessionEvent) {
        let kind = event.kind();
        trace!(event_type = kind.as_str(), "dispatching event");

        let snapshot: Vec<(u64, EventCallback)> = {
            let subscribers = read_lock(&self.subscribers);
            let generic = subscribers
                .iter()
                .filter(|entry| entry.filter.is_none());
            let typed = subscribers
                .iter()
                .filter(|entry| entry.filter == Some(kind));
            generic
                .chain(typed)
                .map(|entry| (entry.id, Arc::clone(&entry.callback)))
                .collect()
        };

        let hook = read_lock(&self.error_hook).clone();
        let policy = self.policy();

        for (id, callback) in snapshot {
            // A subscription closed since the snapshot is skipped; one
            // removed mid-dispatch may already be past this check.
            if !read_lock(&self.subscribers).iter().any(|e| e.id == id) {
                continue;
            }
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (callback.as_ref())(event))) {
                let detail = panic_detail(panic.as_ref());
                warn!(event_type = kind.as_str(), detail, "event subscriber panicked");
                if let Some(hook) = &hook {
                    if catch_unwind(AssertUnwindSafe(|| (hook.as_ref())(event, &detail))).is_err() {
                        error!("event error hook panicked; aborting dispatch for this event");
                        return;
                    }
                }
                if policy == EventErrorPolicy::Propagate {
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscribers", &self.len())
            .field("policy", &self.policy())
            .finish_non_exhaustive()
    }
}

fn panic_detail(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "subscriber panicked".to_string()
    }
}

/// Handle to a registered event callback.
///
/// Calling [`Subscription::unsubscribe`] guarantees the callback is not
/// invoked for any event dispatched afterward. Dropping the handle does
/// *not* unsubscribe; subscriptions are detachable.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    dispatcher: Weak<EventDispatcher>,
}

impl Subscription {
    /// Remove the callback from the dispatcher.
    pub fn unsubscribe(&self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.unsubscribe(self.id);
        }
    }
}
