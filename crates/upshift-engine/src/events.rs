use std::sync::mpsc::Sender;

use upshift_core::UpdateState;

/// Emitted on every state transition of the active update. Collaborators
/// get at most one terminal event per operation, and progress always
/// arrives before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub update_id: String,
    pub old_state: UpdateState,
    pub new_state: UpdateState,
    pub reason_code: Option<i32>,
}

pub trait EventSink {
    fn emit(&self, event: LifecycleEvent);
}

/// Discards events; the default when no one is listening.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: LifecycleEvent) {}
}

/// Forwards events over an mpsc channel. A hung-up receiver is not an
/// error; the update proceeds regardless of who is watching.
pub struct ChannelSink {
    sender: Sender<LifecycleEvent>,
}

impl ChannelSink {
    pub fn new(sender: Sender<LifecycleEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: LifecycleEvent) {
        let _ = self.sender.send(event);
    }
}
