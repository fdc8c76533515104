mod events;
mod machine;

pub use events::{ChannelSink, EventSink, LifecycleEvent, NullSink};
pub use machine::{ApplyMode, UpdateEngine};
