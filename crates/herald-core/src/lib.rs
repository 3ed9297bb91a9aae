pub mod codec;
pub mod directory;
pub mod events;
pub mod ids;

pub use events::{Event, EventType, OutboundFrame};
