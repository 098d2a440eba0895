//! Session layer
//!
//! Rooms, streams, their wire events, and the process-wide registry that
//! owns them.

pub mod events;
pub mod registry;
pub mod room;
pub mod stream;

pub use registry::Registry;
pub use room::Room;
pub use stream::{Stream, StreamSettings, StreamState, StreamStats};
