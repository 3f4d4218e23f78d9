//! Content lifecycle events: the typed event model, the in-process bus and
//! the bridge that turns events into workflow transitions.

pub mod bridge;
pub mod bus;
pub mod types;

pub use bridge::{BridgeOutcome, EventBridge};
pub use bus::{EventBus, EventHandler, InProcessEventBus};
pub use types::{ContentEvent, Topic};
