//! Progress events: pub/sub bus plus the per-agent connection registry
//! used by streaming transports.

pub mod bus;
pub mod registry;

pub use bus::{EventBus, ExecutionEvent, Subscription};
pub use registry::{ClientId, ClientSink, ConnectionRegistry, forward_to_registry};
