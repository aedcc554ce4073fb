pub mod bus;
pub mod envelope;
pub mod filter;
pub mod sink;
pub mod stream;

pub use bus::{BusMetrics, EventBus, EventScope};
pub use envelope::{AgentEvent, EventType};
pub use filter::EventFilter;
pub use sink::{ChannelSink, EventSink, JsonlSink, MemorySink, TracingSink};
pub use stream::EventSubscription;
