//! Record distribution: the publish seam between the store and its consumers,
//! plus the fan-out manager that pushes records to live subscribers.

pub mod bus;
pub mod fanout;
pub mod in_memory_bus;

pub use bus::{EventPublisher, NullPublisher, PublishError, Subscription};
pub use fanout::{
    ChannelTransport, ConnectionInfo, ConnectionState, FanoutConfig, FanoutError, FanoutManager,
    SubscriberTransport, SubscriptionHandle, TransportError,
};
pub use in_memory_bus::InMemoryEventBus;
