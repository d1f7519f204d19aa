pub mod channel;
pub mod error;
pub mod events;
pub mod ownership;
pub mod registry;
pub mod rooms;
pub mod router;

pub use channel::{channel_name, PublishRequest, RoutingChannel};
pub use error::{Error, Result};
pub use events::{PushEnvelope, PushMessage, RoutedEvent};
pub use ownership::OwnershipManager;
pub use registry::{ConversationRegistry, MemoryRegistry, RedisRegistry};
pub use rooms::{ConnectionId, EventSender, RoomHub, Subscriber};
pub use router::{EventRouter, RouteOutcome};
