pub mod channel;
pub mod connectivity;
pub mod errors;
pub mod events;
pub mod outbox;
pub mod queries;
pub mod store;
pub mod sync_engine;
pub mod transport;

pub use channel::{ChannelConfig, RealtimeChannel};
pub use connectivity::ConnectivitySignal;
pub use errors::{ClientError, ClientResult};
pub use events::{ClientEvent, EventBus, EventKind, HandlerId};
pub use outbox::Outbox;
pub use store::{EntityStore, IndexKey, StoreConfig};
pub use sync_engine::{DrainReport, SyncConfig, SyncEngine};
pub use transport::{BearerToken, HttpTransport, SyncTransport};
