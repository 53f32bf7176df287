pub mod api;
pub mod connection;
pub mod coordinator;
pub mod session;
pub mod store;
pub mod transport;

pub use api::{Api, HttpApi};
pub use connection::{ConnectionManager, ConnectionState, SubscriberId};
pub use coordinator::{FetchCoordinator, WriteOutcome};
pub use session::Session;
pub use store::{Begin, Chat, Graph, Logs, Projects, Resource, Store, Ticket, User};
pub use transport::{ChannelTransport, Link, LinkEvent, RemoteEnd, Transport, WsTransport};
