//! Gateway server implementation

pub mod dispatch;
pub mod listener;
pub mod router;
mod server;

pub use dispatch::{AUTHENTICATION_HEADER, CLIENT_HEADER, Dispatcher, ForwardingDispatcher};
pub use listener::{PeerInfo, TlsListener};
pub use router::{AppState, ERROR_HEADER, create_router, fault_response};
pub use server::{BoundGateway, Gateway};
