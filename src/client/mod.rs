//! Backend connections and the factory that creates them.
//!
//! # Data Flow
//! ```text
//! ClientFactory::new_connection()
//!     → BackendConnection (one transport, one session)
//!         → exchange(records) ⇄ backend
//!         → close()  (or Drop on cancellation)
//! ```
//!
//! # Design Decisions
//! - No pooling: every request dials a fresh transport
//! - Release happens exactly once; later calls get `Released`
//! - Request ids start at 1 so multiplexing can be layered on later

pub mod connection;
pub mod factory;

pub use connection::{
    BackendConnection, ConnectionError, ConnectionId, ConnectionState, Exchange, ExchangeError,
    Transport,
};
pub use factory::{AddressError, BackendAddress, ClientFactory, DialError, DialFactory};
