//! Client library for GRASP, a knowledge graph question answering backend.
//!
//! The crate is organized around a synchronous session core and thin async
//! edges. [`session::SessionController`] owns all conversation state and is
//! driven by a single dispatch loop; [`transport::Transport`] carries raw
//! frames over the live WebSocket; [`api::ApiClient`] and
//! [`share::ShareClient`] cover the HTTP endpoints; [`store::Store`]
//! persists settings and the restorable conversation on disk.

pub mod api;
pub mod bootstrap;
pub mod endpoint;
pub mod protocol;
pub mod session;
pub mod share;
pub mod store;
pub mod transport;

pub use endpoint::Endpoint;
pub use protocol::{Event, QueryInput, RequestFrame, Task};
pub use session::{RunState, SessionController, SessionError};
pub use transport::{ConnectionState, Transport, TransportEvent};
