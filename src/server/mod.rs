//! Server-side building blocks: the key-value state machine and the
//! node-to-node transport layer.

mod statemach;
mod transport;

pub use statemach::{Operation, StateMachine};
pub use transport::{LocalHub, RpcServer, RpcService, TcpTransport, Transport};
