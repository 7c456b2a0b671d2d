//! Replicated key-value store on per-slot Paxos consensus.
//!
//! A fixed cell of nodes agrees on a single global sequence of client
//! commands; each node applies the decided commands to its in-memory
//! key-value map strictly in sequence order.

#[macro_use]
mod utils;

mod paxos;
mod server;

pub use utils::{logger_init, Address, Bitmap, PaxosError};

pub use server::{
    LocalHub, Operation, RpcServer, RpcService, StateMachine, TcpTransport,
    Transport,
};

pub use paxos::{
    AcceptRule, Ballot, Command, Replica, ReplicaConfig, RpcReply, RpcRequest,
    Slot, PING_MAGIC,
};
