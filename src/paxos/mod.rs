//! Replication protocol: per-slot Paxos.
//!
//! Every slot of the global command sequence runs its own single-decree
//! Paxos instance. Any member of the cell may propose; each Propose call
//! runs both phases from scratch against all members (itself included) and
//! keeps retrying with higher ballots until the submitted command has been
//! decided in some slot. Decided commands are applied to the key-value state
//! machine strictly in slot order. There is no persistent log.

mod acceptor;
mod learner;
mod proposer;
mod request;
mod slots;

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::server::{RpcService, StateMachine, Transport};
use crate::utils::{Address, PaxosError};

use async_trait::async_trait;

use rand::Rng;

use serde::{Deserialize, Serialize};

use tokio::sync::{oneshot, watch, Mutex};

use slots::SlotStore;

pub use request::PING_MAGIC;

/// Rule an acceptor uses to judge an incoming Accept against the ballot it
/// has promised for that slot.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceptRule {
    /// Accept iff the incoming ballot is not lower than the promised one,
    /// then raise the promise to it.
    Strict,

    /// Accept iff the incoming ballot is not higher than the promised one,
    /// or nothing has been promised yet. Promise is left untouched.
    // NOTE: this admits stale ballots and can decide two different values
    // for one slot under contention; kept only for compatibility.
    Relaxed,
}

/// Configuration parameters struct.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Initial proposer backoff after a failed round in millisecs.
    pub backoff_init_ms: u64,

    /// Upper bound of the doubling proposer backoff in millisecs.
    pub backoff_max_ms: u64,

    /// Simulated one-way latency around each peer call in millisecs; the
    /// actual delay is drawn from `[l, 2l]`. 0 disables it.
    pub sim_latency_ms: u64,

    /// Acceptor rule for Accept requests.
    pub accept_rule: AcceptRule,

    /// Client-side timeout of `submit()` in millisecs. 0 means wait forever.
    pub client_timeout_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            backoff_init_ms: 5,
            backoff_max_ms: 5000,
            sim_latency_ms: 0,
            accept_rule: AcceptRule::Strict,
            client_timeout_ms: 0,
        }
    }
}

/// Ballot number: a round counter plus the proposing member's address.
///
/// Ordered by `(round, proposer.host)`; the port takes no part in the
/// ordering. Round 0 is the null ballot meaning "nothing promised yet".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ballot {
    pub round: u64,
    pub proposer: Address,
}

impl Ballot {
    pub fn new(round: u64, proposer: Address) -> Self {
        Ballot { round, proposer }
    }

    /// The null ballot owned by given member.
    pub fn null(proposer: Address) -> Self {
        Ballot { round: 0, proposer }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.round == 0
    }
}

impl Ord for Ballot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.round
            .cmp(&other.round)
            .then_with(|| self.proposer.host.cmp(&other.proposer.host))
    }
}

impl PartialOrd for Ballot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ballot {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ballot {}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.round, self.proposer)
    }
}

/// A client command, i.e., the "value" in Paxos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Ballot the command was created under; always null at submission.
    pub promise: Ballot,

    /// Command text in the `put|get|delete` grammar.
    pub text: String,

    /// Member the client submitted to.
    pub proposer: Address,

    /// Random tag identifying this submission.
    pub tag: u64,

    /// Response channel key, `<proposer host>-<tag>`.
    pub key: String,
}

impl Command {
    /// Creates a command for a fresh client submission at `proposer`.
    pub fn new(proposer: Address, text: impl Into<String>) -> Self {
        let tag: u64 = rand::thread_rng().gen();
        let key = format!("{}-{}", proposer.host, tag);
        Command {
            promise: Ballot::null(proposer.clone()),
            text: text.into(),
            proposer,
            tag,
            key,
        }
    }
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.promise == other.promise && self.tag == other.tag
    }
}

impl Eq for Command {}

/// Per-slot consensus state.
#[derive(Debug, Clone)]
pub struct Slot {
    /// Position in the global decision order.
    pub index: usize,

    /// Highest ballot promised for this slot.
    pub ballot: Ballot,

    /// Ballot under which `command` was last accepted.
    pub voted: Ballot,

    /// Accepted or decided command, `None` if there is none.
    pub command: Option<Command>,

    /// True once some command has been accepted here.
    pub accepted: bool,

    /// True once the command is decided; the command is then immutable.
    pub decided: bool,
}

impl Slot {
    /// A fresh, empty slot owned by `me`.
    pub fn null(index: usize, me: &Address) -> Self {
        Slot {
            index,
            ballot: Ballot::null(me.clone()),
            voted: Ballot::null(me.clone()),
            command: None,
            accepted: false,
            decided: false,
        }
    }
}

/// Request type of node-to-node calls. The variant is the method name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    /// Phase-1 request from a proposer.
    Prepare { slot: usize, ballot: Ballot },

    /// Phase-2 request from a proposer.
    Accept {
        slot: usize,
        ballot: Ballot,
        cmd: Command,
    },

    /// Decision broadcast from a proposer.
    Decide { slot: usize, cmd: Command },

    /// Drive consensus for a command until it is decided.
    Propose { cmd: Command },

    /// Liveness check.
    Ping,

    /// Diagnostic snapshot of the node.
    Dump,
}

/// Reply type of node-to-node calls, one variant per request variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcReply {
    Prepare {
        okay: bool,
        /// The slot's promised ballot after handling the request.
        promised: Ballot,
        /// Command currently accepted in the slot and the ballot it was
        /// accepted under, if any. Only filled in when `okay`.
        voted: Option<(Ballot, Command)>,
    },

    Accept {
        okay: bool,
        promised_round: u64,
    },

    Decide {
        success: bool,
    },

    Propose {
        okay: bool,
    },

    Ping {
        magic: u32,
    },

    Dump {
        text: String,
    },
}

/// Per-slot Paxos server replica module.
pub struct Replica {
    /// My own address; always `cell[0]`.
    me: Address,

    /// Fixed cell membership, myself first.
    cell: Vec<Address>,

    /// Configuration parameters struct.
    config: ReplicaConfig,

    /// Lazily extended array of slots.
    slots: SlotStore,

    /// Key-value state machine together with its apply bar.
    state_machine: Mutex<StateMachine>,

    /// Publishes the state machine's apply bar to waiting Decide handlers.
    tx_exec_bar: watch::Sender<usize>,

    /// Map from command key -> channel waiting for that command's result.
    pending: Mutex<HashMap<String, oneshot::Sender<String>>>,

    /// Transport used for every outbound call, calls to myself included.
    transport: Arc<dyn Transport>,
}

impl Replica {
    /// Creates a new replica. `cell[0]` must be this node's own address.
    pub fn new(
        cell: Vec<Address>,
        config_str: Option<&str>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, PaxosError> {
        let me = match cell.first() {
            Some(me) => me.clone(),
            None => return logged_err!("-"; "empty cell membership given"),
        };
        let mut seen = HashSet::new();
        for addr in &cell {
            if !seen.insert(addr) {
                return logged_err!(me; "duplicate cell member {}", addr);
            }
        }

        let config = parsed_config!(config_str => ReplicaConfig;
                                    backoff_init_ms, backoff_max_ms,
                                    sim_latency_ms, accept_rule,
                                    client_timeout_ms)?;
        if config.backoff_init_ms == 0 {
            return logged_err!(me; "invalid config.backoff_init_ms '{}'",
                                   config.backoff_init_ms);
        }
        if config.backoff_max_ms < config.backoff_init_ms {
            return logged_err!(me; "invalid config.backoff_max_ms '{}'",
                                   config.backoff_max_ms);
        }
        if config.accept_rule == AcceptRule::Relaxed {
            pf_warn!(me; "relaxed accept rule in use, agreement is not guaranteed");
        }

        let (tx_exec_bar, _) = watch::channel(0);
        pf_info!(me; "replica created in cell {:?}",
                     cell.iter().map(|a| a.to_string()).collect::<Vec<_>>());

        Ok(Replica {
            slots: SlotStore::new(me.clone()),
            me,
            cell,
            config,
            state_machine: Mutex::new(StateMachine::new()),
            tx_exec_bar,
            pending: Mutex::new(HashMap::new()),
            transport,
        })
    }

    /// My own address.
    #[inline]
    pub fn me(&self) -> &Address {
        &self.me
    }

    /// Cell members, myself first.
    #[inline]
    pub fn cell(&self) -> &[Address] {
        &self.cell
    }

    /// Number of cell members.
    #[inline]
    pub fn population(&self) -> usize {
        self.cell.len()
    }

    /// Whether `cnt` votes form a strict majority of the cell.
    #[inline]
    pub fn majority(&self, cnt: usize) -> bool {
        cnt * 2 > self.population()
    }

    /// Copies of all slots currently in the store.
    pub async fn slots_snapshot(&self) -> Vec<Slot> {
        self.slots.snapshot().await
    }

    /// Reads a key from the local state machine, bypassing consensus.
    pub async fn local_get(&self, key: &str) -> Option<String> {
        self.state_machine.lock().await.get(key).cloned()
    }

    /// Index of the first slot not yet applied locally.
    pub async fn exec_bar(&self) -> usize {
        self.state_machine.lock().await.exec_bar()
    }
}

#[async_trait]
impl RpcService for Replica {
    async fn handle_rpc(&self, req: RpcRequest) -> RpcReply {
        match req {
            RpcRequest::Prepare { slot, ballot } => {
                self.handle_prepare(slot, ballot).await
            }
            RpcRequest::Accept { slot, ballot, cmd } => {
                self.handle_accept(slot, ballot, cmd).await
            }
            RpcRequest::Decide { slot, cmd } => RpcReply::Decide {
                success: self.handle_decide(slot, cmd).await,
            },
            RpcRequest::Propose { cmd } => RpcReply::Propose {
                okay: self.handle_propose(cmd).await.is_ok(),
            },
            RpcRequest::Ping => RpcReply::Ping { magic: PING_MAGIC },
            RpcRequest::Dump => RpcReply::Dump {
                text: self.dump().await,
            },
        }
    }
}


#[cfg(test)]
mod paxos_tests {
    use super::tests_util::*;
    use super::*;

    fn addr(host: &str, port: u16) -> Address {
        Address::new(host, port)
    }

    #[test]
    fn ballot_order_round_dominates() {
        let lo = Ballot::new(1, addr("10.0.0.9", 1));
        let hi = Ballot::new(2, addr("10.0.0.1", 1));
        assert!(lo < hi);
        assert!(Ballot::null(addr("10.0.0.9", 1)) < lo);
    }

    #[test]
    fn ballot_order_host_breaks_ties() {
        let a = Ballot::new(3, addr("10.0.0.1", 9));
        let b = Ballot::new(3, addr("10.0.0.2", 1));
        assert!(a < b);
        assert_eq!(a.cmp(&b), Ordering::Less);
    }

    #[test]
    fn ballot_ignores_port() {
        let a = Ballot::new(3, addr("10.0.0.1", 1));
        let b = Ballot::new(3, addr("10.0.0.1", 2));
        assert_eq!(a, b);
        assert!(!(a < b) && !(b < a));
    }

    #[test]
    fn command_equality() {
        let me = addr("10.0.0.1", 7000);
        let c1 = Command::new(me.clone(), "put a 1");
        let mut c2 = c1.clone();
        c2.text = "put a 2".into();
        assert_eq!(c1, c2); // same ballot and tag
        let c3 = Command::new(me.clone(), "put a 1");
        assert_ne!(c1, c3);
        assert_eq!(c1.key, format!("10.0.0.1-{}", c1.tag));
        assert!(c1.promise.is_null());
    }

    #[test]
    fn quorum_boundaries() -> Result<(), PaxosError> {
        let four = lone_replica(4)?;
        assert!(!four.majority(2));
        assert!(four.majority(3));
        let five = lone_replica(5)?;
        assert!(!five.majority(2));
        assert!(five.majority(3));
        let one = lone_replica(1)?;
        assert!(!one.majority(0));
        assert!(one.majority(1));
        Ok(())
    }

    #[test]
    fn replica_new_validation() {
        let hub = crate::server::LocalHub::new();
        assert!(Replica::new(vec![], None, hub.clone()).is_err());
        let dup = vec![addr("10.0.0.1", 1), addr("10.0.0.1", 1)];
        assert!(Replica::new(dup, None, hub.clone()).is_err());
        let cell = cell_addrs(3);
        assert!(Replica::new(
            cell.clone(),
            Some("backoff_init_ms = 0"),
            hub.clone()
        )
        .is_err());
        assert!(Replica::new(
            cell.clone(),
            Some("backoff_init_ms = 10\nbackoff_max_ms = 5"),
            hub.clone()
        )
        .is_err());
        assert!(
            Replica::new(cell.clone(), Some("bogus = 1"), hub.clone()).is_err()
        );
    }

    #[test]
    fn replica_config_parse() -> Result<(), PaxosError> {
        let replica = Replica::new(
            cell_addrs(3),
            Some("accept_rule = 'relaxed'\nsim_latency_ms = 3"),
            crate::server::LocalHub::new(),
        )?;
        assert_eq!(replica.config.accept_rule, AcceptRule::Relaxed);
        assert_eq!(replica.config.sim_latency_ms, 3);
        assert_eq!(replica.config.backoff_init_ms, 5);
        assert_eq!(replica.me(), &cell_addrs(3)[0]);
        assert_eq!(replica.population(), 3);
        Ok(())
    }
}
