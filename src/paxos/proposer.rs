//! Per-slot Paxos -- proposer role.

use super::*;

use crate::utils::Bitmap;

use futures::stream::{FuturesUnordered, StreamExt};

use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// In-flight calls of one fan-out round, each yielding the callee's index in
/// the cell together with its reply.
type FanOut = FuturesUnordered<JoinHandle<(usize, Result<RpcReply, PaxosError>)>>;

/// Result of a Prepare round.
#[derive(Debug)]
struct PrepareOutcome {
    /// True if a strict majority promised.
    granted: bool,

    /// Highest ballot round heard from any responder.
    max_round: u64,

    /// Command accepted under the highest ballot among the promises.
    adopted: Option<(Ballot, Command)>,
}

/// Result of an Accept round.
#[derive(Debug)]
struct AcceptOutcome {
    granted: bool,
    max_round: u64,
}

// Replica proposer-side logic
impl Replica {
    /// Sleeps for a random duration in `[l, 2l]` millisecs to mimic network
    /// latency. No-op if `l` is 0.
    async fn sim_delay(latency_ms: u64) {
        if latency_ms == 0 {
            return;
        }
        let ms = rand::thread_rng().gen_range(latency_ms..=latency_ms * 2);
        time::sleep(Duration::from_millis(ms)).await;
    }

    /// Sends a request to every cell member, myself included, each on its
    /// own task.
    fn fan_out(&self, req: &RpcRequest) -> FanOut {
        let calls = FuturesUnordered::new();
        for (idx, peer) in self.cell.iter().enumerate() {
            let transport = self.transport.clone();
            let peer = peer.clone();
            let req = req.clone();
            let latency_ms = self.config.sim_latency_ms;
            calls.push(tokio::spawn(async move {
                Self::sim_delay(latency_ms).await;
                let reply = transport.invoke(&peer, req).await;
                Self::sim_delay(latency_ms).await;
                (idx, reply)
            }));
        }
        calls
    }

    /// Unwraps one finished fan-out call. Failed calls are logged and yield
    /// `None`; they count as a "no" vote.
    fn take_reply(
        &self,
        joined: Result<(usize, Result<RpcReply, PaxosError>), tokio::task::JoinError>,
    ) -> Option<(usize, Option<RpcReply>)> {
        match joined {
            Ok((idx, Ok(reply))) => Some((idx, Some(reply))),
            Ok((idx, Err(e))) => {
                pf_debug!(self.me; "call to {} failed: {}", self.cell[idx], e);
                Some((idx, None))
            }
            Err(e) => {
                pf_error!(self.me; "fan-out task join error: {}", e);
                None
            }
        }
    }

    /// Runs Phase 1 for given slot under `ballot`. Stops collecting replies as
    /// soon as the outcome is known.
    async fn prepare_phase(
        &self,
        slot: usize,
        ballot: &Ballot,
    ) -> Result<PrepareOutcome, PaxosError> {
        let mut calls = self.fan_out(&RpcRequest::Prepare {
            slot,
            ballot: ballot.clone(),
        });

        let mut yes = Bitmap::new(self.population(), false);
        let mut no = Bitmap::new(self.population(), false);
        let mut outcome = PrepareOutcome {
            granted: false,
            max_round: 0,
            adopted: None,
        };

        while let Some(joined) = calls.next().await {
            let (idx, reply) = match self.take_reply(joined) {
                Some(r) => r,
                None => continue,
            };
            match reply {
                Some(RpcReply::Prepare {
                    okay,
                    promised,
                    voted,
                }) => {
                    outcome.max_round = outcome.max_round.max(promised.round);
                    if okay {
                        yes.set(idx, true)?;
                        if let Some((vbal, vcmd)) = voted {
                            let higher = match &outcome.adopted {
                                Some((abal, _)) => vbal > *abal,
                                None => true,
                            };
                            if higher && !vcmd.text.is_empty() {
                                outcome.adopted = Some((vbal, vcmd));
                            }
                        }
                    } else {
                        no.set(idx, true)?;
                    }
                }
                Some(reply) => {
                    pf_warn!(self.me; "unexpected Prepare reply {:?}", reply);
                    no.set(idx, true)?;
                }
                None => no.set(idx, true)?,
            }

            if self.majority(yes.count()) {
                outcome.granted = true;
                break;
            }
            if self.majority(no.count()) {
                break;
            }
        }

        pf_trace!(self.me; "Prepare slot {} {} yes {:?} no {:?}",
                           slot, ballot, yes, no);
        Ok(outcome)
    }

    /// Runs Phase 2 for given slot, asking acceptors to accept `cmd` under
    /// `ballot`.
    async fn accept_phase(
        &self,
        slot: usize,
        ballot: &Ballot,
        cmd: &Command,
    ) -> Result<AcceptOutcome, PaxosError> {
        let mut calls = self.fan_out(&RpcRequest::Accept {
            slot,
            ballot: ballot.clone(),
            cmd: cmd.clone(),
        });

        let mut yes = Bitmap::new(self.population(), false);
        let mut no = Bitmap::new(self.population(), false);
        let mut outcome = AcceptOutcome {
            granted: false,
            max_round: 0,
        };

        while let Some(joined) = calls.next().await {
            let (idx, reply) = match self.take_reply(joined) {
                Some(r) => r,
                None => continue,
            };
            match reply {
                Some(RpcReply::Accept {
                    okay,
                    promised_round,
                }) => {
                    outcome.max_round = outcome.max_round.max(promised_round);
                    if okay {
                        yes.set(idx, true)?;
                    } else {
                        no.set(idx, true)?;
                    }
                }
                Some(reply) => {
                    pf_warn!(self.me; "unexpected Accept reply {:?}", reply);
                    no.set(idx, true)?;
                }
                None => no.set(idx, true)?,
            }

            if self.majority(yes.count()) {
                outcome.granted = true;
                break;
            }
            if self.majority(no.count()) {
                break;
            }
        }

        pf_trace!(self.me; "Accept slot {} {} yes {:?} no {:?}",
                           slot, ballot, yes, no);
        Ok(outcome)
    }

    /// Broadcasts the decision for a slot without waiting for the replies.
    fn broadcast_decide(&self, slot: usize, cmd: Command) {
        let mut calls = self.fan_out(&RpcRequest::Decide { slot, cmd });
        let me = self.me.clone();
        tokio::spawn(async move {
            while let Some(joined) = calls.next().await {
                match joined {
                    Ok((_, Ok(_))) => {}
                    Ok((idx, Err(e))) => {
                        pf_debug!(me; "Decide slot {} to member {} failed: {}",
                                      slot, idx, e);
                    }
                    Err(e) => {
                        pf_error!(me; "Decide task join error: {}", e);
                    }
                }
            }
        });
    }

    /// Backs off for a random duration in `[b, 2b]` millisecs, then doubles
    /// `b` up to the configured cap.
    async fn backoff(&self, backoff_ms: &mut u64) {
        let ms = rand::thread_rng().gen_range(*backoff_ms..=*backoff_ms * 2);
        time::sleep(Duration::from_millis(ms)).await;
        *backoff_ms = (*backoff_ms * 2).min(self.config.backoff_max_ms);
    }

    /// Handler of Propose request. Drives consensus until `cmd` is decided
    /// in some slot, moving on to the next slot whenever the current one gets
    /// decided with a different command. Never gives up on its own.
    pub(crate) async fn handle_propose(
        &self,
        cmd: Command,
    ) -> Result<(), PaxosError> {
        let mut backoff_ms = self.config.backoff_init_ms;
        let mut attempt: u64 = 0;
        let mut highest_seen: u64 = 0;
        let mut slot = self.slots.first_undecided().await;
        pf_debug!(self.me; "Propose '{}' ({}) starting at slot {}",
                           cmd.text, cmd.key, slot);

        loop {
            if let Some(decided) = self.slots.decided_command(slot).await {
                if decided.tag == cmd.tag {
                    pf_debug!(self.me; "'{}' ({}) decided at slot {}",
                                       cmd.text, cmd.key, slot);
                    return Ok(());
                }
                // taken by someone else, try the next one
                slot += 1;
                highest_seen = 0;
                continue;
            }
            attempt += 1;

            let round =
                self.slots.ballot_round(slot).await.max(highest_seen) + 1;
            let ballot = Ballot::new(round, self.me.clone());
            pf_trace!(self.me; "attempt {} slot {} ballot {}", attempt, slot, ballot);

            let prepared = self.prepare_phase(slot, &ballot).await?;
            highest_seen = highest_seen.max(prepared.max_round);
            if self.slots.decided_command(slot).await.is_some() {
                continue;
            }

            if prepared.granted {
                let value = match prepared.adopted {
                    Some((_, adopted)) => adopted,
                    None => cmd.clone(),
                };

                let accepted = self.accept_phase(slot, &ballot, &value).await?;
                highest_seen = highest_seen.max(accepted.max_round);

                if accepted.granted {
                    let mine = value.tag == cmd.tag;
                    pf_debug!(self.me; "slot {} chosen '{}' under {}{}",
                                       slot, value.text, ballot,
                                       if mine { "" } else { " (adopted)" });
                    self.broadcast_decide(slot, value);
                    if mine {
                        return Ok(());
                    }
                    // finished someone else's slot, keep going for mine
                    slot += 1;
                    highest_seen = 0;
                    backoff_ms = self.config.backoff_init_ms;
                    continue;
                }
                if self.slots.decided_command(slot).await.is_some() {
                    continue;
                }
            }

            self.backoff(&mut backoff_ms).await;
        }
    }
}

#[cfg(test)]
mod proposer_tests {
    use super::tests_util::*;
    use super::*;

    async fn decided_texts(replica: &Replica) -> Vec<String> {
        replica
            .slots_snapshot()
            .await
            .into_iter()
            .filter(|s| s.decided)
            .filter_map(|s| s.command.map(|c| c.text))
            .collect()
    }

    /// Waits until every replica has applied `count` slots.
    async fn settle(replicas: &[Arc<Replica>], count: usize) {
        for _ in 0..500 {
            let mut done = true;
            for replica in replicas {
                if replica.exec_bar().await < count {
                    done = false;
                }
            }
            if done {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("cell did not settle at {} applied slots", count);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn propose_single_decides_everywhere() -> Result<(), PaxosError> {
        let (_hub, replicas) = local_cell(3, None).await?;
        let cmd = Command::new(replicas[0].me().clone(), "put a 1");
        replicas[0].handle_propose(cmd.clone()).await?;
        settle(&replicas, 1).await;
        for replica in &replicas {
            let slots = replica.slots_snapshot().await;
            assert!(slots[0].decided);
            assert_eq!(slots[0].command, Some(cmd.clone()));
            assert_eq!(replica.local_get("a").await, Some("1".into()));
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn propose_skips_decided_slots() -> Result<(), PaxosError> {
        let (_hub, replicas) = local_cell(3, None).await?;
        for (i, text) in ["put a 1", "put b 2"].into_iter().enumerate() {
            let cmd = Command::new(replicas[i].me().clone(), text);
            replicas[i].handle_propose(cmd).await?;
        }
        settle(&replicas, 2).await;
        let cmd = Command::new(replicas[2].me().clone(), "put c 3");
        replicas[2].handle_propose(cmd).await?;
        settle(&replicas, 3).await;
        for replica in &replicas {
            assert_eq!(
                decided_texts(replica).await,
                vec!["put a 1", "put b 2", "put c 3"]
            );
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn propose_adopts_accepted_value() -> Result<(), PaxosError> {
        let (_hub, replicas) = local_cell(3, None).await?;
        // a stalled proposer got its command accepted at two members
        let stalled = Command::new(replicas[1].me().clone(), "put x old");
        let bal = Ballot::new(1, replicas[1].me().clone());
        for replica in &replicas[1..] {
            replica.handle_prepare(0, bal.clone()).await;
            replica.handle_accept(0, bal.clone(), stalled.clone()).await;
        }

        let cmd = Command::new(replicas[0].me().clone(), "put x new");
        replicas[0].handle_propose(cmd.clone()).await?;
        settle(&replicas, 2).await;
        for replica in &replicas {
            let slots = replica.slots_snapshot().await;
            assert_eq!(slots[0].command, Some(stalled.clone()));
            assert_eq!(slots[1].command, Some(cmd.clone()));
            assert_eq!(replica.local_get("x").await, Some("new".into()));
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn propose_survives_minority_failure() -> Result<(), PaxosError> {
        let (hub, replicas) = local_cell(3, None).await?;
        hub.set_reachable(replicas[2].me(), false).await;
        let cmd = Command::new(replicas[0].me().clone(), "put k v");
        replicas[0].handle_propose(cmd).await?;
        settle(&replicas[..2], 1).await;
        assert_eq!(replicas[1].local_get("k").await, Some("v".into()));
        assert_eq!(replicas[2].exec_bar().await, 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn propose_blocks_without_majority() -> Result<(), PaxosError> {
        let (hub, replicas) = local_cell(3, Some("backoff_max_ms = 20")).await?;
        hub.set_reachable(replicas[1].me(), false).await;
        hub.set_reachable(replicas[2].me(), false).await;
        let cmd = Command::new(replicas[0].me().clone(), "put k v");
        let res = time::timeout(
            Duration::from_millis(300),
            replicas[0].handle_propose(cmd),
        )
        .await;
        assert!(res.is_err());
        assert_eq!(replicas[0].exec_bar().await, 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_proposers_agree() -> Result<(), PaxosError> {
        let (_hub, replicas) =
            local_cell(5, Some("sim_latency_ms = 1")).await?;
        let mut handles = Vec::new();
        for (i, replica) in replicas.iter().enumerate() {
            for j in 0..4 {
                let replica = replica.clone();
                let cmd = Command::new(
                    replica.me().clone(),
                    format!("put k{} {}", i, j),
                );
                handles.push(tokio::spawn(async move {
                    replica.handle_propose(cmd).await
                }));
            }
        }
        for handle in handles {
            handle.await??;
        }
        settle(&replicas, 20).await;

        let reference = decided_texts(&replicas[0]).await;
        assert_eq!(reference.len(), 20);
        for replica in &replicas[1..] {
            assert_eq!(decided_texts(replica).await, reference);
        }
        // each submission decided exactly once
        let mut sorted = reference.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 20);
        Ok(())
    }
}
