//! Per-slot Paxos -- learner role and in-order execution.

use super::*;

// Replica learner-side request handling
impl Replica {
    /// Handler of Decide request. Returns false if the slot was already
    /// decided with the same command. Deciding a different command for a
    /// decided slot is a safety violation and panics.
    ///
    /// Returns only after the slot has been applied to the state machine,
    /// which in turn waits for every lower slot to be decided.
    pub(crate) async fn handle_decide(&self, slot: usize, cmd: Command) -> bool {
        {
            let inst = self.slots.slot(slot).await;
            let mut inst = inst.lock().await;

            if inst.decided {
                if inst.command.as_ref() != Some(&cmd) {
                    let prev = inst.command.as_ref().map_or("", |c| c.text.as_str());
                    pf_error!(self.me; "slot {} decided '{}' but now deciding '{}'",
                                       slot, prev, cmd.text);
                    panic!(
                        "consistency violation at slot {}: decided '{}', got '{}'",
                        slot, prev, cmd.text
                    );
                }
                pf_debug!(self.me; "Decide on already decided slot {}", slot);
                return false;
            }

            pf_debug!(self.me; "Decide slot {} '{}'", slot, cmd.text);
            inst.command = Some(cmd);
            inst.decided = true;
        }

        self.apply_decided().await;

        // wait until the apply bar passes this slot
        let mut rx_exec_bar = self.tx_exec_bar.subscribe();
        if rx_exec_bar.wait_for(|&bar| bar > slot).await.is_err() {
            pf_error!(self.me; "exec bar channel closed while waiting on {}", slot);
        }
        true
    }

    /// Applies every consecutive decided slot starting at the apply bar,
    /// delivering each result to its waiting submitter if it is local.
    async fn apply_decided(&self) {
        let mut sm = self.state_machine.lock().await;

        loop {
            let idx = sm.exec_bar();
            let inst = match self.slots.existing(idx).await {
                Some(inst) => inst,
                None => break,
            };
            let cmd = {
                let inst = inst.lock().await;
                if !inst.decided {
                    break;
                }
                match inst.command.clone() {
                    Some(cmd) => cmd,
                    None => {
                        pf_error!(self.me; "decided slot {} holds no command", idx);
                        break;
                    }
                }
            };

            let result = sm.apply_next(&cmd.text);
            pf_debug!(self.me; "executed slot {} '{}' -> {}", idx, cmd.text, result);
            self.deliver_result(&cmd.key, result).await;
        }

        self.tx_exec_bar.send_replace(sm.exec_bar());
    }

    /// Pushes a command result to its registered response channel, if any,
    /// removing the registration.
    async fn deliver_result(&self, key: &str, result: String) {
        let tx = self.pending.lock().await.remove(key);
        if let Some(tx) = tx {
            if tx.send(result).is_err() {
                pf_debug!(self.me; "submitter of {} no longer waiting", key);
            }
        }
    }
}

#[cfg(test)]
mod learner_tests {
    use super::tests_util::*;
    use super::*;
    use tokio::time::{self, Duration};

    fn command_at(replica: &Replica, text: &str) -> Command {
        Command::new(replica.me().clone(), text)
    }

    async fn register(
        replica: &Replica,
        cmd: &Command,
    ) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        replica.pending.lock().await.insert(cmd.key.clone(), tx);
        rx
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn decide_applies_and_delivers() -> Result<(), PaxosError> {
        let replica = lone_replica(3)?;
        let cmd = command_at(&replica, "put a 1");
        let rx = register(&replica, &cmd).await;
        assert!(replica.handle_decide(0, cmd).await);
        assert_eq!(rx.await?, "[a] => 1 added to database");
        assert_eq!(replica.local_get("a").await, Some("1".into()));
        assert_eq!(replica.exec_bar().await, 1);
        assert!(replica.pending.lock().await.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_decide_not_reapplied() -> Result<(), PaxosError> {
        let replica = lone_replica(3)?;
        let put = command_at(&replica, "put a 1");
        let del = command_at(&replica, "delete a");
        assert!(replica.handle_decide(0, put.clone()).await);
        assert!(replica.handle_decide(1, del).await);
        assert_eq!(replica.local_get("a").await, None);
        // re-deciding slot 0 must not put the key back
        assert!(!replica.handle_decide(0, put).await);
        assert_eq!(replica.local_get("a").await, None);
        assert_eq!(replica.exec_bar().await, 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[should_panic(expected = "consistency violation")]
    async fn divergent_decide_panics() {
        let replica = lone_replica(3).unwrap();
        let first = command_at(&replica, "put a 1");
        let second = command_at(&replica, "put a 2");
        assert!(replica.handle_decide(0, first).await);
        replica.handle_decide(0, second).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn decide_waits_for_lower_slots() -> Result<(), PaxosError> {
        let replica = Arc::new(lone_replica(3)?);
        let cmd = command_at(&replica, "put b 2");
        let waiter = {
            let replica = replica.clone();
            tokio::spawn(async move { replica.handle_decide(1, cmd).await })
        };
        time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());
        assert_eq!(replica.local_get("b").await, None);
        assert!(replica.slots_snapshot().await[1].decided);

        assert!(replica.handle_decide(0, command_at(&replica, "put a 1")).await);
        assert!(waiter.await?);
        assert_eq!(replica.local_get("b").await, Some("2".into()));
        assert_eq!(replica.exec_bar().await, 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn scrambled_decides_apply_in_order() -> Result<(), PaxosError> {
        let replica = Arc::new(lone_replica(3)?);
        let texts = [
            "put a 1",  // 0
            "get a",    // 1
            "put a 2",  // 2
            "get a",    // 3
            "delete a", // 4
            "get a",    // 5
            "put b 7",  // 6
        ];
        let cmds: Vec<Command> =
            texts.iter().map(|t| command_at(&replica, t)).collect();
        let mut rxs = Vec::new();
        for cmd in &cmds {
            rxs.push(register(&replica, cmd).await);
        }

        let mut handles = Vec::new();
        for idx in [6, 3, 5, 0, 2, 4, 1] {
            let replica = replica.clone();
            let cmd = cmds[idx].clone();
            handles.push(tokio::spawn(async move {
                replica.handle_decide(idx, cmd).await
            }));
            time::sleep(Duration::from_millis(5)).await;
        }
        for handle in handles {
            assert!(handle.await?);
        }

        let mut results = Vec::new();
        for rx in rxs {
            results.push(rx.await?);
        }
        assert_eq!(
            results,
            vec![
                "[a] => 1 added to database",
                "[a] => 1",
                "[a] => 2 added to database",
                "[a] => 2",
                "[a] => 2 deleted from database",
                "[a] => ",
                "[b] => 7 added to database",
            ]
        );
        assert_eq!(replica.local_get("a").await, None);
        assert_eq!(replica.local_get("b").await, Some("7".into()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unrecognized_command_occupies_slot() -> Result<(), PaxosError> {
        let replica = lone_replica(3)?;
        let junk = command_at(&replica, "launch rockets");
        let rx = register(&replica, &junk).await;
        assert!(replica.handle_decide(0, junk).await);
        assert_eq!(rx.await?, "Unrecognized command");
        assert!(replica.handle_decide(1, command_at(&replica, "put x y")).await);
        assert_eq!(replica.local_get("x").await, Some("y".into()));
        assert_eq!(replica.exec_bar().await, 2);
        Ok(())
    }
}
