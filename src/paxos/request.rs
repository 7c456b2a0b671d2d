//! Per-slot Paxos -- client-facing entry points.

use super::*;

use tokio::time::{self, Duration};

/// Magic number answered to every Ping.
pub const PING_MAGIC: u32 = 562;

// Replica client request handling
impl Replica {
    /// Submits a command to the replicated state machine and waits for its
    /// result, which is produced once the command's slot is applied locally.
    /// Bounded by `client_timeout_ms` if that is non-zero.
    pub async fn submit(&self, text: &str) -> Result<String, PaxosError> {
        if text.trim().is_empty() {
            return logged_err!(self.me; "refusing to submit empty command");
        }

        let cmd = Command::new(self.me.clone(), text);
        let key = cmd.key.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(key.clone(), tx);
        pf_debug!(self.me; "submit '{}' as {}", text, key);

        let wait = async {
            self.handle_propose(cmd).await?;
            Ok::<String, PaxosError>(rx.await?)
        };
        let result = if self.config.client_timeout_ms > 0 {
            match time::timeout(
                Duration::from_millis(self.config.client_timeout_ms),
                wait,
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(PaxosError::msg(format!(
                    "command '{}' timed out after {} ms",
                    text, self.config.client_timeout_ms
                ))),
            }
        } else {
            wait.await
        };

        if result.is_err() {
            self.pending.lock().await.remove(&key);
        }
        result
    }

    /// Human-readable snapshot of the cell, the slot array, and the local
    /// database.
    pub async fn dump(&self) -> String {
        let slots = self.slots.snapshot().await;

        let mut out = String::from("Cell Addresses:\n");
        for (i, addr) in self.cell.iter().enumerate() {
            if i == 0 {
                out.push_str(&format!("    {} (Local replica address)\n", addr));
            } else {
                out.push_str(&format!("    {}\n", addr));
            }
        }

        out.push_str("Slots:\n");
        for slot in &slots {
            let text = slot.command.as_ref().map_or("", |c| c.text.as_str());
            out.push_str(&format!(
                "    [{}]=>\"{}\" N: {} Accepted: {} Decided: {}\n",
                slot.index, text, slot.ballot, slot.accepted, slot.decided
            ));
        }
        out.push_str(&format!("# Slots filled: {}\n", slots.len()));

        let sm = self.state_machine.lock().await;
        let pairs = sm.sorted_pairs();
        out.push_str("Database:\n");
        for (key, value) in &pairs {
            out.push_str(&format!("    [{}]: {}\n", key, value));
        }
        out.push_str(&format!("# Database items: {}\n", pairs.len()));
        out
    }
}

#[cfg(test)]
mod request_tests {
    use super::tests_util::*;
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn submit_put_get_delete() -> Result<(), PaxosError> {
        let (_hub, replicas) = local_cell(3, None).await?;
        assert_eq!(
            replicas[0].submit("put a 1").await?,
            "[a] => 1 added to database"
        );
        assert_eq!(replicas[1].submit("get a").await?, "[a] => 1");
        assert_eq!(
            replicas[2].submit("delete a").await?,
            "[a] => 1 deleted from database"
        );
        assert_eq!(replicas[0].submit("get a").await?, "[a] => ");
        assert_eq!(replicas[1].submit("frobnicate").await?, "Unrecognized command");
        for replica in &replicas {
            assert!(replica.pending.lock().await.is_empty());
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submit_rejects_empty() -> Result<(), PaxosError> {
        let replica = lone_replica(1)?;
        assert!(replica.submit("   ").await.is_err());
        assert_eq!(replica.slots_snapshot().await.len(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submit_timeout_cleans_pending() -> Result<(), PaxosError> {
        // peers of a lone replica are never reachable
        let replica = Replica::new(
            cell_addrs(3),
            Some("client_timeout_ms = 100\nbackoff_max_ms = 20"),
            crate::server::LocalHub::new(),
        )?;
        assert!(replica.submit("put a 1").await.is_err());
        assert!(replica.pending.lock().await.is_empty());
        assert_eq!(replica.exec_bar().await, 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_submits_converge() -> Result<(), PaxosError> {
        let (_hub, replicas) =
            local_cell(3, Some("sim_latency_ms = 1")).await?;
        let mut handles = Vec::new();
        for (i, replica) in replicas.iter().enumerate() {
            for j in 0..5 {
                let replica = replica.clone();
                handles.push(tokio::spawn(async move {
                    replica.submit(&format!("put k{}{} v", i, j)).await
                }));
            }
        }
        for handle in handles {
            assert!(handle.await??.ends_with("added to database"));
        }

        // every replica applied the same sequence
        for _ in 0..500 {
            let mut bars = Vec::new();
            for replica in &replicas {
                bars.push(replica.exec_bar().await);
            }
            if bars.iter().all(|&b| b == 15) {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        let reference = replicas[0].slots_snapshot().await;
        for replica in &replicas[1..] {
            let slots = replica.slots_snapshot().await;
            assert_eq!(replica.exec_bar().await, 15);
            for idx in 0..15 {
                assert!(slots[idx].decided);
                assert_eq!(slots[idx].command, reference[idx].command);
            }
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dump_format() -> Result<(), PaxosError> {
        let (_hub, replicas) = local_cell(1, None).await?;
        let replica = &replicas[0];
        replica.submit("put k v").await?;
        let me = replica.me().clone();
        let expected = format!(
            "Cell Addresses:\n    {} (Local replica address)\n\
             Slots:\n    [0]=>\"put k v\" N: 1/{} Accepted: true Decided: true\n\
             # Slots filled: 1\n\
             Database:\n    [k]: v\n\
             # Database items: 1\n",
            me, me
        );
        assert_eq!(replica.dump().await, expected);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ping_and_dump_rpcs() -> Result<(), PaxosError> {
        let replica = lone_replica(1)?;
        match replica.handle_rpc(RpcRequest::Ping).await {
            RpcReply::Ping { magic } => assert_eq!(magic, 562),
            reply => panic!("unexpected reply {:?}", reply),
        }
        match replica.handle_rpc(RpcRequest::Dump).await {
            RpcReply::Dump { text } => {
                assert!(text.contains("# Slots filled: 0"))
            }
            reply => panic!("unexpected reply {:?}", reply),
        }
        Ok(())
    }
}
