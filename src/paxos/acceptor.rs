//! Per-slot Paxos -- acceptor role.

use super::*;

// Replica acceptor-side request handling
impl Replica {
    /// Handler of Prepare request from a proposer.
    pub(crate) async fn handle_prepare(
        &self,
        slot: usize,
        ballot: Ballot,
    ) -> RpcReply {
        let inst = self.slots.slot(slot).await;
        let mut inst = inst.lock().await;

        if inst.decided {
            // a lagging proposer may still prepare a decided slot
            pf_debug!(self.me; "Prepare on already decided slot {}", slot);
        }

        if ballot > inst.ballot {
            pf_trace!(self.me; "Prepare slot {} promising {} over {}",
                               slot, ballot, inst.ballot);
            inst.ballot = ballot;
            RpcReply::Prepare {
                okay: true,
                promised: inst.ballot.clone(),
                voted: inst
                    .command
                    .as_ref()
                    .map(|cmd| (inst.voted.clone(), cmd.clone())),
            }
        } else {
            pf_trace!(self.me; "Prepare slot {} rejecting {}, promised {}",
                               slot, ballot, inst.ballot);
            RpcReply::Prepare {
                okay: false,
                promised: inst.ballot.clone(),
                voted: None,
            }
        }
    }

    /// Handler of Accept request from a proposer.
    pub(crate) async fn handle_accept(
        &self,
        slot: usize,
        ballot: Ballot,
        cmd: Command,
    ) -> RpcReply {
        let inst = self.slots.slot(slot).await;
        let mut inst = inst.lock().await;

        let admissible = match self.config.accept_rule {
            AcceptRule::Strict => ballot >= inst.ballot,
            AcceptRule::Relaxed => ballot <= inst.ballot || inst.ballot.is_null(),
        };
        if !admissible {
            pf_trace!(self.me; "Accept slot {} rejecting {}, promised {}",
                               slot, ballot, inst.ballot);
            return RpcReply::Accept {
                okay: false,
                promised_round: inst.ballot.round,
            };
        }

        if inst.decided {
            if inst.command.as_ref() != Some(&cmd) {
                pf_warn!(self.me; "Accept slot {} refusing '{}', decided '{}'",
                                  slot, cmd.text,
                                  inst.command.as_ref().map_or("", |c| c.text.as_str()));
                return RpcReply::Accept {
                    okay: false,
                    promised_round: inst.ballot.round,
                };
            }
        } else {
            inst.command = Some(cmd);
        }

        if self.config.accept_rule == AcceptRule::Strict && ballot > inst.ballot
        {
            inst.ballot = ballot.clone();
        }
        pf_trace!(self.me; "Accept slot {} accepted under {}", slot, ballot);
        inst.voted = ballot;
        inst.accepted = true;

        RpcReply::Accept {
            okay: true,
            promised_round: inst.ballot.round,
        }
    }
}
