//! Interactive shell of a cell node.

use std::sync::Arc;

use paxoskv::{
    pf_warn, Address, PaxosError, Replica, RpcReply, RpcRequest, Transport,
    PING_MAGIC,
};

use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;

/// Prompt string at the start of line.
const PROMPT: &str = "paxos> ";

/// Recognizable shell commands.
#[derive(Debug, PartialEq, Eq)]
enum ReplCommand {
    /// Key-value command to run through consensus.
    Submit(String),

    /// Dump this node's state.
    Dump,

    /// Dump the state of every cell member.
    DumpAll,

    /// Liveness check of given address.
    Ping(String),

    /// Print help message.
    PrintHelp,

    /// Shut down this node.
    Exit,

    /// Nothing read.
    Nothing,
}

/// Parses one input line. Returns an error message for malformed input.
fn parse_line(line: &str) -> Result<ReplCommand, String> {
    let segs: Vec<&str> = line.split_whitespace().collect();
    let cmd_type = match segs.first() {
        Some(t) => *t,
        None => return Ok(ReplCommand::Nothing),
    };

    match cmd_type {
        "put" if segs.len() != 3 => {
            Err("Number of arguments supplied incorrect - usage: put <key> <value>".into())
        }
        "get" if segs.len() != 2 => {
            Err("Number of arguments supplied incorrect - usage: get <key>".into())
        }
        "delete" if segs.len() != 2 => {
            Err("Number of arguments supplied incorrect - usage: delete <key>".into())
        }
        "put" | "get" | "delete" => Ok(ReplCommand::Submit(segs.join(" "))),

        "dump" => Ok(ReplCommand::Dump),
        "dumpall" => Ok(ReplCommand::DumpAll),

        "ping" if segs.len() != 2 => {
            Err("Number of arguments supplied incorrect - usage: ping <addr>".into())
        }
        "ping" => Ok(ReplCommand::Ping(segs[1].into())),

        "help" => Ok(ReplCommand::PrintHelp),
        "quit" => Ok(ReplCommand::Exit),

        _ => Err("Command not recognized".into()),
    }
}

fn help_text() -> &'static str {
    "--- List of Paxos Commands ---\n\
     --- Key/Value Operations ---\n\
     \x20    put <key> <value> : Insert the <key> and <value> into the database\n\
     \x20    get <key>         : Find <key> in the database\n\
     \x20    delete <key>      : Delete <key> from the database\n\
     \x20    quit              : Shut down this replica instance\n\
     --- Debugging Commands ---\n\
     \x20    dump              : Display information about the current replica\n\
     \x20    dumpall           : Display information about all cell members\n\
     \x20    ping <addr:port>  : Check whether the replica at addr:port is listening"
}

/// Interactive shell driving a local replica.
pub(crate) struct NodeRepl {
    replica: Arc<Replica>,

    /// Transport for diagnostic calls to other members.
    transport: Arc<dyn Transport>,
}

impl NodeRepl {
    pub(crate) fn new(
        replica: Arc<Replica>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        NodeRepl { replica, transport }
    }

    async fn print_prompt() -> Result<(), PaxosError> {
        let mut stdout = io::stdout();
        stdout.write_all(PROMPT.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }

    /// Fetches the dump of a remote member.
    async fn remote_dump(&self, addr: &Address) -> Result<String, PaxosError> {
        match self.transport.invoke(addr, RpcRequest::Dump).await? {
            RpcReply::Dump { text } => Ok(text),
            reply => Err(PaxosError::msg(format!(
                "unexpected reply {:?}",
                reply
            ))),
        }
    }

    /// Runs one command, returning the text to print.
    async fn eval_command(&self, cmd: ReplCommand) -> String {
        match cmd {
            ReplCommand::Submit(text) => match self.replica.submit(&text).await
            {
                Ok(result) => result,
                Err(e) => format!("Command failed: {}", e),
            },

            ReplCommand::Dump => self.replica.dump().await,

            ReplCommand::DumpAll => {
                let mut out = String::new();
                for addr in self.replica.cell() {
                    out.push_str(&format!("-----{}-----\n", addr));
                    if addr == self.replica.me() {
                        out.push_str(&self.replica.dump().await);
                    } else {
                        match self.remote_dump(addr).await {
                            Ok(text) => out.push_str(&text),
                            Err(e) => {
                                out.push_str(&format!("No response: {}\n", e))
                            }
                        }
                    }
                }
                out
            }

            ReplCommand::Ping(target) => {
                let reply = match Address::parse(&target) {
                    Ok(addr) => {
                        self.transport.invoke(&addr, RpcRequest::Ping).await
                    }
                    Err(e) => Err(e),
                };
                match reply {
                    Ok(RpcReply::Ping { magic }) if magic == PING_MAGIC => {
                        format!("Response received from {}", target)
                    }
                    _ => format!("No response from {}", target),
                }
            }

            ReplCommand::PrintHelp => help_text().into(),

            ReplCommand::Exit | ReplCommand::Nothing => String::new(),
        }
    }

    /// Reads and runs commands until `quit`, EOF, or a termination signal.
    pub(crate) async fn run(
        &self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), PaxosError> {
        println!("Type 'help' for a list of commands");
        let mut lines = BufReader::new(io::stdin()).lines();

        loop {
            Self::print_prompt().await?;
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = rx_term.changed() => {
                    pf_warn!(self.replica.me(); "terminating on signal");
                    return Ok(());
                }
            };
            let line = match line {
                Some(line) => line,
                None => return Ok(()),
            };

            match parse_line(&line) {
                Ok(ReplCommand::Exit) => {
                    println!("Quitting...");
                    return Ok(());
                }
                Ok(ReplCommand::Nothing) => {}
                Ok(cmd) => println!("{}", self.eval_command(cmd).await),
                Err(msg) => println!("{}", msg),
            }
        }
    }
}
