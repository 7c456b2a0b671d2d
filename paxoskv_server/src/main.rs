//! Paxos key-value cell node executable.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::panic;
use std::process::{self, ExitCode};
use std::sync::Arc;

use clap::Parser;

use log::{self, LevelFilter};

use paxoskv::{
    logger_init, pf_error, pf_info, Address, PaxosError, Replica, RpcServer,
    TcpTransport, Transport,
};

use tokio::runtime::Builder;
use tokio::sync::watch;

mod repl;

use repl::NodeRepl;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Verbosity level: 0 = warn, 1 = debug, 2 = trace. Larger values are
    /// clamped to 2.
    #[arg(short, long, default_value_t = 0)]
    chatty: u8,

    /// Simulated network latency in millisecs.
    #[arg(short, long, default_value_t = 0)]
    latency: u64,

    /// Replica configuration parameters as a TOML string.
    #[arg(long)]
    config: Option<String>,

    /// Cell member addresses (`host:port`, `:port` or `port`), this node
    /// first.
    #[arg(required = true)]
    cell: Vec<String>,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(cell)` on success or
    /// `Err(PaxosError)` on any error.
    fn sanitize(&self) -> Result<Vec<Address>, PaxosError> {
        if self.cell.is_empty() {
            return Err(PaxosError::msg(
                "not enough replica addresses specified to create a cell",
            ));
        }
        if self.latency > 0
            && self
                .config
                .as_ref()
                .is_some_and(|c| c.contains("sim_latency_ms"))
        {
            return Err(PaxosError::msg(
                "latency given both as flag and in config",
            ));
        }

        let mut cell = Vec::with_capacity(self.cell.len());
        let mut seen = HashSet::new();
        for s in &self.cell {
            let addr = Address::parse(s)?;
            if addr.port == 0 {
                return Err(PaxosError::msg(format!("invalid port in '{}'", s)));
            }
            if !seen.insert(addr.clone()) {
                return Err(PaxosError::msg(format!(
                    "duplicate cell member '{}'",
                    s
                )));
            }
            cell.push(addr);
        }
        Ok(cell)
    }

    /// Default log filter derived from the chatty level.
    fn log_level(&self) -> &'static str {
        match self.chatty {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    }

    /// Replica config string with the latency flag folded in.
    fn config_str(&self) -> Option<String> {
        match (self.latency, &self.config) {
            (0, config) => config.clone(),
            (l, None) => Some(format!("sim_latency_ms = {}", l)),
            (l, Some(config)) => {
                Some(format!("sim_latency_ms = {}\n{}", l, config))
            }
        }
    }
}

/// Actual main function of a cell node.
fn server_main(args: CliArgs, cell: Vec<Address>) -> Result<(), PaxosError> {
    let me = cell[0].clone();
    let bind_addr =
        SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), cell[0].port);

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("m"; "error sending to term channel: {}", e);
        }
    })
    .map_err(|e| PaxosError::msg(e.to_string()))?;

    println!("Chattyness  : {}", args.chatty.min(2));
    println!("Latency (ms): {}", args.latency);

    let log_level = log::max_level();
    {
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .thread_name("tokio-worker-node")
            .build()?;

        runtime.block_on(async move {
            let server = RpcServer::bind(bind_addr).await?;
            let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new());
            let replica = Arc::new(Replica::new(
                cell,
                args.config_str().as_deref(),
                transport.clone(),
            )?);

            let service = replica.clone();
            tokio::spawn(server.serve(service));
            pf_info!(me; "listening on {}", bind_addr);

            NodeRepl::new(replica, transport).run(rx_term).await?;

            // suppress logging of tasks torn down with the runtime
            log::set_max_level(LevelFilter::Off);
            Ok::<(), PaxosError>(())
        })?;
    }

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of a cell node.
fn main() -> ExitCode {
    let args = CliArgs::parse();
    logger_init(args.log_level());

    // a consistency violation on any task takes the whole node down
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        default_hook(info);
        process::exit(1);
    }));

    let cell = match args.sanitize() {
        Ok(cell) => cell,
        Err(e) => {
            pf_error!("m"; "invalid arguments: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(ref e) = server_main(args, cell) {
        pf_error!("m"; "server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
