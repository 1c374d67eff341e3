//! Interactive two-party payment channel demo.
//!
//! Runs a node with a simulated chain backend, connects to peers over TCP
//! and drives channels from a small REPL:
//!
//! ```text
//! connect <ip:port> <hex-id> <alias>
//! open <alias> <our balance> <their balance>
//! send <alias> <amount>
//! close <alias>
//! info | help | exit
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;
use structopt::StructOpt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use tandem::channel::state::Allocation;
use tandem::channel::AcceptAllUpdates;
use tandem::client::{ChannelProposal, ClientError, ProposalHandler, ProposalNotice, ProposalResponder};
use tandem::peer::TcpDialer;
use tandem::sim::{SimAdjudicator, SimBank, SimFunder};
use tandem::{Account, Address, Client, Ctx, U256};

#[derive(Debug, StructOpt)]
#[structopt(name = "demo", about = "two-party payment channel demo node")]
struct Opt {
    /// Path to the TOML configuration file.
    #[structopt(long, short, default_value = "demo.toml")]
    config: PathBuf,
}

#[derive(Debug, Deserialize)]
struct Cfg {
    channel: ChannelCfg,
    node: NodeCfg,
    chain: ChainCfg,
    seed: u64,
}

/// Timeouts are in seconds.
#[derive(Debug, Deserialize)]
struct ChannelCfg {
    timeout: u64,
    fund_timeout: u64,
    settle_timeout: u64,
    challenge_duration_sec: u64,
}

#[derive(Debug, Deserialize)]
struct NodeCfg {
    ip: String,
    in_port: u16,
    out_port: u16,
    dial_timeout: u64,
    handle_timeout: u64,
}

#[derive(Debug, Deserialize)]
struct ChainCfg {
    adj_deploy_timeout: u64,
    ass_deploy_timeout: u64,
    adjudicator: String,
    assetholder: String,
    url: String,
}

/// `"deploy"` or a hex contract address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContractSetting {
    Deploy,
    At(Address),
}

impl ContractSetting {
    fn parse(raw: &str) -> Result<ContractSetting, String> {
        if raw == "deploy" {
            return Ok(ContractSetting::Deploy);
        }
        Address::from_hex(raw)
            .map(ContractSetting::At)
            .ok_or_else(|| format!("'{raw}' is neither \"deploy\" nor a hex address"))
    }
}

fn chain_settings(cfg: &ChainCfg) -> Result<(ContractSetting, ContractSetting), String> {
    let adj = ContractSetting::parse(&cfg.adjudicator)?;
    let ass = ContractSetting::parse(&cfg.assetholder)?;
    match (adj, ass) {
        (ContractSetting::Deploy, ContractSetting::At(_))
        | (ContractSetting::At(_), ContractSetting::Deploy) => {
            Err("either both or none of the contracts can be deployed".into())
        }
        pair => Ok(pair),
    }
}

struct PeerEntry {
    addr: Address,
    channel: Option<tandem::ChannelId>,
}

struct Node {
    cfg: Cfg,
    client: Arc<Client>,
    dialer: Arc<TcpDialer>,
    bank: Arc<SimBank>,
    acc: Account,
    peers: StdMutex<HashMap<String, PeerEntry>>,
}

impl Node {
    fn ctx(&self, secs: u64) -> Ctx {
        Ctx::background().with_timeout(Duration::from_secs(secs))
    }

    fn peer_addr(&self, alias: &str) -> Result<Address, String> {
        self.peers
            .lock()
            .expect("peer map poisoned")
            .get(alias)
            .map(|p| p.addr)
            .ok_or_else(|| format!("unknown peer '{alias}'"))
    }

    fn peer_channel(&self, alias: &str) -> Result<tandem::ChannelId, String> {
        self.peers
            .lock()
            .expect("peer map poisoned")
            .get(alias)
            .and_then(|p| p.channel)
            .ok_or_else(|| format!("no open channel with '{alias}'"))
    }

    fn set_channel(&self, addr: Address, id: tandem::ChannelId) {
        let mut peers = self.peers.lock().expect("peer map poisoned");
        if let Some(entry) = peers.values_mut().find(|p| p.addr == addr) {
            entry.channel = Some(id);
            return;
        }
        let alias = format!("peer-{}", peers.len());
        peers.insert(
            alias,
            PeerEntry {
                addr,
                channel: Some(id),
            },
        );
    }

    async fn connect(&self, args: &[String]) -> Result<(), String> {
        // Either an explicit ip:port, or a bare IP with the configured
        // outgoing port.
        let sock: SocketAddr = match args[0].parse() {
            Ok(sock) => sock,
            Err(_) => format!("{}:{}", args[0], self.cfg.node.out_port)
                .parse()
                .map_err(|e| format!("invalid peer address: {e}"))?,
        };
        let addr = Address::from_hex(&args[1]).ok_or("invalid peer id")?;
        let alias = args[2].clone();

        {
            let mut peers = self.peers.lock().expect("peer map poisoned");
            if peers.contains_key(&alias) {
                return Err(format!("peer '{alias}' exists already"));
            }
            peers.insert(
                alias,
                PeerEntry {
                    addr,
                    channel: None,
                },
            );
        }
        self.dialer.register(addr, sock);

        let ctx = self.ctx(self.cfg.node.dial_timeout);
        self.client
            .connect_peer(&ctx, addr)
            .await
            .map_err(|e| format!("could not connect to peer: {e}"))
    }

    async fn open(&self, args: &[String]) -> Result<(), String> {
        let addr = self.peer_addr(&args[0])?;
        let our: u64 = args[1].parse().map_err(|_| "invalid balance")?;
        let their: u64 = args[2].parse().map_err(|_| "invalid balance")?;

        let mut rng = rand::thread_rng();
        let prop = ChannelProposal {
            challenge_duration: self.cfg.channel.challenge_duration_sec,
            nonce: rng.gen(),
            app_def: Address::default(),
            init_data: vec![],
            init_allocation: Allocation::single_asset([our.into(), their.into()]),
            peers: [self.client.address(), addr],
        };

        let ctx = self.ctx(self.cfg.channel.timeout + self.cfg.channel.fund_timeout);
        let channel = self
            .client
            .propose_channel(&ctx, prop)
            .await
            .map_err(|e| render_error(&e))?;
        self.set_channel(addr, channel.id());
        println!("channel open, id {:?}", channel.id());
        Ok(())
    }

    async fn send(&self, args: &[String]) -> Result<(), String> {
        let id = self.peer_channel(&args[0])?;
        let amount: u64 = args[1].parse().map_err(|_| "invalid amount")?;
        let channel = self.client.channel(id).map_err(|e| e.to_string())?;

        let ctx = self.ctx(self.cfg.channel.timeout);
        channel
            .transfer(&ctx, 0, U256::from(amount))
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn close(&self, args: &[String]) -> Result<(), String> {
        let id = self.peer_channel(&args[0])?;
        let channel = self.client.channel(id).map_err(|e| e.to_string())?;

        let ctx = self.ctx(self.cfg.channel.timeout);
        channel
            .close_normal(&ctx)
            .await
            .map_err(|e| e.to_string())?;
        let ctx = self.ctx(self.cfg.channel.settle_timeout);
        channel.settle(&ctx).await.map_err(|e| e.to_string())?;

        if let Some(state) = channel.state() {
            println!("final balances:");
            for part in 0..2 {
                let bal = state
                    .allocation()
                    .balance(0, part)
                    .map_err(|e| e.to_string())?;
                println!("  participant {part}: {bal}");
            }
        }
        println!("withdrawn: {}", self.bank.payout(self.client.address()));
        Ok(())
    }

    fn info(&self) {
        println!("node id: {:?}", self.client.address());
        let peers = self.peers.lock().expect("peer map poisoned");
        if peers.is_empty() {
            println!("no peers connected");
        }
        for (alias, entry) in peers.iter() {
            match entry.channel.and_then(|id| self.client.channel(id).ok()) {
                Some(channel) => {
                    let phase = channel.phase();
                    match channel.state() {
                        Some(state) => {
                            let ours = state.allocation().balance(0, channel.idx());
                            let theirs = state.allocation().balance(0, 1 - channel.idx());
                            println!(
                                "{alias}: {:?} channel v{} phase {phase} ours {:?} theirs {:?}",
                                entry.addr,
                                state.version(),
                                ours,
                                theirs,
                            );
                        }
                        None => println!("{alias}: {:?} channel opening", entry.addr),
                    }
                }
                None => println!("{alias}: {:?} no channel", entry.addr),
            }
        }
    }
}

fn render_error(err: &ClientError) -> String {
    if tandem::adjudicator::is_asset_funding_error(err) {
        if let Some(afe) = tandem::adjudicator::asset_funding_error(err) {
            return format!("funding failed, peers {:?} did not deposit", afe.timed_out);
        }
    }
    err.to_string()
}

/// Accepts every inbound payment channel proposal with the node account.
/// Holds the node weakly; the client owns the handler.
struct DemoProposalHandler {
    node: tokio::sync::OnceCell<std::sync::Weak<Node>>,
}

#[async_trait]
impl ProposalHandler for DemoProposalHandler {
    async fn handle(&self, notice: ProposalNotice, responder: ProposalResponder) {
        let Some(node) = self.node.get().and_then(std::sync::Weak::upgrade) else {
            return;
        };
        let proposer = notice.req.peers[0];
        let ctx = node.ctx(node.cfg.node.handle_timeout + node.cfg.channel.fund_timeout);
        match responder.accept(&ctx, node.acc.clone()).await {
            Ok(channel) => {
                node.set_channel(proposer, channel.id());
                println!("\naccepted channel proposal from {proposer:?}");
            }
            Err(error) => {
                eprintln!("\naccepting proposal failed: {error}");
            }
        }
    }
}

const HELP: &str = "\
connect <ip:port> <hex-id> <alias>   connect to a peer and give it an alias
open <alias> <our> <their>           open a payment channel with a peer
send <alias> <amount>                pay over the open channel
close <alias>                        finalize, settle and withdraw
info                                 show peers and channels
help                                 this text
exit                                 quit";

async fn repl(node: Arc<Node>) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await.ok();
        stdout.flush().await.ok();
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            _ => break,
        };
        let parts: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        let Some((cmd, args)) = parts.split_first() else {
            continue;
        };

        let res = match (cmd.as_str(), args.len()) {
            ("connect", 3) => node.connect(args).await,
            ("open", 3) => node.open(args).await,
            ("send", 2) => node.send(args).await,
            ("close", 1) => node.close(args).await,
            ("info", 0) => {
                node.info();
                Ok(())
            }
            ("help", 0) => {
                println!("{HELP}");
                Ok(())
            }
            ("exit", 0) => break,
            _ => Err(format!("unknown command or wrong arguments: '{line}'")),
        };
        if let Err(msg) = res {
            eprintln!("error: {msg}");
        }
    }
    node.client.close().await;
}

fn load_config(path: &PathBuf) -> Result<Cfg, String> {
    let cfg = config::Config::builder()
        .add_source(config::File::from(path.as_path()))
        .build()
        .map_err(|e| format!("loading config: {e}"))?;
    cfg.try_deserialize().map_err(|e| format!("parsing config: {e}"))
}

async fn run(opt: Opt) -> Result<(), String> {
    let cfg = load_config(&opt.config)?;
    let (adjudicator_setting, _assetholder_setting) = chain_settings(&cfg.chain)?;
    if adjudicator_setting == ContractSetting::Deploy {
        println!(
            "deploying simulated adjudicator and asset holder via {} \
             (timeouts {}s/{}s)",
            cfg.chain.url, cfg.chain.adj_deploy_timeout, cfg.chain.ass_deploy_timeout,
        );
    } else {
        println!("attaching to configured contracts (simulated backend)");
    }

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let acc = Account::new(&mut rng);
    println!("node id: {:?}", acc.address());

    let bank = Arc::new(SimBank::new());
    let dialer = Arc::new(TcpDialer::new());
    let handler = Arc::new(DemoProposalHandler {
        node: tokio::sync::OnceCell::new(),
    });

    let client = Client::new(
        acc.clone(),
        dialer.clone(),
        handler.clone(),
        Arc::new(AcceptAllUpdates),
        Arc::new(SimFunder::new(bank.clone())),
        Arc::new(SimAdjudicator::new(bank.clone())),
        None,
    );

    let bind: SocketAddr = format!("{}:{}", cfg.node.ip, cfg.node.in_port)
        .parse()
        .map_err(|e| format!("invalid node.ip/node.in_port: {e}"))?;
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| format!("binding {bind}: {e}"))?;
    println!("listening on {bind}");

    let node = Arc::new(Node {
        cfg,
        client: client.clone(),
        dialer,
        bank,
        acc,
        peers: StdMutex::new(HashMap::new()),
    });
    handler
        .node
        .set(Arc::downgrade(&node))
        .map_err(|_| "node initialized twice".to_string())?;

    let listen_client = client.clone();
    tokio::spawn(async move {
        listen_client.listen(listener).await;
    });

    repl(node).await;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let opt = Opt::from_args();
    if let Err(msg) = run(opt).await {
        eprintln!("fatal: {msg}");
        std::process::exit(1);
    }
}
