//! Partyline demo CLI
//!
//! Runs simulated participants over an in-process relay so the signaling
//! flows (presence, calls, glare-free negotiation, key bootstrap) can be
//! watched end to end without any network.

use anyhow::Result;
use clap::{Parser, Subcommand};
use partyline_core::prelude::*;
use partyline_core::NegotiationError;
use rand::Rng;
use router::{LoopbackRouter, RouterGateway};
use std::sync::Arc;
use std::time::Duration;

mod router;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Participant identifier on the signaling channel
    #[arg(short, long, env = "PARTYLINE_IDENTITY")]
    identity: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a simulated peer over the in-process relay
    Call {
        /// Peer to call
        peer: String,

        /// Bootstrap a media key before offering
        #[arg(long)]
        encrypt: bool,

        /// Seconds an unanswered ring may last
        #[arg(long, default_value = "30")]
        ring_timeout: u64,

        /// Have the simulated peer decline instead of answering
        #[arg(long)]
        decline: bool,
    },

    /// Run an auto-connecting mesh of simulated participants
    Mesh {
        /// How many participants to spawn
        #[arg(long, default_value = "3")]
        peers: usize,

        /// Bootstrap media keys between every pair
        #[arg(long)]
        encrypt: bool,
    },

    /// Show protocol defaults and supported signal types
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("partyline=info")
        .init();

    let cli = Cli::parse();
    let identity = cli.identity.unwrap_or_else(generate_random_identity);

    println!("🔗 Using identity: {identity}");

    match cli.command {
        Commands::Call {
            peer,
            encrypt,
            ring_timeout,
            decline,
        } => {
            handle_call(&identity, &peer, encrypt, ring_timeout, decline).await?;
        }
        Commands::Mesh { peers, encrypt } => {
            handle_mesh(peers, encrypt).await?;
        }
        Commands::Status => {
            handle_status();
        }
    }

    Ok(())
}

/// Capability stub that fabricates plausible session descriptions
struct DemoNegotiator {
    local: ParticipantId,
    peer: ParticipantId,
}

#[async_trait::async_trait]
impl Negotiator for DemoNegotiator {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        Ok(SessionDescription(serde_json::json!({
            "type": "offer",
            "sdp": format!("v=0 o={} s=partyline-demo t={}", self.local, self.peer),
        })))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        Ok(SessionDescription(serde_json::json!({
            "type": "answer",
            "sdp": format!("v=0 o={} s=partyline-demo t={}", self.local, self.peer),
        })))
    }

    async fn set_local_description(
        &self,
        _description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        Ok(())
    }

    async fn set_remote_description(
        &self,
        _description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        Ok(())
    }

    async fn add_remote_candidate(&self, _candidate: Candidate) -> Result<(), NegotiationError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        Ok(())
    }
}

struct DemoMedia {
    local: ParticipantId,
}

#[async_trait::async_trait]
impl NegotiatorFactory for DemoMedia {
    async fn create(&self, peer: &ParticipantId) -> Result<Arc<dyn Negotiator>, NegotiationError> {
        Ok(Arc::new(DemoNegotiator {
            local: self.local.clone(),
            peer: peer.clone(),
        }))
    }
}

/// Attach a participant to the relay and pump its inbox into the board
async fn spawn_participant(
    router: &Arc<LoopbackRouter>,
    name: &str,
    config: SwitchboardConfig,
) -> Switchboard<RouterGateway> {
    let id = ParticipantId::new(name);
    let mut inbox = router.attach(id.clone()).await;
    let board = Switchboard::builder(
        id.clone(),
        Arc::new(router.gateway()),
        Arc::new(DemoMedia { local: id }) as Arc<dyn NegotiatorFactory>,
    )
    .with_config(config)
    .build();

    let pump = board.clone();
    tokio::spawn(async move {
        while let Some(raw) = inbox.recv().await {
            if let Err(error) = pump.handle_envelope(&raw).await {
                tracing::warn!(%error, "dropping undecodable envelope");
            }
        }
    });
    board
}

async fn handle_call(
    identity: &str,
    peer: &str,
    encrypt: bool,
    ring_timeout: u64,
    decline: bool,
) -> Result<()> {
    let router = Arc::new(LoopbackRouter::default());

    // The simulated peer, answering (or declining) its own bell
    let callee = spawn_participant(&router, peer, SwitchboardConfig::default()).await;
    let answering = callee.clone();
    let callee_name = peer.to_string();
    tokio::spawn(async move {
        let mut events = answering.subscribe_events();
        while let Ok(event) = events.recv().await {
            if let SwitchboardEvent::IncomingCall { from, encrypted } = event {
                if decline {
                    println!("🙅 {callee_name} declines the call from {from}");
                    if let Err(error) = answering.reject_call().await {
                        tracing::warn!(%error, "reject failed");
                    }
                } else {
                    println!(
                        "🔔 {callee_name} answers {from} (encryption requested: {encrypted})"
                    );
                    if let Err(error) = answering.accept_call().await {
                        tracing::warn!(%error, "accept failed");
                    }
                }
            }
        }
    });
    callee.join().await?;

    let config = SwitchboardConfig {
        encryption: encrypt,
        ring_timeout: Duration::from_secs(ring_timeout),
        ..SwitchboardConfig::default()
    };
    let caller = spawn_participant(&router, identity, config).await;
    let mut events = caller.subscribe_events();
    caller.join().await?;

    println!("📞 Calling {peer}...");
    caller.initiate_call(&ParticipantId::new(peer)).await?;

    let window = Duration::from_secs(ring_timeout + 5);
    loop {
        let event = match tokio::time::timeout(window, events.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(_)) => anyhow::bail!("event stream closed unexpectedly"),
            Err(_) => anyhow::bail!("demo timed out waiting for signaling"),
        };
        match event {
            SwitchboardEvent::CallAccepted { peer } => {
                println!("✅ {peer} picked up");
            }
            SwitchboardEvent::EncryptionEnabled { peer } => {
                println!("🔐 {peer} acknowledged the media key");
            }
            SwitchboardEvent::NegotiationComplete { peer } => {
                println!("🤝 negotiation stable with {peer}, hanging up");
                caller.end_call().await?;
                break;
            }
            SwitchboardEvent::CallRejected { peer, reason } => {
                println!("❌ {peer}: {reason}");
                break;
            }
            SwitchboardEvent::CallEnded { peer } => {
                println!("📴 {peer} hung up");
                break;
            }
            other => {
                tracing::debug!(?other, "signaling event");
            }
        }
    }

    caller.leave().await?;
    callee.leave().await?;
    println!("📞 Call demo finished");
    Ok(())
}

async fn handle_mesh(peers: usize, encrypt: bool) -> Result<()> {
    let count = peers.max(2);
    let router = Arc::new(LoopbackRouter::default());
    let config = SwitchboardConfig {
        auto_connect: true,
        encryption: encrypt,
        ..SwitchboardConfig::default()
    };

    let mut boards = Vec::with_capacity(count);
    for index in 0..count {
        let name = format!("peer-{index:02}");
        let board = spawn_participant(&router, &name, config.clone()).await;
        board.join().await?;
        println!("🔗 {name} joined");
        boards.push(board);
    }

    // Every ordered pair must reach a stable session; the id tie-break
    // means exactly one side of each pair did the offering
    let total = count * (count - 1);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let mut stable = 0;
        for left in &boards {
            for right in &boards {
                if left.local_id() == right.local_id() {
                    continue;
                }
                if left.negotiation_state(right.local_id()).await
                    == Some(NegotiationState::Stable)
                {
                    stable += 1;
                }
            }
        }
        println!("   {stable}/{total} sessions stable");
        if stable == total {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("mesh did not stabilize within 5s");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    println!("✅ full mesh negotiated");
    for board in &boards {
        let roster = board.roster().await;
        let encrypted = if encrypt { " (encrypted)" } else { "" };
        println!(
            "   {} sees {} peer(s){encrypted}",
            board.local_id(),
            roster.len()
        );
    }

    for board in &boards {
        board.leave().await?;
    }
    println!("👋 Mesh demo finished");
    Ok(())
}

fn handle_status() {
    println!("📊 Partyline protocol defaults");
    println!("==============================");
    let defaults = SwitchboardConfig::default();
    println!("Ring timeout:      {:?}", defaults.ring_timeout);
    println!(
        "Presence retries:  {} every {:?}",
        defaults.presence_retry.attempts, defaults.presence_retry.backoff
    );
    println!(
        "Envelope cap:      {} KiB",
        partyline_core::MAX_ENVELOPE_SIZE / 1024
    );
    println!();
    println!("Signal types: JOIN, LEAVE, USER_LIST, REQUEST_USERS, OFFER,");
    println!("  ANSWER, ICE, CALL_REQUEST, CALL_ACCEPTED, CALL_REJECTED,");
    println!("  CALL_ENDED, KEY_EXCHANGE, ENCRYPTION_ENABLED");
    println!();
    println!("Use 'partyline --help' for detailed options");
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "amber", "basalt", "cedar", "delta", "ember", "flint", "garnet", "hazel", "indigo",
        "juniper", "krypton", "larch", "maple", "nickel", "onyx", "pewter", "quartz", "rowan",
        "slate", "tundra", "umber", "velvet", "willow", "xenon", "yarrow", "zephyr",
    ];

    let mut rng = rand::thread_rng();
    format!(
        "{}-{}-{:03}",
        WORDS[rng.gen_range(0..WORDS.len())],
        WORDS[rng.gen_range(0..WORDS.len())],
        rng.gen_range(0..1000)
    )
}
