//! `mta-deliver`: a small CLI harness that drives one outbound delivery
//! session end to end against a real remote host, using the in-memory
//! collaborator fakes from [`mta_rs::collab::inmemory`] in place of a real
//! queue/route manager. This is a manual-testing tool, not a production
//! entry point — the queue subsystem and route manager stay out of this
//! crate's scope.

use clap::Parser;
use mta_rs::collab::inmemory::{InMemoryQueue, NullCertAuthority, OneShotRouteManager};
use mta_rs::collab::{Relay, Route};
use mta_rs::config::{Config, RelayPolicy, SecurityPolicy};
use mta_rs::dns::HickoryPtrResolver;
use mta_rs::metrics::Metrics;
use mta_rs::smtp::supervisor::Collaborators;
use mta_rs::smtp::task::{Mailbox, Task};
use mta_rs::smtp::Supervisor;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "mta-deliver")]
#[command(about = "Drive a single outbound SMTP delivery session against a remote host", long_about = None)]
struct Cli {
    /// Destination IP address of the remote SMTP server.
    #[arg(long)]
    host: IpAddr,

    /// Envelope sender (empty for a bounce). Format: user@domain.
    #[arg(long, default_value = "")]
    from: String,

    /// Envelope recipient(s). Format: user@domain. May be repeated.
    #[arg(long = "to", required = true)]
    to: Vec<String>,

    /// Path to the RFC 5322 message to send.
    #[arg(long)]
    message: std::path::PathBuf,

    /// TLS policy for this delivery attempt.
    #[arg(long, value_enum, default_value_t = SecurityArg::Opportunistic)]
    security: SecurityArg,

    /// Path to a TOML config overriding session defaults.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum SecurityArg {
    Plain,
    Opportunistic,
    ForceTls,
    ForceSmtps,
    ForceAnySsl,
}

impl From<SecurityArg> for SecurityPolicy {
    fn from(value: SecurityArg) -> Self {
        match value {
            SecurityArg::Plain => SecurityPolicy::ForcePlain,
            SecurityArg::Opportunistic => SecurityPolicy::Opportunistic,
            SecurityArg::ForceTls => SecurityPolicy::ForceTls,
            SecurityArg::ForceSmtps => SecurityPolicy::ForceSmtps,
            SecurityArg::ForceAnySsl => SecurityPolicy::ForceAnySsl,
        }
    }
}

fn parse_mailbox(s: &str) -> Mailbox {
    match s.split_once('@') {
        Some((user, domain)) => Mailbox::new(user, domain),
        None => Mailbox::empty(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    info!("mta-deliver: delivering {} to {} recipient(s)", cli.message.display(), cli.to.len());

    let body = tokio::fs::read(&cli.message).await?;
    let message_id = uuid::Uuid::new_v4();
    let sender = parse_mailbox(&cli.from);
    let recipients: Vec<Mailbox> = cli.to.iter().map(|s| parse_mailbox(s)).collect();
    let task = Task::new(message_id, sender, recipients);

    let relay = Arc::new(Relay {
        name: cli.host.to_string(),
        policy: RelayPolicy {
            security: cli.security.into(),
            secret: None,
            client_cert_name: None,
            port_override: None,
        },
    });
    let route = Arc::new(Route {
        source_addr: None,
        dest_addr: cli.host,
        dest_ptrname: None,
    });

    let queue = Arc::new(InMemoryQueue::new().with_message(message_id, body));
    let route_manager = Arc::new(OneShotRouteManager::new(vec![task]));
    let collaborators = Collaborators {
        queue: queue.clone(),
        route_manager: route_manager.clone(),
        ca: Arc::new(NullCertAuthority),
        ptr_resolver: Arc::new(HickoryPtrResolver::new()),
        metrics: Arc::new(Metrics::new()),
    };

    let supervisor = Supervisor::new(config.session, collaborators);
    match supervisor.start(relay, route).await {
        Ok(outcome) => {
            info!("session completed: delivered_count={}", outcome.delivered_count);
        }
        Err(failure) => {
            tracing::error!("session failed: {}", failure);
        }
    }

    for (message_id, envelope_id, verdict, text) in queue.reports.lock().await.iter() {
        println!("{} {} -> {:?}: {}", message_id, envelope_id, verdict, text);
    }
    for event in route_manager.events.lock().unwrap().iter() {
        println!("route event: {}", event);
    }

    Ok(())
}
