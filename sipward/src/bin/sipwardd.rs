//! The sipward server binary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sipward::auth::nonce::NonceStore;
use sipward::auth::{AuthService, DigestAuthenticator};
use sipward::proxy::ProxyService;
use sipward::registrar::{MemoryRegistrar, RegistrarService};
use sipward::users::MemoryUserStore;
use sipward::{Endpoint, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "sipwardd", about = "Stateful SIP forwarding proxy and registrar")]
struct Args {
    /// Address to listen on, UDP and TCP.
    #[arg(long, default_value = "0.0.0.0:5060")]
    listen: SocketAddr,

    /// Host name or address written into Via headers on forwarding.
    #[arg(long)]
    host: Option<String>,

    /// Digest realm challenged for.
    #[arg(long, default_value = "example.com")]
    realm: String,

    /// Provision a user, as name:password. Repeatable.
    #[arg(long = "user", value_name = "NAME:PASSWORD")]
    users: Vec<String>,

    /// Nonce lifetime in seconds.
    #[arg(long, default_value_t = 300)]
    nonce_ttl: u64,

    /// Max-Forwards injected when a request carries none.
    #[arg(long, default_value_t = 70)]
    max_forwards: i32,

    /// Reject INVITEs that do not negotiate session timers.
    #[arg(long, default_value_t = false)]
    require_session_timer: bool,
}

#[tokio::main]
async fn main() -> sipward::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    // A wildcard listen address cannot go into Via; fall back to the
    // machine's routable address.
    let server_host = args.host.clone().unwrap_or_else(|| {
        let ip = args.listen.ip();
        if ip.is_unspecified() {
            local_ip_address::local_ip()
                .map(|local| local.to_string())
                .unwrap_or_else(|_| ip.to_string())
        } else {
            ip.to_string()
        }
    });

    let config = ServerConfig {
        realm: args.realm.clone(),
        server_host,
        server_port: args.listen.port(),
        nonce_ttl: Duration::from_secs(args.nonce_ttl),
        max_forwards_default: args.max_forwards,
        require_session_timer: args.require_session_timer,
        ..ServerConfig::default()
    };

    let users = Arc::new(MemoryUserStore::new());
    for entry in &args.users {
        let Some((name, password)) = entry.split_once(':') else {
            tracing::error!("Ignoring malformed --user '{}', expected NAME:PASSWORD", entry);
            continue;
        };
        users.add_user(name, &config.realm, password);
        tracing::info!("Provisioned user {}@{}", name, config.realm);
    }

    let nonces = Arc::new(NonceStore::new(config.nonce_ttl));
    nonces.start_sweeper(config.nonce_sweep_interval);

    let authenticator = Arc::new(DigestAuthenticator::new(&config.realm, nonces, users));
    let registrar = Arc::new(MemoryRegistrar::new());

    let endpoint = Endpoint::builder()
        .with_config(config.clone())
        .with_udp(args.listen)
        .with_tcp(args.listen)
        .with_service(AuthService::new(authenticator))
        .with_service(RegistrarService::new(registrar.clone()))
        .with_service(ProxyService::new(registrar, config.proxy_settings()))
        .build()
        .await?;

    tracing::info!(
        "sipward listening on {} (realm {}, Via authority {}:{})",
        args.listen,
        config.realm,
        config.server_host,
        config.server_port
    );

    endpoint.run().await
}
