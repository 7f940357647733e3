use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use pagegate::guard::AddressPolicy;
use pagegate::rewrite::ScriptPolicy;
use pagegate::ProxyConfig;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ScriptMode {
    /// Remove scripts from proxied pages.
    Strip,
    /// Keep scripts and rewrite literal fetch/WebSocket URLs in them.
    Rewrite,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "same-origin rewriting web proxy")]
struct Args {
    /// Listen address.
    #[arg(long, env = "PAGEGATE_LISTEN", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Shared access key; when set, requests need `?key=` or `x-proxy-key`.
    #[arg(long, env = "PAGEGATE_ACCESS_KEY")]
    access_key: Option<String>,

    /// Allowed Origin header values. Accepts multiple entries or
    /// comma-separated values; empty means no origin check.
    #[arg(long = "allowed-origin", env = "PAGEGATE_ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// How to treat scripts in proxied HTML.
    #[arg(long, env = "PAGEGATE_SCRIPT_POLICY", value_enum, default_value = "strip")]
    script_policy: ScriptMode,

    /// Maximum number of live (session, host) cookie jars.
    #[arg(long, env = "PAGEGATE_JAR_CAPACITY", default_value_t = 1024)]
    jar_capacity: usize,

    /// Idle seconds before a cookie jar is dropped.
    #[arg(long, env = "PAGEGATE_JAR_TTL_SECS", default_value_t = 1800)]
    jar_ttl_secs: u64,

    /// Upper bound in seconds for one proxied request, redirects included.
    #[arg(long, env = "PAGEGATE_UPSTREAM_TIMEOUT_SECS", default_value_t = 15)]
    upstream_timeout_secs: u64,

    /// Drop Referer/Origin before forwarding upstream.
    #[arg(
        long,
        env = "PAGEGATE_CONCEAL_ORIGIN",
        action = clap::ArgAction::Set,
        default_value_t = true
    )]
    conceal_origin: bool,

    /// Hostnames or IP literals exempt from the address check. Accepts
    /// multiple entries or comma-separated values.
    #[arg(long = "trusted-host", env = "PAGEGATE_TRUSTED_HOSTS", value_delimiter = ',')]
    trusted_hosts: Vec<String>,

    /// Allow targets that resolve to private or loopback addresses.
    /// Intended for local development only.
    #[arg(long, env = "PAGEGATE_ALLOW_PRIVATE_TARGETS", default_value_t = false)]
    allow_private_targets: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pagegate=info,hyper=warn".into()),
        )
        .compact()
        .init();

    let mut cfg = ProxyConfig::new(args.listen);
    cfg.access_key = args.access_key;
    cfg.allowed_origins = args.allowed_origins;
    cfg.script_policy = match args.script_policy {
        ScriptMode::Strip => ScriptPolicy::Strip,
        ScriptMode::Rewrite => ScriptPolicy::Rewrite,
    };
    cfg.jar_capacity = args.jar_capacity;
    cfg.jar_ttl = Duration::from_secs(args.jar_ttl_secs);
    cfg.upstream_timeout = Duration::from_secs(args.upstream_timeout_secs);
    cfg.conceal_origin = args.conceal_origin;
    cfg.address_policy = if args.allow_private_targets {
        AddressPolicy::AllowPrivate
    } else if !args.trusted_hosts.is_empty() {
        AddressPolicy::TrustedHosts(args.trusted_hosts.into_iter().collect())
    } else {
        AddressPolicy::PublicOnly
    };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    match pagegate::spawn_proxy(cfg, shutdown).await {
        Ok((_bound, handle)) => {
            if let Err(err) = handle.await {
                eprintln!("server task failed: {err}");
                std::process::exit(1);
            }
        }
        Err(err) => {
            eprintln!("failed to start proxy: {err}");
            std::process::exit(1);
        }
    }
}
