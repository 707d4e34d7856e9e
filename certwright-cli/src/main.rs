//! certwright - ACME certificate lifecycle coordinator CLI.
//!
//! A thin command-line driver over `certwright-core`'s `Certs` facade, for
//! operating on a shared Redis-backed certificate store out of band from
//! whatever HTTP server embeds the library.

use anyhow::Context;
use certwright_core::{Certs, CertsConfig, KvClient, RedisKvClient};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "certwright")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Redis connection URL backing the shared certificate store
    #[arg(long, global = true, env = "CERTS_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Key prefix; entities live under "{namespace}:certs:"
    #[arg(long, global = true, env = "CERTS_NAMESPACE", default_value = "certwright")]
    namespace: String,

    /// ACME directory URL (e.g. Let's Encrypt production or staging)
    #[arg(
        long,
        global = true,
        env = "CERTS_DIRECTORY_URL",
        default_value = "https://acme-v02.api.letsencrypt.org/directory"
    )]
    directory_url: String,

    /// ACME account environment label
    #[arg(long, global = true, env = "CERTS_ENVIRONMENT", default_value = "development")]
    environment: String,

    /// Contact email used when provisioning a new ACME account
    #[arg(long, global = true, env = "CERTS_EMAIL")]
    email: Option<String>,

    /// Allowed CAA issuer domains (repeatable, comma-separated via env); empty disables CAA checking
    #[arg(long = "caa-domain", global = true, env = "CERTS_CAA_DOMAINS", value_delimiter = ',')]
    caa_domains: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Return a currently-valid certificate for a domain, provisioning or
    /// renewing it as needed
    Get {
        /// Domain to fetch a certificate for
        domain: String,
    },

    /// Unconditionally run the renewal state machine for a domain
    Acquire {
        /// Domain to acquire/renew a certificate for
        domain: String,
    },

    /// Print the cached or freshly-provisioned ACME account for this environment
    Account,

    /// Resolve a stored HTTP-01 challenge response, as the hosting server would
    Route {
        /// Host header of the inbound challenge request
        host: String,
        /// Challenge token from the request path
        token: String,
    },
}

fn build_config(cli: &Cli) -> CertsConfig {
    let mut config = CertsConfig::default()
        .with_namespace(cli.namespace.clone())
        .with_acme_directory_url(cli.directory_url.clone())
        .with_acme_environment(cli.environment.clone())
        .with_caa_domains(cli.caa_domains.clone());
    if let Some(email) = &cli.email {
        config = config.with_acme_email(email.clone());
    }
    config
}

/// Every timestamp `certwright_core` works with — `valid_to`, challenge
/// expiry, `lastCheck` — is a Unix epoch in seconds, not milliseconds.
fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.verbose {
        tracing::info!("verbose mode enabled");
    }

    let kv: Arc<dyn KvClient> = Arc::new(
        RedisKvClient::connect(&cli.redis_url)
            .await
            .with_context(|| format!("connecting to redis at {}", cli.redis_url))?,
    );
    let config = build_config(&cli);
    let certs = Certs::create(kv, config);
    let now = now_secs();

    match cli.command {
        Commands::Get { domain } => {
            let outcome = certs.get_certificate(&domain, now).await?;
            print_outcome(&domain, outcome);
        }
        Commands::Acquire { domain } => {
            let outcome = certs.acquire_cert(&domain, now).await?;
            print_outcome(&domain, outcome);
        }
        Commands::Account => {
            let account = certs.get_acme_account().await?;
            println!("kid: {}", account.account.kid);
            println!("directory: {}", account.account.directory_url);
        }
        Commands::Route { host, token } => match certs.route_handler(&host, &token, now).await {
            Ok(key_authorization) => println!("{key_authorization}"),
            Err(err) => {
                eprintln!("error ({}): {}", err.code().as_str(), err);
                std::process::exit(1);
            }
        },
    }

    Ok(())
}

fn print_outcome(domain: &str, outcome: certwright_core::CertOutcome) {
    use certwright_core::CertOutcome;
    match outcome {
        CertOutcome::Record(record) => {
            println!("domain: {}", record.domain);
            println!("status: {:?}", record.status);
            println!("certVersion: {}", record.cert_version);
            if let Some(valid_to) = record.valid_to {
                println!("validTo: {valid_to}");
            }
        }
        CertOutcome::Absent => {
            println!("{domain}: no record (never provisioned or validation failed)");
        }
        CertOutcome::AccountUnavailable => {
            eprintln!("{domain}: ACME account unavailable");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
