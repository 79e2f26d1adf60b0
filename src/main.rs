use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use forgestr::auth::{
    create_protection_event, spawn_sweeper, transfer_template, validate_announcement, BranchRule,
};
use forgestr::config::{ensure_auth_cookie, ensure_nsec, keypair_from_keys, read_nsec};
use forgestr::{
    policy_from_config, Config, ForgeServer, MaintainerResolver, OwnershipResolver,
    ProtectionEvaluator, ProvisioningScheduler, SchedulerConfig, TickOutcome,
};
use forgestr_git::FsRepoManager;
use forgestr_relay::{
    normalize_key, public_key_hex, to_npub, unix_now, Event, EventSource, RelayClient,
    RepoCoordinate, UnsignedEvent,
};
use nostr::nips::nip19::ToBech32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "forgestr")]
#[command(about = "Git hosting with ownership and access control from signed Nostr events", long_about = None)]
struct Cli {
    /// Config file (default: ~/.forgestr/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the forgestr daemon (HTTP API + provisioning loop)
    Start {
        /// Overrides server.bind_address
        #[arg(long)]
        addr: Option<String>,
        /// Do not run the provisioning loop
        #[arg(long)]
        no_provision: bool,
    },
    /// Run a single provisioning pass and print the report
    Tick,
    /// Resolve the current owner of a repository
    Owner {
        /// Announcing key (npub or hex)
        genesis: String,
        repo: String,
    },
    /// Show owner, maintainers and privacy of a repository
    Maintainers {
        genesis: String,
        repo: String,
    },
    /// Validate a repository announcement read from a JSON file
    Validate {
        file: PathBuf,
        /// Expected repository id (d tag)
        #[arg(long)]
        repo: Option<String>,
    },
    /// Sign and publish the self-transfer for one of our own repositories
    Attest { repo: String },
    /// Sign and publish an ownership transfer
    Transfer {
        /// Announcing key of the repository (npub or hex)
        genesis: String,
        repo: String,
        /// Recipient (npub or hex)
        new_owner: String,
    },
    /// Sign and publish branch protection rules from a JSON file
    Protect { repo: String, rules: PathBuf },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("forgestr=info".parse().expect("static directive")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn relay_client(config: &Config) -> Arc<RelayClient> {
    Arc::new(
        RelayClient::new(config.nostr.relays.clone())
            .with_timeout(Duration::from_secs(config.nostr.fetch_timeout_secs)),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Start { addr, no_provision } => {
            let addr = addr.unwrap_or_else(|| config.server.bind_address.clone());
            let source: Arc<dyn EventSource> = relay_client(&config);

            let (keys, was_generated) = ensure_nsec()?;
            let npub = keys.public_key().to_bech32()
                .context("Failed to encode npub")?;
            let local_hex = keys.public_key().to_hex();

            let maintainers = Arc::new(MaintainerResolver::with_ttl(
                source.clone(),
                Duration::from_secs(config.cache.maintainer_ttl_secs),
            ));
            let sweeper = spawn_sweeper(
                maintainers.cache(),
                Duration::from_secs(config.cache.sweep_interval_secs),
            );
            let protection = Arc::new(ProtectionEvaluator::new(source.clone()));

            let mut server = ForgeServer::new(maintainers, protection, addr.clone());

            let scheduler = if config.provisioning.domain.is_empty() || no_provision {
                None
            } else {
                let access = policy_from_config(&config.provisioning, source.clone(), &local_hex)
                    .context("Invalid access policy configuration")?;
                let repos = Arc::new(FsRepoManager::new(&config.storage.repos_dir));
                let scheduler = Arc::new(ProvisioningScheduler::new(
                    source.clone(),
                    repos,
                    access,
                    scheduler_config(&config),
                ));
                scheduler.start();
                server = server.with_scheduler(scheduler.clone());
                Some(scheduler)
            };

            println!("Starting forgestr daemon on {}", addr);
            if was_generated {
                println!("Identity: {} (new)", npub);
            } else {
                println!("Identity: {}", npub);
            }
            println!("Relays: {} configured", config.nostr.relays.len());
            match &scheduler {
                Some(s) => {
                    println!("Provisioning: {} every {:?}", s.config().domain, s.config().interval);
                    println!("Repositories: {}", config.storage.repos_dir);
                }
                None => println!("Provisioning: disabled"),
            }

            if config.server.enable_auth {
                let (username, password) = ensure_auth_cookie()?;
                println!("Admin API: http://{}:{}@{}/api/attestations", username, password, addr);
                server = server.with_auth(username, password);
            } else {
                println!("Auth: disabled");
            }

            server.run().await?;

            if let Some(scheduler) = scheduler {
                scheduler.stop();
            }
            sweeper.abort();
        }
        Commands::Tick => {
            if config.provisioning.domain.is_empty() {
                bail!("provisioning.domain is not set in the config");
            }
            let source: Arc<dyn EventSource> = relay_client(&config);
            let (keys, _) = ensure_nsec()?;
            let access = policy_from_config(
                &config.provisioning,
                source.clone(),
                &keys.public_key().to_hex(),
            )?;
            let repos = Arc::new(FsRepoManager::new(&config.storage.repos_dir));
            let scheduler =
                ProvisioningScheduler::new(source, repos, access, scheduler_config(&config));

            match scheduler.tick().await {
                TickOutcome::Completed(report) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                TickOutcome::Skipped => println!("Tick skipped"),
            }
        }
        Commands::Owner { genesis, repo } => {
            let resolver = OwnershipResolver::new(relay_client(&config));
            let owner = resolver.current_owner(&genesis, &repo).await?;
            println!("{}", owner);
            println!("{}", to_npub(&owner)?);
        }
        Commands::Maintainers { genesis, repo } => {
            let resolver = MaintainerResolver::new(relay_client(&config));
            let set = resolver.maintainers(&genesis, &repo).await?;
            println!("{}", serde_json::to_string_pretty(&set)?);
        }
        Commands::Validate { file, repo } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let event: Event = serde_json::from_str(&content).context("Not a JSON event")?;
            match validate_announcement(&event, repo.as_deref()) {
                Ok(()) => println!("Valid announcement {}", event.id),
                Err(e) => bail!("Invalid announcement: {}", e),
            }
        }
        Commands::Attest { repo } => {
            let keys = read_nsec()?;
            let keypair = keypair_from_keys(&keys)?;
            let me = public_key_hex(&keypair);
            let coordinate = RepoCoordinate::new(&me, &repo)?;
            let template = transfer_template(&coordinate, &me, &me, unix_now());
            publish(&config, template, &keypair).await?;
        }
        Commands::Transfer { genesis, repo, new_owner } => {
            let keys = read_nsec()?;
            let keypair = keypair_from_keys(&keys)?;
            let me = public_key_hex(&keypair);
            let coordinate = RepoCoordinate::new(&genesis, &repo)?;
            let recipient = normalize_key(&new_owner)?;

            let current = OwnershipResolver::new(relay_client(&config))
                .current_owner(&coordinate.owner, &repo)
                .await?;
            if current != me {
                bail!("{} is owned by {}, not by this identity", coordinate, current);
            }

            let template = transfer_template(&coordinate, &me, &recipient, unix_now());
            publish(&config, template, &keypair).await?;
        }
        Commands::Protect { repo, rules } => {
            let keys = read_nsec()?;
            let keypair = keypair_from_keys(&keys)?;
            let content = std::fs::read_to_string(&rules)
                .with_context(|| format!("Failed to read {}", rules.display()))?;
            let rules: Vec<BranchRule> =
                serde_json::from_str(&content).context("Rules must be a JSON array")?;
            let template =
                create_protection_event(&public_key_hex(&keypair), &repo, &rules, unix_now())?;
            publish(&config, template, &keypair).await?;
        }
    }

    Ok(())
}

fn scheduler_config(config: &Config) -> SchedulerConfig {
    SchedulerConfig {
        domain: config.provisioning.domain.clone(),
        interval: Duration::from_secs(config.provisioning.interval_secs),
        batch_limit: config.provisioning.batch_limit,
    }
}

async fn publish(config: &Config, template: UnsignedEvent, keypair: &secp256k1::Keypair) -> Result<()> {
    let event = template.sign(keypair)?;
    let client = relay_client(config);
    let outcome = client.publish_event(&event, &[]).await?;

    for relay in &outcome.succeeded {
        info!("Accepted by {}", relay);
    }
    for (relay, reason) in &outcome.failed {
        println!("Rejected by {}: {}", relay, reason);
    }
    if !outcome.any_succeeded() {
        bail!("No relay accepted event {}", event.id);
    }
    println!("Published {} to {} relay(s)", event.id, outcome.succeeded.len());
    Ok(())
}
