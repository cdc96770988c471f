// bunker-cli - sign and encrypt through a NIP-46 remote signer
//
// Supports two signing modes:
// - NIP-46 remote signing via bunker:// (the stored session, recommended)
// - Direct nsec (for development and comparison)

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bunker_cli::nip46::{
    AuditLog, CipherPolicy, CipherScheme, ConnectionTarget, EventTemplate, FileStore, KeyValueStore,
    NostrSdkPool, RelayPool, RemoteSigner, SessionConfig, SigningMode, StoredSession,
};
use clap::{Parser, Subcommand};
use nostr::nips::{nip04, nip44};
use nostr_sdk::prelude::*;
use tokio::sync::Mutex;

/// How long `sign --publish` waits for relays to return the event
const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "bunker-cli")]
#[command(about = "Sign events and encrypt messages through a NIP-46 remote signer")]
#[command(version)]
struct Cli {
    /// Path to the state file holding the stored bunker session
    #[arg(short, long, env = "BUNKER_STATE", default_value = "~/.bunker-cli/state.json")]
    state: String,

    /// Nostr private key (nsec or hex); signs locally instead of through the bunker
    #[arg(short, long, env = "NOSTR_NSEC", hide_env_values = true)]
    nsec: Option<String>,

    /// Envelope cipher: auto, nip44 or nip04
    #[arg(long, default_value = "auto")]
    cipher: String,

    /// Per-request timeout in seconds
    #[arg(short, long, default_value_t = 30)]
    timeout: u64,

    /// Application name sent to the bunker with every request
    #[arg(long)]
    app_name: Option<String>,

    /// Suppress relay connection logs
    #[arg(short, long, default_value_t = false)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a bunker and store the session
    Connect {
        /// Bunker URI: bunker://<pubkey>?relay=wss://...&secret=TOKEN
        #[arg(env = "BUNKER_URI")]
        uri: String,
        /// Permissions to request, e.g. sign_event:1,nip44_encrypt
        #[arg(long)]
        perms: Option<String>,
    },
    /// Reconnect using the stored session
    Restore,
    /// Show the user's public key
    Whoami,
    /// Sign an event
    Sign {
        #[arg(short, long, default_value_t = 1)]
        kind: u16,
        #[arg(short, long)]
        content: String,
        /// Tag as comma-separated values, e.g. --tag t,nostr (repeatable)
        #[arg(short = 'T', long = "tag")]
        tags: Vec<String>,
        /// Publish the signed event and check that a relay returns it
        #[arg(long, default_value_t = false)]
        publish: bool,
        /// Relays to publish to (defaults to the bunker's relays)
        #[arg(long, value_delimiter = ',')]
        relays: Vec<String>,
    },
    /// NIP-04 encrypt a message for a peer
    Nip04Encrypt { pubkey: String, plaintext: String },
    /// NIP-04 decrypt a message from a peer
    Nip04Decrypt { pubkey: String, ciphertext: String },
    /// NIP-44 encrypt a message for a peer
    Nip44Encrypt { pubkey: String, plaintext: String },
    /// NIP-44 decrypt a message from a peer
    Nip44Decrypt { pubkey: String, ciphertext: String },
    /// Show the stored session without connecting
    Status,
    /// Erase the stored session
    Forget,
}

fn cipher_policy(flag: &str) -> Result<CipherPolicy> {
    if flag.eq_ignore_ascii_case("auto") {
        return Ok(CipherPolicy::default());
    }
    let scheme = CipherScheme::from_str(flag).context("--cipher must be auto, nip44 or nip04")?;
    Ok(CipherPolicy::Fixed(scheme))
}

fn parse_peer(pubkey: &str) -> Result<PublicKey> {
    PublicKey::parse(pubkey).with_context(|| format!("invalid public key: {}", pubkey))
}

fn build_template(kind: u16, content: &str, tags: &[String]) -> EventTemplate {
    tags.iter().fold(EventTemplate::new(kind, content), |template, tag| {
        template.tag(tag.split(',').map(str::trim))
    })
}

fn print_identity(public_key: &PublicKey) {
    println!("  npub: {}", public_key.to_bech32().unwrap_or_default());
    println!("  hex:  {}", public_key.to_hex());
}

/// Relays `sign --publish` targets
fn publish_relays(explicit: &[String], remote: Option<&RemoteSigner>) -> Result<Vec<String>> {
    if !explicit.is_empty() {
        return Ok(explicit.to_vec());
    }
    match remote.and_then(|r| r.session().target()) {
        Some(target) => Ok(target.relays().to_vec()),
        None => bail!("--publish needs --relays when signing with a local key"),
    }
}

async fn publish_and_verify(pool: &dyn RelayPool, relays: &[String], event: &Event) -> Result<()> {
    let outcome = pool.publish(relays, event).await.context("Failed to publish event")?;
    for (relay, reason) in &outcome.failed {
        eprintln!("⚠️  {} rejected the event: {}", relay, reason);
    }
    eprintln!("✓ Published to {} relay(s)", outcome.success.len());

    let found = pool
        .query(relays, Filter::new().id(event.id), VERIFY_TIMEOUT)
        .await
        .context("Failed to query relays for the published event")?;
    if found.iter().any(|e| e.id == event.id) {
        eprintln!("✓ Event {} is served by relays", event.id.to_hex());
    } else {
        eprintln!("⚠️  Event {} not returned by relays yet", event.id.to_hex());
    }
    Ok(())
}

/// Run a signing command with a local key
async fn run_local(keys: &Keys, command: &Commands, pool: &dyn RelayPool) -> Result<()> {
    match command {
        Commands::Whoami => {
            println!("Signing with a local key");
            print_identity(&keys.public_key());
        }
        Commands::Sign {
            kind,
            content,
            tags,
            publish,
            relays,
        } => {
            let template = build_template(*kind, content, tags);
            let tags = template
                .tags
                .iter()
                .map(|t| Tag::parse(t.clone()))
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("Invalid tag")?;
            let event = EventBuilder::new(Kind::from(template.kind), template.content.clone())
                .tags(tags)
                .custom_created_at(Timestamp::from(template.created_at))
                .sign_with_keys(keys)
                .context("Failed to sign event with local keys")?;
            println!("{}", event.as_json());
            if *publish {
                let relays = publish_relays(relays, None)?;
                publish_and_verify(pool, &relays, &event).await?;
            }
        }
        Commands::Nip04Encrypt { pubkey, plaintext } => {
            println!("{}", nip04::encrypt(keys.secret_key(), &parse_peer(pubkey)?, plaintext)?);
        }
        Commands::Nip04Decrypt { pubkey, ciphertext } => {
            println!("{}", nip04::decrypt(keys.secret_key(), &parse_peer(pubkey)?, ciphertext)?);
        }
        Commands::Nip44Encrypt { pubkey, plaintext } => {
            let ciphertext = nip44::encrypt(keys.secret_key(), &parse_peer(pubkey)?, plaintext, nip44::Version::V2)?;
            println!("{}", ciphertext);
        }
        Commands::Nip44Decrypt { pubkey, ciphertext } => {
            println!("{}", nip44::decrypt(keys.secret_key(), &parse_peer(pubkey)?, ciphertext)?);
        }
        Commands::Connect { .. } | Commands::Restore | Commands::Status | Commands::Forget => {
            unreachable!("Handled before signer selection");
        }
    }
    Ok(())
}

/// Run a signing command through the connected bunker
async fn run_remote(remote: &RemoteSigner, command: &Commands, pool: &dyn RelayPool) -> Result<()> {
    match command {
        Commands::Whoami => {
            let public_key = remote.get_public_key().await?;
            println!("Signing with NIP-46 bunker");
            print_identity(&public_key);
        }
        Commands::Sign {
            kind,
            content,
            tags,
            publish,
            relays,
        } => {
            let event = remote
                .sign_template(build_template(*kind, content, tags))
                .await
                .context("Bunker signing failed")?;
            println!("{}", event.as_json());
            if *publish {
                let relays = publish_relays(relays, Some(remote))?;
                publish_and_verify(pool, &relays, &event).await?;
            }
        }
        Commands::Nip04Encrypt { pubkey, plaintext } => {
            let peer = parse_peer(pubkey)?.to_hex();
            println!("{}", remote.nip04_encrypt(&peer, plaintext).await?);
        }
        Commands::Nip04Decrypt { pubkey, ciphertext } => {
            let peer = parse_peer(pubkey)?.to_hex();
            println!("{}", remote.nip04_decrypt(&peer, ciphertext).await?);
        }
        Commands::Nip44Encrypt { pubkey, plaintext } => {
            let peer = parse_peer(pubkey)?.to_hex();
            println!("{}", remote.nip44_encrypt(&peer, plaintext).await?);
        }
        Commands::Nip44Decrypt { pubkey, ciphertext } => {
            let peer = parse_peer(pubkey)?.to_hex();
            println!("{}", remote.nip44_decrypt(&peer, ciphertext).await?);
        }
        Commands::Connect { .. } | Commands::Restore | Commands::Status | Commands::Forget => {
            unreachable!("Handled before signer selection");
        }
    }
    Ok(())
}

/// Show stored session info without touching the network
fn show_status(store: &dyn KeyValueStore, state_path: &Path, nsec: Option<&str>) -> Result<()> {
    println!("=== bunker-cli status ===\n");

    match StoredSession::load(store)? {
        Some(stored) => {
            println!("Mode: 🔐 NIP-46 bunker (stored)");
            println!("  Remote signer: {}", stored.remote_signer_pubkey);
            match ConnectionTarget::parse(&stored.connection_string) {
                Ok(target) => {
                    println!("  Relays: {}", target.relays().join(", "));
                    println!("  URI: {}", target.to_uri());
                }
                Err(e) => println!("  Stored URI is invalid: {}", e),
            }
            if let Some(ref pk) = stored.user_pubkey {
                println!("  User pubkey: {}", pk);
            }
            if let Some(cipher) = stored.cipher {
                println!("  Cipher: {}", cipher);
            }
            println!("  Created: {}", stored.created_at);
            if let Some(ref last) = stored.last_connected {
                println!("  Last connected: {}", last);
            }
        }
        None if nsec.is_some() => println!("Mode: 🔑 Direct nsec"),
        None => println!("Mode: ❌ No signer configured"),
    }
    println!("  State file: {}", state_path.display());

    let audit_path = AuditLog::beside(state_path).path().to_path_buf();
    if let Ok(metadata) = std::fs::metadata(&audit_path) {
        println!("\nAudit log: {} ({} bytes)", audit_path.display(), metadata.len());
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let default_filter = if cli.quiet { "warn,nostr_relay_pool=off" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let state_path = PathBuf::from(cli.state.replace('~', &std::env::var("HOME").unwrap_or_default()));
    let store = Arc::new(FileStore::new(&state_path));
    let policy = cipher_policy(&cli.cipher)?;

    if let Commands::Status = cli.command {
        return show_status(store.as_ref(), &state_path, cli.nsec.as_deref());
    }

    let perms = match &cli.command {
        Commands::Connect { perms, .. } => perms.clone(),
        _ => None,
    };
    let config = SessionConfig {
        request_timeout: Duration::from_secs(cli.timeout),
        app_name: cli.app_name.clone(),
        perms,
        ..SessionConfig::default()
    };

    let pool = Arc::new(NostrSdkPool::new(Client::default()));
    let audit = Arc::new(Mutex::new(AuditLog::beside(&state_path)));
    let remote = RemoteSigner::new(pool.clone(), store.clone(), config).with_audit(audit);

    let mut challenges = remote.auth_challenges();
    tokio::spawn(async move {
        while let Ok(url) = challenges.recv().await {
            eprintln!("🔐 The bunker asks for approval, open: {}", url);
        }
    });

    match &cli.command {
        Commands::Connect { uri, .. } => {
            eprintln!("🔐 Connecting to bunker...");
            let public_key = remote.connect(uri, policy).await.context(
                "Failed to connect to bunker. Check that the bunker is online, \
                 its relays are reachable and the connection token is still valid",
            )?;
            println!("✓ Connected to bunker");
            print_identity(&public_key);
            println!("  State: {}", state_path.display());
            remote.disconnect().await;
        }
        Commands::Restore => {
            let public_key = remote
                .restore(policy)
                .await
                .context("Failed to reconnect to the stored bunker")?;
            println!("✓ Reconnected to bunker");
            print_identity(&public_key);
            remote.disconnect().await;
        }
        Commands::Forget => {
            remote.forget().await?;
            println!("✓ Stored bunker session erased");
        }
        Commands::Status => unreachable!("Handled above"),
        command => match SigningMode::resolve(cli.nsec.as_deref(), store.as_ref())? {
            Some(SigningMode::Local(keys)) => run_local(&keys, command, pool.as_ref()).await?,
            Some(mode @ SigningMode::Remote(_)) => {
                tracing::debug!("signing mode: {}", mode.description());
                remote
                    .restore(policy)
                    .await
                    .context("Failed to reconnect to the stored bunker")?;
                let outcome = run_remote(&remote, command, pool.as_ref()).await;
                remote.disconnect().await;
                outcome?;
            }
            None => bail!(
                "No signer configured. Run `bunker-cli connect <bunker-uri>` or pass --nsec"
            ),
        },
    }

    Ok(())
}
