use clap::Parser;
use log::info;
use server::config::ServerConfig;
use server::directory::{InMemoryCharacterStore, OpenDirectory, TokenDirectory, UserDirectory};
use server::network::Server;
use shared::CharacterSnapshot;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "7878")]
    port: u16,

    /// Seconds a dropped participant may take to resume
    #[arg(long, default_value = "30")]
    resume_window: u64,

    /// Seconds without any connected participant before a session is evicted
    #[arg(long, default_value = "300")]
    idle_timeout: u64,

    /// Fixed dice seed (for reproducible sessions)
    #[arg(long)]
    seed: Option<u64>,

    /// Broadcast every update immediately instead of debouncing
    #[arg(long)]
    no_debounce: bool,

    /// Character available to sessions, as id:owner:name (repeatable)
    #[arg(short, long = "character", value_parser = parse_character)]
    characters: Vec<CharacterSnapshot>,

    /// Require this token for a user, as user:token (repeatable). Without any,
    /// every user id is trusted.
    #[arg(short, long = "token", value_parser = parse_token)]
    tokens: Vec<(String, String)>,
}

fn parse_character(s: &str) -> Result<CharacterSnapshot, String> {
    let mut parts = s.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(id), Some(owner), Some(name)) if !id.is_empty() && !owner.is_empty() => {
            Ok(CharacterSnapshot::new(id, owner, name, "{}"))
        }
        _ => Err(format!("expected id:owner:name, got '{}'", s)),
    }
}

fn parse_token(s: &str) -> Result<(String, String), String> {
    match s.split_once(':') {
        Some((user, token)) if !user.is_empty() => Ok((user.to_string(), token.to_string())),
        _ => Err(format!("expected user:token, got '{}'", s)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        resume_window: Duration::from_secs(args.resume_window),
        idle_timeout: Duration::from_secs(args.idle_timeout),
        dice_seed: args.seed,
        ..ServerConfig::default()
    };
    if args.no_debounce {
        config = config.immediate();
    }

    let users: Arc<dyn UserDirectory> = if args.tokens.is_empty() {
        Arc::new(OpenDirectory)
    } else {
        let directory = args
            .tokens
            .into_iter()
            .fold(TokenDirectory::new(), |directory, (user, token)| {
                directory.with_user(user, token)
            });
        Arc::new(directory)
    };

    let characters = InMemoryCharacterStore::new(args.characters);
    info!("{} characters available", characters.len());

    let server = Server::bind(config, users, Arc::new(characters)).await?;
    let registry = server.registry();

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            registry.shutdown("the hub is shutting down").await;
        }
    }

    Ok(())
}
