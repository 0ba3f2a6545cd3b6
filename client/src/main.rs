use clap::Parser;
use client::connection::{ClientConfig, Connection, JoinTarget};
use client::console::{format_entry, parse_command, ConsoleCommand, HELP};
use client::play::PlayHandle;
use client::view::{Notice, SessionView};
use log::info;
use shared::{Credentials, SessionId};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Hub address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:7878")]
    server: String,

    /// Your user id
    #[arg(short, long)]
    user: String,

    /// Name shown to the table (defaults to the user id)
    #[arg(short, long)]
    name: Option<String>,

    /// Token, when the hub requires one
    #[arg(short, long, default_value = "")]
    token: String,

    /// Create a session for this game and run it as master
    #[arg(long, value_name = "GAME", conflicts_with = "join")]
    create: Option<String>,

    /// Name of the session to create
    #[arg(long, default_value = "Untitled session")]
    title: String,

    /// Join an existing session
    #[arg(short, long, value_name = "SESSION")]
    join: Option<SessionId>,

    /// Character to play when joining
    #[arg(short, long)]
    character: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let target = match (args.create, args.join) {
        (Some(game_id), _) => JoinTarget::Create {
            game_id,
            name: args.title,
        },
        (None, Some(session_id)) => JoinTarget::Join {
            session_id,
            character_id: args.character,
        },
        (None, None) => return Err("pass --create GAME or --join SESSION".into()),
    };

    let credentials = Credentials {
        display_name: args.name.unwrap_or_else(|| args.user.clone()),
        user_id: args.user,
        token: args.token,
    };

    info!("Connecting to: {}", args.server);
    let mut connection = Connection::connect(ClientConfig::new(args.server, credentials), target).await?;
    let play = PlayHandle::new(connection.sender());
    let mut view = SessionView::new();
    let mut printed_seq = 0;

    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let command = match parse_command(&line) {
                    Ok(command) => command,
                    Err(message) => {
                        println!("! {}", message);
                        continue;
                    }
                };
                match command {
                    ConsoleCommand::Roll { formula, label, visibility } => {
                        play.request_dice(&formula.to_string(), label, visibility)?;
                    }
                    ConsoleCommand::Say(text) => {
                        play.chat(text);
                    }
                    ConsoleCommand::Note { note_id, title, text } => {
                        play.update_note(note_id, title, text);
                    }
                    ConsoleCommand::Sketch(edit) => {
                        let mut sketch = view.sketch();
                        edit.apply(&mut sketch);
                        play.update_sketch(sketch);
                    }
                    ConsoleCommand::Play { track, looped } => {
                        play.play_audio(track, looped);
                    }
                    ConsoleCommand::Stop(track) => {
                        play.stop_audio(track);
                    }
                    ConsoleCommand::Viewer { user_id, allowed } => {
                        play.set_character_viewer(user_id, allowed);
                    }
                    ConsoleCommand::End => {
                        play.end_session();
                    }
                    ConsoleCommand::Who => {
                        for user in view.users() {
                            println!(
                                "  {} ({}) {:?}{}{}",
                                user.display_name,
                                user.user_id,
                                user.role,
                                user.character_id
                                    .as_ref()
                                    .map(|c| format!(" playing {}", c))
                                    .unwrap_or_default(),
                                if user.connected { "" } else { " [away]" }
                            );
                        }
                    }
                    ConsoleCommand::Help => println!("{}", HELP),
                    ConsoleCommand::Quit => break,
                }
            }
            event = connection.next_event() => {
                let Some(event) = event else { break };
                let notice = view.handle(event);

                for entry in view.logs().iter().filter(|e| e.seq > printed_seq) {
                    println!("{}", format_entry(entry));
                }
                printed_seq = view.logs().last().map(|e| e.seq).unwrap_or(printed_seq);

                match notice {
                    Some(Notice::Synced) => {
                        if let Some(session) = view.session() {
                            println!(
                                "== {} (session {}, game {}) at #{}",
                                session.name,
                                session.session_id,
                                session.game_id,
                                view.seq()
                            );
                        }
                    }
                    Some(Notice::Rejected { request_id, error }) => match request_id {
                        Some(id) => println!("! request {} rejected: {}", id, error),
                        None => println!("! rejected: {}", error),
                    },
                    Some(Notice::Reconnecting { attempt, delay }) => {
                        println!("~ reconnecting (attempt {}, in {:?})", attempt, delay);
                    }
                    Some(Notice::Audio(command)) => println!("~ audio: {:?}", command),
                    Some(Notice::SessionEnded { .. }) | None => {}
                    Some(Notice::Disconnected(error)) => {
                        println!("! disconnected: {}", error);
                        break;
                    }
                }
            }
        }
    }

    if view.ended().is_none() {
        connection.close().await;
    }
    Ok(())
}
