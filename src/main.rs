use anyhow::{anyhow, Result};
use clap::Parser;
use log::{error, info, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

mod logging;

use nchat_sync::api::HttpApi;
use nchat_sync::channel::WsChannel;
use nchat_sync::config::{self, StoredSession, SyncConfig};
use nchat_sync::events::NoticeLevel;
use nchat_sync::selection::DeletionPrompt;
use nchat_sync::session::{Command, SessionHandle};
use nchat_sync::{
    DeletionPolicy, EngineEvent, Message, MessageBody, MessageId, Session, SyncEngine, SyncError,
    UserId,
};

/// Command line arguments for nchat-sync
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "nchat-sync: line-mode client for the nchat real-time messaging service.",
    long_about = "Connects with NCHAT_BASE_URL, NCHAT_WS_URL, NCHAT_TOKEN and NCHAT_USER_ID, \
    or with a previously stored session.\n\n\
    Type a line to send it. Commands: /peer <id>, /typing, /select <id>, /toggle <id>, \
    /cancel, /delete [soft|hard], /contacts [term], /history, /away, /back, /quit"
)]
struct Args {
    /// Session file to use instead of the default one in the config directory
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Open the conversation with this user on startup
    #[arg(long, value_name = "USER_ID")]
    peer: Option<UserId>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn describe(message: &Message, local_user: UserId) -> String {
    let who = if message.is_own(local_user) {
        "me".to_string()
    } else {
        message.sender_id.to_string()
    };
    let body = match &message.body {
        MessageBody::Text(text) => text.clone(),
        MessageBody::Attachment { url, kind } => format!("[{:?}] {}", kind, url),
    };
    format!(
        "[{}] #{} {}: {} ({:?})",
        message.timestamp.format("%H:%M"),
        message.id,
        who,
        body,
        message.status
    )
}

fn render(event: &EngineEvent, local_user: UserId) {
    match event {
        EngineEvent::MessageAppended(message) => println!("{}", describe(message, local_user)),
        EngineEvent::MessageUpdated(message) => println!("  ~ {}", describe(message, local_user)),
        EngineEvent::MessageRemoved { id, .. } => println!("  - message {} removed", id),
        EngineEvent::HistoryLoaded { conversation_id, count } => {
            println!("-- {} messages with {} (/history to show) --", count, conversation_id)
        }
        EngineEvent::ConversationChanged { current, .. } => println!("== Conversation with {} ==", current),
        EngineEvent::UnreadChanged { conversation_id, count } if *count > 0 => {
            println!("  * {} unread from {}", count, conversation_id)
        }
        EngineEvent::UnreadChanged { .. } => {}
        EngineEvent::SelectionChanged { selected, .. } => println!("  {} selected", selected),
        EngineEvent::PeerTyping { peer_id, is_typing: true } => println!("  {} is typing...", peer_id),
        EngineEvent::PeerTyping { .. } => {}
        EngineEvent::PresenceChanged { user_id, status } => println!("  {} is {}", user_id, status),
        EngineEvent::ContactsChanged { count } => println!("  {} contacts", count),
        EngineEvent::Notice { level, text } => match level {
            NoticeLevel::Error => eprintln!("! {}", text),
            NoticeLevel::Info | NoticeLevel::Success => println!("* {}", text),
        },
        EngineEvent::SessionExpired => eprintln!("! Session expired, please log in again"),
    }
}

/// Handle one line of input. Returns false once the user asked to quit.
async fn handle_line(handle: &SessionHandle, line: &str, local_user: UserId) -> Result<bool> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(true);
    }
    if !line.starts_with('/') {
        handle.send_text(line).await?;
        return Ok(true);
    }

    let mut parts = line.splitn(2, ' ');
    let command = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).unwrap_or_default();
    let parse_id = |arg: &str| -> Result<u64> {
        arg.parse().map_err(|_| anyhow!("Expected a numeric id, got '{}'", arg))
    };

    match command {
        "/quit" => {
            handle.shutdown().await?;
            return Ok(false);
        }
        "/peer" => handle.select_conversation(parse_id(arg)?).await?,
        "/typing" => handle.input().await?,
        "/select" => handle.send(Command::EnterSelection(MessageId::Server(parse_id(arg)?))).await?,
        "/toggle" => handle.send(Command::ToggleSelection(MessageId::Server(parse_id(arg)?))).await?,
        "/cancel" => handle.send(Command::CancelSelection).await?,
        "/away" => handle.set_visibility(false).await?,
        "/back" => handle.set_visibility(true).await?,
        "/history" => {
            let snapshot = handle.snapshot().await?;
            for message in &snapshot.messages {
                println!("{}", describe(message, local_user));
            }
        }
        "/contacts" => {
            for contact in handle.contacts(arg).await? {
                println!("  {:>6} {} <{}> {}", contact.id, contact.username, contact.email, contact.status);
            }
        }
        "/delete" => {
            let prompt = handle.request_deletion().await?;
            let policy = match (arg, &prompt) {
                ("soft", _) => DeletionPolicy::Soft,
                ("hard", _) => DeletionPolicy::Hard,
                (_, DeletionPrompt::Forced { policy, count, note }) => {
                    println!("  Removing {} message(s) from your chat. {}", count, note);
                    *policy
                }
                (_, DeletionPrompt::Choose { count }) => {
                    println!("  Delete {} message(s): /delete soft (for me) or /delete hard (for everyone)", count);
                    return Ok(true);
                }
            };
            if let Err(e) = handle.confirm_deletion(policy).await {
                eprintln!("! {}", e);
            }
        }
        other => eprintln!("! Unknown command {}", other),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    logging::setup_logging(args.log_file.as_deref(), level)?;

    if let Some(path) = &args.config {
        config::set_session_path_override(path.clone());
        info!("Session file overridden to: {}", path.display());
    }
    let session_path = config::get_session_path()?;

    let (config, from_env) = match SyncConfig::from_env()? {
        Some(config) => (config, true),
        None => (SyncConfig::load(Some(&session_path))?, false),
    };
    let local_user = config.user_id;
    info!("Starting session for user {} against {}", local_user, config.base_url);

    let api = Arc::new(HttpApi::new(&config)?);
    let channel = match WsChannel::connect(&config.ws_url, &config.token, config.event_buffer).await {
        Ok(channel) => channel,
        Err(SyncError::Unauthorized) => {
            config::clear_session_at(&session_path)?;
            return Err(anyhow!("Credential rejected, log in again"));
        }
        Err(e) => return Err(e.into()),
    };

    if from_env {
        if let Err(e) = config::save_session_to(&session_path, &StoredSession::new(&config)) {
            error!("Failed to store session: {}", e);
        }
    }

    let mut engine = SyncEngine::from_config(&config);
    engine.events_mut().subscribe_all(move |event| render(event, local_user));

    let (session, handle) = Session::new(engine, api, channel, config.event_buffer);
    let mut task = tokio::spawn(session.with_session_file(session_path).run());

    if let Some(peer) = args.peer {
        handle.select_conversation(peer).await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    handle.shutdown().await?;
                    break;
                };
                match handle_line(&handle, &line, local_user).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("! {}", e),
                }
            }
            result = &mut task => {
                return match result? {
                    Ok(()) => Ok(()),
                    Err(e) => Err(e.into()),
                };
            }
        }
    }

    task.await??;
    info!("Session closed");
    Ok(())
}
