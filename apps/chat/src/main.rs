mod prompt;
mod render;
mod settings;

use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use message_sync::{
    remote,
    repository::ChatRepository,
    seed::{seed_demo, DemoSeed},
    Backend, ChatListSync, Credentials, MemoryBackend, MessageSync, SendOutcome,
};
use prompt::Command;
use settings::load_settings;
use shared::domain::ConversationId;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::LinesStream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const DEMO_EMAIL: &str = "alice@example.com";
const DEMO_PASSWORD: &str = "alice-demo";

#[derive(Parser, Debug)]
#[command(about = "Terminal client for the realtime chat")]
struct Args {
    /// Settings file; `./chat.toml` is used when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    backend_url: Option<String>,
    #[arg(long)]
    anon_key: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    username: Option<String>,
    /// Register the account instead of signing in.
    #[arg(long)]
    sign_up: bool,
    /// Conversation to open; defaults to the most recently active one.
    #[arg(long)]
    chat: Option<Uuid>,
    /// Run against an in-process backend seeded with a demo chat.
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(url) = &args.backend_url {
        settings.backend_url = url.clone();
    }
    if let Some(key) = &args.anon_key {
        settings.anon_key = key.clone();
    }

    let (backend, credentials) = if args.demo {
        demo_backend().await?
    } else {
        (remote::connect(settings.remote()?), credentials_from(&args)?)
    };
    let sync = MessageSync::new(backend, settings.sync());
    let sessions = sync.sessions();
    let session = if args.sign_up && !args.demo {
        sessions.sign_up(&credentials).await
    } else {
        sessions.sign_in(&credentials).await
    }
    .context("authentication failed")?;
    info!(user_id = %session.user_id, "chat: signed in");

    let chats = Arc::clone(sync.chat_list());
    chats
        .start()
        .await
        .context("failed to load conversations")?;
    render::print_chat_list(&chats.summaries());

    let printer = tokio::spawn(render::follow(Arc::clone(&sync)));
    let target = args
        .chat
        .map(ConversationId)
        .or_else(|| chats.summaries().first().map(|chat| chat.id));
    if let Some(conversation_id) = target {
        open(&sync, &chats, conversation_id).await;
    }

    let result = run_prompt(&sync, &chats).await;

    printer.abort();
    sync.deactivate().await;
    chats.stop().await;
    if let Err(err) = sessions.sign_out().await {
        warn!("chat: sign out failed: {err}");
    }
    result
}

fn credentials_from(args: &Args) -> Result<Credentials> {
    match (&args.email, &args.password) {
        (Some(email), Some(password)) => Ok(Credentials {
            email: email.clone(),
            password: password.clone(),
            username: args.username.clone(),
        }),
        _ => bail!("--email and --password are required unless --demo is set"),
    }
}

/// In-process backend holding the demo chat, with an account for alice.
async fn demo_backend() -> Result<(Backend, Credentials)> {
    let memory = MemoryBackend::new();
    let alice = memory
        .register_account(DEMO_EMAIL, DEMO_PASSWORD, Some("alice"))
        .await;
    let backend = memory.backend();
    let seed = DemoSeed {
        alice,
        ..DemoSeed::default()
    };
    seed_demo(&ChatRepository::new(Arc::clone(&backend.store)), &seed, Utc::now())
        .await
        .context("failed to seed the demo chat")?;
    Ok((
        backend,
        Credentials {
            email: DEMO_EMAIL.to_string(),
            password: DEMO_PASSWORD.to_string(),
            username: None,
        },
    ))
}

async fn open(sync: &Arc<MessageSync>, chats: &ChatListSync, conversation_id: ConversationId) {
    let title = chats
        .summaries()
        .into_iter()
        .find(|chat| chat.id == conversation_id)
        .map(|chat| chat.title)
        .unwrap_or_else(|| conversation_id.to_string());
    println!("== {title} ==");
    if let Err(report) = sync.activate(conversation_id).await {
        println!("! could not open {title}: {}", report.message);
    }
}

async fn send(sync: &Arc<MessageSync>, body: &str) {
    match sync.send(body).await {
        SendOutcome::Sent(_) => {}
        SendOutcome::Rejected(report) => println!("! {}", report.message),
        // Reported by the event follower.
        SendOutcome::Failed { .. } => {}
    }
}

async fn run_prompt(sync: &Arc<MessageSync>, chats: &ChatListSync) -> Result<()> {
    let mut lines = LinesStream::new(BufReader::new(stdin()).lines());
    loop {
        let line = tokio::select! {
            line = lines.next() => line,
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(|err| anyhow!("failed to listen for ctrl-c: {err}"))?;
                None
            }
        };
        let Some(line) = line else {
            return Ok(());
        };
        let line = line.context("failed to read from stdin")?;

        match prompt::parse(&line) {
            Command::Send(body) => send(sync, body).await,
            Command::ListChats => render::print_chat_list(&chats.summaries()),
            Command::Open(position) => match chats.summaries().get(position - 1) {
                Some(chat) => open(sync, chats, chat.id).await,
                None => println!("! no conversation #{position}"),
            },
            Command::Retry => match sync.take_compose_restore().await {
                Some(body) => send(sync, &body).await,
                None => println!("! nothing to retry"),
            },
            Command::Help => println!("{}", prompt::HELP),
            Command::Quit => return Ok(()),
            Command::Unknown(input) => println!("! unknown command {input}; /help lists them"),
        }
    }
}
