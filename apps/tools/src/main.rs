use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use message_sync::{
    remote::{self, RemoteConfig},
    repository::ChatRepository,
    seed::{seed_demo, DemoSeed, DEMO_ALICE, DEMO_BOB, DEMO_CHAT},
};
use shared::domain::{ConversationId, UserId};
use uuid::Uuid;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "http://127.0.0.1:54321")]
    backend_url: String,
    /// Key sent as `apikey` and bearer; a service key bypasses row policies.
    #[arg(long)]
    api_key: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create alice, bob and their chat with a welcome message.
    SeedDemo {
        #[arg(long, default_value_t = DEMO_ALICE.0)]
        alice: Uuid,
        #[arg(long, default_value_t = DEMO_BOB.0)]
        bob: Uuid,
        #[arg(long, default_value_t = DEMO_CHAT.0)]
        chat: Uuid,
    },
    /// Print conversations with their last message, optionally for one member.
    ListChats {
        #[arg(long)]
        user: Option<Uuid>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();
    let backend = remote::connect(RemoteConfig::new(&cli.backend_url, cli.api_key.clone())?);
    let repo = ChatRepository::new(backend.store);

    match cli.command {
        Command::SeedDemo { alice, bob, chat } => {
            let seed = DemoSeed {
                alice: UserId(alice),
                bob: UserId(bob),
                chat: ConversationId(chat),
            };
            let report = seed_demo(&repo, &seed, Utc::now())
                .await
                .context("failed to seed the demo chat")?;
            if report.wrote_welcome {
                println!("seeded chat_id={}", report.chat);
            } else {
                println!("chat_id={} already has messages; left as is", report.chat);
            }
        }
        Command::ListChats { user } => {
            let chats = match user {
                Some(user) => repo.conversations_for(UserId(user)).await,
                None => repo.conversations().await,
            }
            .context("failed to list conversations")?;
            let ids: Vec<ConversationId> = chats.iter().map(|chat| chat.id).collect();
            let latest = repo
                .last_messages(&ids)
                .await
                .context("failed to read last messages")?;

            for chat in chats {
                let members = repo
                    .participants(chat.id)
                    .await
                    .with_context(|| format!("failed to read members of {}", chat.id))?;
                let preview = latest
                    .get(&chat.id)
                    .map(|message| message.content.as_str())
                    .unwrap_or("-");
                println!(
                    "{} {:?} \"{}\" members={} last={}",
                    chat.id,
                    chat.kind,
                    chat.title,
                    members.len(),
                    preview
                );
            }
        }
    }

    Ok(())
}
