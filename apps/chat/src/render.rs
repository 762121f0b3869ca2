use std::{collections::HashSet, sync::Arc};

use message_sync::{ChatSummary, LiveStatus, Message, MessageKey, MessageSync, SyncEvent, SyncView};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tracing::{debug, warn};

pub fn chat_list_lines(chats: &[ChatSummary]) -> Vec<String> {
    chats
        .iter()
        .enumerate()
        .map(|(index, chat)| {
            let unread = match chat.unread_count {
                0 => String::new(),
                count => format!(" ({count} unread)"),
            };
            format!("{:>2}. {}{unread}: {}", index + 1, chat.title, chat.preview())
        })
        .collect()
}

pub fn print_chat_list(chats: &[ChatSummary]) {
    if chats.is_empty() {
        println!("No conversations yet.");
    }
    for line in chat_list_lines(chats) {
        println!("{line}");
    }
}

pub fn format_message(message: &Message) -> String {
    let author = message
        .sender
        .as_ref()
        .map_or("...", |profile| profile.display_name.as_str());
    format!(
        "[{}] {author}: {}",
        message.created_at.format("%H:%M"),
        message.body
    )
}

fn describe_live(status: &LiveStatus) -> String {
    match status {
        LiveStatus::Detached => "live updates off".to_string(),
        LiveStatus::Attaching => "connecting...".to_string(),
        LiveStatus::Attached => "live".to_string(),
        LiveStatus::Unavailable(reason) => format!("live updates unavailable: {reason}"),
    }
}

/// Remembers which confirmed messages were already written to the terminal.
#[derive(Default)]
pub struct Transcript {
    printed: HashSet<MessageKey>,
}

impl Transcript {
    pub fn fresh<'a>(&mut self, view: &'a SyncView) -> Vec<&'a Message> {
        view.messages
            .iter()
            .filter(|message| !message.is_pending())
            .filter(|message| self.printed.insert(message.key))
            .collect()
    }
}

/// Prints new messages and status changes until the event channel closes.
pub async fn follow(sync: Arc<MessageSync>) {
    let mut transcript = Transcript::default();
    let mut events = BroadcastStream::new(sync.subscribe_events());

    while let Some(event) = events.next().await {
        match event {
            Ok(SyncEvent::LogChanged { .. }) => {
                for message in transcript.fresh(&sync.snapshot()) {
                    println!("{}", format_message(message));
                }
            }
            Ok(SyncEvent::LiveStatusChanged { status, .. }) => {
                println!("-- {}", describe_live(&status));
            }
            Ok(SyncEvent::SendFailed { error, .. }) => {
                println!("! not sent ({}); /retry puts it back", error.message);
            }
            Ok(SyncEvent::Error(message)) => warn!("chat: {message}"),
            Ok(SyncEvent::SenderProfileUpdated { .. } | SyncEvent::ChatListChanged) => {}
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                debug!(skipped, "chat: event stream lagged, redrawing from snapshot");
                for message in transcript.fresh(&sync.snapshot()) {
                    println!("{}", format_message(message));
                }
            }
        }
    }
}
