//! Command implementations printing to stdout

use anyhow::{Context, Result};
use chrono::Local;

use daremex_chat::api;
use daremex_chat::chat::{
    ChatSession, ConversationCache, ConversationListProjector, EventOutcome, LoadOutcome,
    MessageStateEngine,
};
use daremex_chat::config::Config;
use daremex_chat::models::{ConversationKey, ConversationSummary, DeliveryState, Message, MessageKind};

/// Store the backend coordinates, keeping any existing session.
pub fn configure(url: &str, anon_key: &str) -> Result<()> {
    let mut config = Config::load()?;
    config.project_url = Some(url.trim_end_matches('/').to_string());
    config.anon_key = Some(anon_key.to_string());
    config.save()?;
    println!("Configuration saved.");
    Ok(())
}

fn format_time(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

/// One-line rendering of a payload; binary kinds show their URL.
fn preview(kind: MessageKind, content: &str) -> String {
    match kind {
        MessageKind::Text => content.trim().to_string(),
        other => format!("[{}] {}", other.as_str(), content),
    }
}

fn print_summary(summary: &ConversationSummary) {
    let badge = if summary.unread_count > 0 {
        format!(" ({} unread)", summary.unread_count)
    } else {
        String::new()
    };
    println!("{}{}", summary.profile.username, badge);
    println!("  ID: {}", summary.counterpart_id);
    if let Some(ref last) = summary.last_message {
        println!("  Last: {}", format_time(&last.created_at));
        println!("  {}", preview(last.kind, &last.content));
    }
    println!();
}

fn print_message(msg: &Message, local_user: &str) {
    let who = if msg.sender_id == local_user {
        "me"
    } else {
        msg.sender_profile.username.as_str()
    };
    let marker = match msg.delivery_state {
        DeliveryState::Pending => " …",
        DeliveryState::Failed => " [failed]",
        DeliveryState::Read if msg.sender_id == local_user => " ✓✓",
        _ => "",
    };
    println!(
        "[{}] {}: {}{}",
        format_time(&msg.created_at),
        who,
        preview(msg.kind, &msg.content),
        marker
    );
}

/// Load the configured chat settings and the signed-in user.
fn session_context() -> Result<(Config, String)> {
    let config = Config::load()?;
    let user_id = config.user_id()?;
    Ok((config, user_id))
}

/// Refresh and print the conversation list.
pub async fn inbox() -> Result<()> {
    let (config, user_id) = session_context()?;
    let gateway = api::connect().await?;
    let projector = ConversationListProjector::new(gateway, config.chat.refresh_debounce());
    let summaries = projector
        .refresh(&user_id)
        .await
        .context("Failed to fetch conversations")?;

    println!("\nConversations:");
    println!("{:-<60}", "");

    if summaries.is_empty() {
        println!("  (no conversations yet)");
        return Ok(());
    }
    for summary in &summaries {
        print_summary(summary);
    }
    println!("{} unread in total", projector.total_unread());
    Ok(())
}

/// Load up to `pages` history pages and print them oldest first.
pub async fn read(counterpart: &str, pages: usize) -> Result<()> {
    let (config, user_id) = session_context()?;
    let gateway = api::connect().await?;
    let engine = MessageStateEngine::new(
        gateway,
        ConversationCache::new(config.chat.cache_freshness()),
    )
    .with_page_size(config.chat.page_size);

    for page in 0..pages.max(1) {
        match engine.load_history(&user_id, counterpart, page == 0).await? {
            LoadOutcome::Loaded { has_more: false, .. } => break,
            LoadOutcome::Loaded { .. } => {}
            other => tracing::debug!("History load returned {:?}", other),
        }
    }

    let key = ConversationKey::between(&user_id, counterpart);
    let messages = engine.messages(&key);

    println!("\nConversation with {}:", counterpart);
    println!("{:-<60}", "");
    if messages.is_empty() {
        println!("  (no messages)");
        return Ok(());
    }
    for msg in &messages {
        print_message(msg, &user_id);
    }
    if engine.has_more_data(&key) {
        println!("\n(older messages available: use --pages)");
    }
    Ok(())
}

pub async fn send(counterpart: &str, kind: MessageKind, content: &str) -> Result<()> {
    let (config, user_id) = session_context()?;
    let gateway = api::connect().await?;
    let engine = MessageStateEngine::new(gateway, ConversationCache::default())
        .with_page_size(config.chat.page_size);

    let sent = engine
        .send(&user_id, counterpart, content, kind)
        .await
        .context("Failed to send message")?;
    println!("Message sent (id: {})", sent.id);
    Ok(())
}

pub async fn mark_read(counterpart: &str) -> Result<()> {
    let (_, user_id) = session_context()?;
    let gateway = api::connect().await?;
    let engine = MessageStateEngine::new(gateway, ConversationCache::default());
    engine
        .mark_read(&user_id, counterpart)
        .await
        .context("Failed to mark conversation as read")?;
    println!("Conversation with {} marked as read.", counterpart);
    Ok(())
}

/// Print realtime activity until Ctrl-C, optionally with one conversation open.
pub async fn listen(with: Option<&str>) -> Result<()> {
    let (config, user_id) = session_context()?;
    let gateway = api::connect().await?;
    let mut session = ChatSession::start(gateway, &user_id, &config.chat).await?;

    if let Some(counterpart) = with {
        session
            .engine()
            .load_history(&user_id, counterpart, true)
            .await?;
        let key = ConversationKey::between(&user_id, counterpart);
        for msg in session.engine().messages(&key) {
            print_message(&msg, &user_id);
        }
    }

    println!(
        "Listening for messages ({} unread)... (Ctrl-C to stop)",
        session.projector().total_unread()
    );

    loop {
        tokio::select! {
            event = session.next_event() => {
                let Some((msg, outcome)) = event else {
                    println!("Change feed closed.");
                    break;
                };
                match outcome {
                    EventOutcome::Applied => print_message(&msg, &user_id),
                    EventOutcome::NotOpen if msg.sender_id != user_id => {
                        let unread = session
                            .projector()
                            .unread_count(msg.counterpart_of(&user_id));
                        println!(
                            "New message from {} ({} unread): {}",
                            msg.sender_profile.username,
                            unread,
                            preview(msg.kind, &msg.content)
                        );
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
        }
    }

    session.sign_out();
    Ok(())
}
