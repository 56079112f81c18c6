/// Lost & Found realtime runner - follows one viewer's notifications and
/// conversations and prints store changes
use colored::*;
use lostfound_realtime::transport::{ConnectionState, WsConnector};
use lostfound_realtime::{Config, HttpRestClient, Session, StoreEvent};
use std::env;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    info!("Starting realtime session");
    info!("   API:  {}", config.api_base_url);
    info!("   Push: {}", config.push_url);

    let rest = Arc::new(HttpRestClient::new(config.api_base_url.clone(), config.request_timeout));
    let connector = Arc::new(WsConnector::new(config.push_url.clone()));
    let session = Session::start(config, rest, connector)
        .await
        .map_err(|e| anyhow::anyhow!("Session error: {}", e))?;

    let mut events = session.events();
    print_summary(&session);

    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&session, &event),
                Err(RecvError::Lagged(n)) => warn!("Skipped {} store events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.teardown().await;
    println!("{}", "✓ Session closed".green().bold());
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Ctrl+C handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Ctrl+C received");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("SIGTERM received");
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn print_summary(session: &Session) {
    let notifications = session.notifications();
    let conversations = session.conversations();
    println!(
        "{} {} notifications, {} unread",
        "🔔".cyan().bold(),
        notifications.notifications().len(),
        notifications.unread_count().to_string().yellow()
    );
    println!(
        "{} {} conversations, {} unread messages",
        "💬".cyan().bold(),
        conversations.conversations().len(),
        conversations.total_unread().to_string().yellow()
    );
    for error in [notifications.last_error(), conversations.last_error()].into_iter().flatten() {
        println!("{} {}", "✗".red().bold(), error.red());
    }
}

fn print_event(session: &Session, event: &StoreEvent) {
    match event {
        StoreEvent::NotificationsChanged { unread } => {
            let newest = session.notifications().notifications().into_iter().next();
            match newest {
                Some(n) => println!(
                    "{} {} unread | latest: {}{}",
                    "🔔".cyan().bold(),
                    unread.to_string().yellow(),
                    n.message,
                    if n.read { "" } else { " (new)" }
                ),
                None => println!("{} {} unread", "🔔".cyan().bold(), unread.to_string().yellow()),
            }
        }
        StoreEvent::ConversationsChanged => {
            let role = session.config().role;
            let active = session.conversations().active_conversation();
            for c in session.conversations().conversations().iter().take(5) {
                let marker = if Some(&c.id) == active.as_ref() { "▶" } else { " " };
                println!(
                    "  {} {} [{}] {}",
                    marker.green(),
                    c.counterpart_name(role).bold(),
                    c.unread_count.to_string().yellow(),
                    c.last_message.as_deref().unwrap_or("").dimmed()
                );
            }
        }
        StoreEvent::MessagesChanged { conversation_id } => {
            if let Some(last) = session.conversations().messages().last() {
                println!(
                    "{} #{} {}: {} ({:?})",
                    "💬".cyan().bold(),
                    conversation_id,
                    last.sender_role,
                    last.content,
                    last.delivery
                );
            }
        }
        StoreEvent::ConnectionChanged { state } => {
            let label = match state {
                ConnectionState::Connected => "connected".green(),
                ConnectionState::Connecting => "connecting".yellow(),
                ConnectionState::Disconnected => "disconnected".yellow(),
                ConnectionState::Unavailable => "unavailable, polling only".red(),
            };
            println!("{} push {}", "⚡".cyan().bold(), label);
        }
        StoreEvent::Navigate { target } => {
            println!("{} navigate to {}", "→".cyan(), target.section);
        }
    }
}
