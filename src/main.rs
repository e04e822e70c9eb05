use anyhow::{Context, Result};
use crabdcc::config;
use crabdcc::dcc::{CreateOptions, DccManager, DccType, Dispatcher, IncomingOffer};
use crabdcc::irc::{spawn_connection, IrcEvent};
use crabdcc::logging::{self, TranscriptLogger};
use std::sync::Arc;
use tokio::runtime::Handle;

#[tokio::main]
async fn main() -> Result<()> {
    // Load config
    let cfg = config::load_config()?;

    logging::init_tracing();

    // Ensure download directory exists
    std::fs::create_dir_all(&cfg.dcc.download_dir).with_context(|| {
        format!(
            "Failed to create download directory {}",
            cfg.dcc.download_dir.display()
        )
    })?;

    let mut dispatcher = Dispatcher::new().with_help();
    dispatcher.register_command("syn", |ev| {
        if let Err(e) = ev.session.send_line("ack") {
            tracing::warn!(mask = %ev.mask, error = %e, "could not answer syn");
        }
    })?;
    if let Some(logger) = TranscriptLogger::new(&cfg.logging, &Handle::current()) {
        logger.register(&mut dispatcher)?;
    }

    let mut connection = spawn_connection(&cfg.irc).await?;
    tracing::info!(server = %cfg.irc.server, nick = %cfg.irc.nickname, "connected");

    let manager = DccManager::new(
        cfg.dcc.clone(),
        dispatcher,
        Arc::new(connection.sender.clone()),
        Handle::current(),
    );
    manager.connection_established(connection.local_ip);

    while let Some(event) = connection.events.recv().await {
        match event {
            IrcEvent::Privmsg { mask, text, .. } if text.trim() == "!chat" => {
                if let Err(e) = manager.create(DccType::Chat, &mask, CreateOptions::offer()) {
                    tracing::warn!(%mask, error = %e, "could not offer a chat");
                }
            }
            IrcEvent::Privmsg { .. } => {}
            IrcEvent::Dcc { mask, line } => {
                if let Some(offer) = manager.handle_ctcp(&mask, &line) {
                    accept(&manager, offer);
                }
            }
            IrcEvent::Error(e) => tracing::error!(error = %e, "IRC error"),
            IrcEvent::Disconnected => {
                tracing::info!("disconnected");
                break;
            }
        }
    }

    Ok(())
}

/// Chats are always accepted; files only with `auto_accept`.
fn accept(manager: &DccManager, offer: IncomingOffer) {
    let config = manager.config();
    if offer.kind == DccType::Send && !config.auto_accept {
        tracing::info!(mask = %offer.mask, filename = ?offer.filename, "ignoring file offer");
        return;
    }
    let Some(options) = offer.options_in(&config.download_dir) else {
        tracing::warn!(mask = %offer.mask, filename = ?offer.filename, "no safe download path");
        return;
    };
    if let Err(e) = manager.create(offer.kind, &offer.mask, options) {
        tracing::warn!(mask = %offer.mask, error = %e, "could not accept offer");
    }
}
