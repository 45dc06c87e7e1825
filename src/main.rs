#![deny(dead_code)] // DO NOT REMOVE THIS EVER
use anyhow::Result;
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

mod ui;
mod utils;

use crate::ui::{InboxUI, UiAction};
use parley::inbox::{ReconnectPolicy, WebSocketConnector};
use parley::session::{
    load_session, resolve_session, save_session, set_session_path_override, SessionOverrides,
};
use parley::Inbox;

/// Command line arguments for Parley
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Parley: a live terminal inbox for WhatsApp business conversations.",
    long_about = "Parley loads a tenant's conversation list and keeps it up to date from the push channel.\n\n\
    Flags fall back to PARLEY_* environment variables, then to the saved session file.\n\
    Use -h or --help to see all options."
)]
struct Args {
    /// Tenant whose inbox to open
    #[arg(long, env = "PARLEY_TENANT_ID")]
    tenant: Option<String>,

    /// Base URL of the conversations REST API
    #[arg(long, value_name = "URL", env = "PARLEY_API_URL")]
    api_url: Option<String>,

    /// Base URL of the push channel; the tenant id is appended as a path segment
    #[arg(long, value_name = "URL", env = "PARLEY_PUSH_URL")]
    push_url: Option<String>,

    /// Bearer token for the REST API
    #[arg(long, env = "PARLEY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Session file to read and write instead of the per-user one
    #[arg(long, value_name = "PATH")]
    session_file: Option<PathBuf>,

    /// Persist the resolved session for the next run
    #[arg(long)]
    save_session: bool,

    /// Use capped exponential backoff instead of a fixed 3s reconnect delay
    #[arg(long)]
    reconnect_backoff: bool,

    #[arg(long, value_name = "PATH", default_value = "parley.log")]
    log_file: PathBuf,

    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: LevelFilter,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments FIRST
    let args = Args::parse();

    utils::setup_logging(args.log_file.to_str(), args.log_level)?;
    info!("Parley inbox starting up");
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);
    info!("Logging to file: {}", args.log_file.display());

    if let Some(path) = &args.session_file {
        set_session_path_override(path.clone());
        info!("Session file overridden to: {}", path.display());
    }

    let stored = match load_session() {
        Ok(stored) => stored,
        Err(e) => {
            warn!("Ignoring unreadable session file: {}", e);
            None
        }
    };

    let overrides = SessionOverrides {
        tenant_id: args.tenant.clone(),
        api_url: args.api_url.clone(),
        push_url: args.push_url.clone(),
        token: args.token.clone(),
    };
    let session = match resolve_session(overrides, stored) {
        Ok(session) => session,
        Err(e) => {
            error!("{}", e);
            eprintln!("{}", e);
            return Err(e.into());
        }
    };

    if args.save_session {
        if let Err(e) = save_session(&session) {
            eprintln!("Warning: Failed to save session: {}", e);
        }
    }

    let mut config = session.to_inbox_config();
    if args.reconnect_backoff {
        config.connection.reconnect = ReconnectPolicy::exponential();
    }
    println!("Opening inbox for tenant {}... please wait...\n", config.tenant_id);

    let source = Arc::new(config.conversation_source());
    let inbox = Inbox::start(config, source, Arc::new(WebSocketConnector::new()))?;

    // Setup terminal UI
    let mut terminal = ui::setup_terminal()?;
    let result = run_main_loop(&mut terminal, &inbox).await;

    // Restore terminal before anything else can print
    ui::restore_terminal(terminal)?;
    inbox.stop().await;

    if let Err(e) = &result {
        error!("Main loop ended with error: {}", e);
    }
    println!("Inbox session ended.");
    result
}

/// Run the main event loop
async fn run_main_loop(
    terminal: &mut ui::Terminal<ui::CrosstermBackend<io::Stdout>>,
    inbox: &Inbox,
) -> Result<()> {
    let mut snapshots = inbox.subscribe();
    let mut inbox_ui = InboxUI::new(snapshots.borrow_and_update().clone());

    loop {
        if snapshots.has_changed().unwrap_or(false) {
            inbox_ui.update(snapshots.borrow_and_update().clone());
        }

        terminal.draw(|f| inbox_ui.draw(f))?;

        match inbox_ui.handle_input()? {
            Some(UiAction::Quit) => break,
            Some(UiAction::Select(phone)) => {
                let listed = inbox.select_conversation(&phone).await?;
                info!("Opened conversation {} (listed: {})", phone, listed);
            }
            Some(UiAction::RetryLoad) => {
                if !inbox.retry_load().await? {
                    warn!("Retry requested but the load had not failed");
                }
            }
            None => {}
        }
    }

    Ok(())
}
