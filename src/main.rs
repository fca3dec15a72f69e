use clap::{CommandFactory, Parser};
use colored::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use justjio_client::cli::{Args, Command};
use justjio_client::{
    token_source_from_config, ChannelKey, ChatEvent, ChatSession, ChatTimeline, Claims, ClientConfig, ClientError,
    ConnectionEvent, ConnectionManager, EventType, Identity, Message, MessageSource, RestClient, Result,
    TokenSource, WsConnector,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "justjio_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("{} {}", "error:".bright_red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    if let Command::Completions { shell } = &args.command {
        clap_complete::generate(*shell, &mut Args::command(), "justjio-client", &mut std::io::stdout());
        return Ok(());
    }

    let config = args.apply_overrides(ClientConfig::load(args.config.as_deref())?);
    let tokens = token_source_from_config(&config)?;

    match &args.command {
        Command::Whoami => whoami(tokens.as_ref(), args.json),
        Command::History { room, page } => history(&config, tokens, room, *page, args.json).await,
        Command::Send { room, text } => {
            let rest = RestClient::new(&config, tokens);
            rest.send_message(room, &text.join(" ")).await?;
            eprintln!("{}", "sent".bright_green());
            Ok(())
        }
        Command::Tail { room, pages } => tail(config, tokens, room, *pages, args.json).await,
        Command::Listen => listen(config, tokens, args.json).await,
        Command::Completions { .. } => Ok(()),
    }
}

fn current_token(tokens: &dyn TokenSource) -> Result<String> {
    tokens.access_token().ok_or(ClientError::MissingToken)
}

fn whoami(tokens: &dyn TokenSource, json: bool) -> Result<()> {
    let claims = Claims::decode(&current_token(tokens)?)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&claims)?);
        return Ok(());
    }
    println!("{}: {}", "User".bright_yellow(), claims.username.bright_white());
    println!("{}: {}", "Id".bright_yellow(), claims.user_id);
    if !claims.user_email.is_empty() {
        println!("{}: {}", "Email".bright_yellow(), claims.user_email);
    }
    if let Some(exp) = claims.exp {
        let expires = chrono::DateTime::from_timestamp(exp, 0)
            .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| exp.to_string());
        if claims.is_expired_at(chrono::Utc::now().timestamp()) {
            println!("{}: {} {}", "Expires".bright_yellow(), expires, "(expired)".bright_red());
        } else {
            println!("{}: {}", "Expires".bright_yellow(), expires);
        }
    }
    Ok(())
}

async fn history(config: &ClientConfig, tokens: Arc<dyn TokenSource>, room: &str, page: u32, json: bool) -> Result<()> {
    let rest = RestClient::new(config, tokens);
    let fetched = rest.fetch_room_messages(room, page).await?;
    let mut timeline = ChatTimeline::new();
    timeline.merge_page(fetched.messages, page);
    print_timeline(&timeline, json)?;
    if !json {
        eprintln!("{}", format!("page {} of {}", fetched.page, fetched.page_count).bright_blue());
    }
    Ok(())
}

/// Connection manager plus supervisor for the user the token belongs to.
async fn start_connection(config: ClientConfig, tokens: Arc<dyn TokenSource>) -> Result<ConnectionManager> {
    let identity = Identity::from_token(&current_token(tokens.as_ref())?)?;
    let connector = Arc::new(WsConnector::new(config.connect_timeout()));
    let manager = ConnectionManager::new(config, connector, tokens);
    manager.spawn_supervisor();
    eprintln!("{} {}", "Connecting as".bright_blue(), identity.to_string().bright_white());
    if let Err(e) = manager.connect(identity).await {
        warn!(error = %e, "initial connect failed, supervisor will retry");
        eprintln!("{} {}", "connect failed, retrying:".bright_red(), e);
    }
    Ok(manager)
}

async fn tail(config: ClientConfig, tokens: Arc<dyn TokenSource>, room: &str, pages: u32, json: bool) -> Result<()> {
    let rest: Arc<dyn MessageSource> = Arc::new(RestClient::new(&config, Arc::clone(&tokens)));
    let manager = start_connection(config, tokens).await?;

    let (session, mut chat_events) = ChatSession::open(manager.registry(), rest, room).await;
    let session = Arc::new(session);
    for _ in 1..pages {
        if !session.fetch_more().await {
            break;
        }
    }
    let (timeline, notices) = session.catch_up(&mut chat_events);
    print_timeline(&timeline, json)?;
    for notice in notices {
        eprintln!("{}", notice.to_string().bright_red());
    }
    let follower = session.follow_reconnects(manager.events());

    let mut conn_events = manager.events();
    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            Some(event) = chat_events.recv() => match event {
                ChatEvent::Live(message) => print_message(&message, json)?,
                ChatEvent::Notice(notice) => eprintln!("{}", notice.to_string().bright_red()),
                ChatEvent::PageLoaded { .. } => {}
            },
            event = conn_events.recv() => {
                if let Some(result) = report_connection_event(event) {
                    break result;
                }
            }
        }
    };

    session.close();
    let _ = follower.await;
    manager.shutdown().await;
    outcome
}

async fn listen(config: ClientConfig, tokens: Arc<dyn TokenSource>, json: bool) -> Result<()> {
    let manager = start_connection(config, tokens).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = manager.subscribe(ChannelKey::global(EventType::CreateMessage), move |data| {
        match Message::from_live(data) {
            Ok(message) => {
                let _ = tx.send(message);
            }
            Err(e) => warn!(error = %e, "ignoring undecodable message frame"),
        }
    });

    let mut conn_events = manager.events();
    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            Some(message) = rx.recv() => {
                if json {
                    print_message(&message, true)?;
                } else {
                    println!(
                        "{} {} {}: {}",
                        message.sent_at.with_timezone(&chrono::Local).format("[%H:%M]").to_string().bright_black(),
                        format!("#{}", message.room_id).bright_magenta(),
                        message.sender_name.bright_cyan(),
                        message.content
                    );
                }
            }
            event = conn_events.recv() => {
                if let Some(result) = report_connection_event(event) {
                    break result;
                }
            }
        }
    };

    manager.shutdown().await;
    outcome
}

/// Print a status line. Returns `Some` when the command should stop.
fn report_connection_event(
    event: std::result::Result<ConnectionEvent, tokio::sync::broadcast::error::RecvError>,
) -> Option<Result<()>> {
    match event {
        Ok(ConnectionEvent::Opened { .. }) => eprintln!("{}", "connected".bright_green()),
        Ok(ConnectionEvent::Reconnected { .. }) => eprintln!("{}", "reconnected".bright_green()),
        Ok(ConnectionEvent::Closed { reason }) => {
            eprintln!("{} {:?}", "connection closed:".bright_yellow(), reason)
        }
        Ok(ConnectionEvent::Lost { attempts }) => {
            return Some(Err(ClientError::ConnectionLost { attempts }));
        }
        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
        Err(tokio::sync::broadcast::error::RecvError::Closed) => return Some(Ok(())),
    }
    None
}

fn print_timeline(timeline: &ChatTimeline, json: bool) -> Result<()> {
    if json {
        for message in timeline.messages() {
            print_message(message, true)?;
        }
        return Ok(());
    }
    for group in timeline.group_by_day() {
        println!("{}", format!("── {} ──", group.label()).bright_blue());
        for message in group.messages {
            print_message(message, false)?;
        }
    }
    Ok(())
}

fn print_message(message: &Message, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(message)?);
    } else {
        println!(
            "{} {}: {}",
            message.sent_at.with_timezone(&chrono::Local).format("[%H:%M]").to_string().bright_black(),
            message.sender_name.bright_cyan(),
            message.content
        );
    }
    Ok(())
}
