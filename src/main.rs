use chatsync::config::{Credential, SessionConfig};
use chatsync::pager::{PageFetch, PaginationError};
use chatsync::session::{ChatSession, MessageRow};
use chatsync::transport::TokioWebSocketTransportFactory;
use chatsync::types::events::{EventReceivers, ViewportHint};
use chatsync_ureq_http_client::UreqHttpClient;
use chrono::Utc;
use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

// Follows one group conversation in the terminal.
//
// Usage:
//   cargo run -- --group 42 --token <bearer>
//   cargo run -- --api-url https://chat.example/api --ws-url wss://chat.example/ws -g 42
//
// Lines typed on stdin are posted. `/older` loads the previous history page,
// `/quit` closes the session.

#[derive(Parser, Debug)]
#[command(name = "chatsync", about = "Follow and post to a group chat")]
struct Args {
    #[arg(long, env = "CHATSYNC_API_URL", default_value = "http://localhost:8080/api")]
    api_url: String,
    #[arg(long, env = "CHATSYNC_WS_URL", default_value = "ws://localhost:8080/ws")]
    ws_url: String,
    #[arg(long, short)]
    group: i64,
    #[arg(long, env = "CHATSYNC_TOKEN", hide_env_values = true)]
    token: String,
    #[arg(long, default_value_t = 30)]
    page_size: u32,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Utc::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to build tokio runtime: {e}");
            return;
        }
    };

    rt.block_on(run(args));
}

async fn run(args: Args) {
    let config = SessionConfig {
        api_base_url: args.api_url,
        ws_url: args.ws_url.clone(),
        page_size: args.page_size,
        ..Default::default()
    };
    let transport_factory = Arc::new(TokioWebSocketTransportFactory::new(args.ws_url));
    let http_client = Arc::new(UreqHttpClient::new());

    let session = match ChatSession::open(
        args.group,
        Credential::bearer(args.token),
        config,
        transport_factory,
        http_client,
    )
    .await
    {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to open conversation {}: {e}", args.group);
            return;
        }
    };

    for row in session.rows().await {
        println!("{}", render_row(&row));
    }

    let printer = tokio::spawn(print_events(session.clone(), session.events()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted.");
                break;
            }
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read stdin: {e}");
                break;
            }
        };

        match line.trim() {
            "/quit" => break,
            "/older" => match session.load_older().await {
                Ok(PageFetch::Fetched(page)) => {
                    info!("Loaded {} older messages", page.messages.len())
                }
                Ok(PageFetch::Busy) => info!("Already loading."),
                Err(PaginationError::Exhausted) => info!("No older messages."),
                Err(e) => warn!("Could not load older messages: {e}"),
            },
            "" => {}
            text => {
                if let Err(e) = session.send(text).await {
                    warn!("Could not send: {e}");
                }
            }
        }
    }

    session.close().await;
    printer.abort();
}

async fn print_events(session: Arc<ChatSession>, mut events: EventReceivers) {
    loop {
        tokio::select! {
            update = events.timeline.recv() => match update {
                Ok(update) => {
                    let rows = session.rows().await;
                    match update.hint {
                        ViewportHint::KeepOffset { inserted } => {
                            println!("--- {inserted} older message(s) ---");
                            for row in rows.iter().take(inserted) {
                                println!("{}", render_row(row));
                            }
                        }
                        ViewportHint::StickToBottom => {
                            if let Some(row) = rows.last() {
                                println!("{}", render_row(row));
                            }
                        }
                        ViewportHint::Preserve => {}
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!("Skipped {missed} timeline updates"),
                Err(RecvError::Closed) => break,
            },
            state = events.connection_state.recv() => match state {
                Ok(state) => info!("Connection: {state:?}"),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            failure = events.failure.recv() => match failure {
                Ok(failure) => warn!("{failure:?}"),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }
}

fn render_row(row: &MessageRow) -> String {
    let message = &row.entry.message;
    let mut out = String::new();
    if row.flags.show_header {
        out.push_str(&format!("{}:\n", message.sender.nickname));
    }
    out.push_str("  ");
    out.push_str(&message.text);
    if row.entry.is_pending() {
        out.push_str(" (sending)");
    } else if row.unread_count > 0 {
        out.push_str(&format!(" [{}]", row.unread_count));
    }
    if row.flags.show_timestamp {
        out.push_str(&format!("  {}", message.sent_at.format("%H:%M")));
    }
    out
}
