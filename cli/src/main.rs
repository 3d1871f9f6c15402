use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use helpdesk_chat::config::DEFAULT_API_URL;
use helpdesk_chat::model::AttachmentUpload;
use helpdesk_chat::{
    ChatClient, ChatConfig, ChatError, ConversationApi, Credential, CredentialStore, Message, NewConversation,
    NewMessage, PusherTransportFactory, SessionHandlers,
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error("failed to read {path}: {source}")]
    ReadAttachment { path: PathBuf, source: std::io::Error },
    #[error("signal handler failed: {0}")]
    Signal(std::io::Error),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "helpdesk", about = "Helpdesk conversation and live chat CLI")]
struct Cli {
    #[arg(long, env = "HELPDESK_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Bearer token; omit to act as a guest.
    #[arg(long, env = "HELPDESK_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone)]
struct CliContext {
    api_url: String,
    token: Option<String>,
}

impl CliContext {
    fn credential(&self) -> Option<Credential> {
        self.token.as_deref().map(Credential::bearer)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    Conversations(ConversationsCommand),
    /// Post a message, optionally with attachments.
    Send(SendArgs),
    /// Send a typing (or typing-stopped) notice.
    Typing(TypingArgs),
    /// Stream messages and typing notices until interrupted.
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
struct ConversationsCommand {
    #[command(subcommand)]
    command: ConversationsSubcommand,
}

#[derive(Subcommand, Debug)]
enum ConversationsSubcommand {
    List,
    Show {
        id: Uuid,
    },
    Create {
        #[arg(long)]
        subject: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        contact: Option<String>,
        #[arg(long)]
        body: String,
    },
    Assign {
        id: Uuid,
    },
    Close {
        id: Uuid,
    },
}

#[derive(Args, Debug)]
struct SendArgs {
    id: Uuid,
    #[arg(long)]
    body: String,
    #[arg(long = "attach")]
    attachments: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct TypingArgs {
    id: Uuid,
    #[arg(long)]
    stop: bool,
}

#[derive(Args, Debug)]
struct WatchArgs {
    id: Uuid,
    /// Print the existing history before streaming.
    #[arg(long)]
    history: bool,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = CliContext { api_url: cli.api_url, token: cli.token };

    match cli.command {
        Command::Conversations(conversations) => run_conversations(&ctx, conversations).await,
        Command::Send(args) => run_send(&ctx, args).await,
        Command::Typing(args) => run_typing(&ctx, args).await,
        Command::Watch(args) => run_watch(&ctx, args).await,
    }
}

fn api(ctx: &CliContext, store: &CredentialStore) -> Result<ConversationApi, CliError> {
    Ok(ConversationApi::new(&ctx.api_url, store.reader(), helpdesk_chat::config::HttpTimeouts::default())?)
}

async fn run_conversations(ctx: &CliContext, conversations: ConversationsCommand) -> Result<(), CliError> {
    let store = CredentialStore::new(ctx.credential());
    let api = api(ctx, &store)?;
    let value = match conversations.command {
        ConversationsSubcommand::List => serde_json::to_value(api.list().await?)?,
        ConversationsSubcommand::Show { id } => serde_json::to_value(api.fetch(id).await?)?,
        ConversationsSubcommand::Create { subject, name, contact, body } => {
            serde_json::to_value(api.create(&NewConversation { subject, name, contact, body }).await?)?
        }
        ConversationsSubcommand::Assign { id } => serde_json::to_value(api.assign(id).await?)?,
        ConversationsSubcommand::Close { id } => serde_json::to_value(api.close(id).await?)?,
    };
    print_json(&value)
}

async fn run_send(ctx: &CliContext, args: SendArgs) -> Result<(), CliError> {
    let store = CredentialStore::new(ctx.credential());
    let api = api(ctx, &store)?;

    let mut attachments = Vec::with_capacity(args.attachments.len());
    for path in &args.attachments {
        attachments.push(read_attachment(path)?);
    }
    let sent = api.send_message(args.id, NewMessage { body: args.body, attachments }).await?;
    print_json(&serde_json::to_value(sent)?)
}

async fn run_typing(ctx: &CliContext, args: TypingArgs) -> Result<(), CliError> {
    let store = CredentialStore::new(ctx.credential());
    let api = api(ctx, &store)?;
    if args.stop {
        api.stop_typing(args.id).await?;
    } else {
        api.typing(args.id).await?;
    }
    eprintln!("ok");
    Ok(())
}

async fn run_watch(ctx: &CliContext, args: WatchArgs) -> Result<(), CliError> {
    let mut config = ChatConfig::from_env()?;
    config.api_base_url = ctx.api_url.trim_end_matches('/').to_string();

    let store = CredentialStore::new(ctx.credential());
    let api = ConversationApi::new(&config.api_base_url, store.reader(), config.timeouts)?;
    let factory = PusherTransportFactory::new(config.pusher.clone(), api.http().clone());
    let client = ChatClient::new(store.reader(), Arc::new(factory), config.typing);

    let handlers = SessionHandlers::new()
        .on_message(|message| println!("{}", render_message(message)))
        .on_typing(|signal| eprintln!("... {} is typing", signal.user_name))
        .on_error(|error| eprintln!("transport error: {error}"));
    let guard = client.subscribe(args.id, handlers);

    if args.history {
        let detail = api.fetch(args.id).await?;
        let unseen = client.seed_history(args.id, detail.messages);
        tracing::debug!(conversation_id = %args.id, count = unseen.len(), "seeded history");
        for message in &unseen {
            println!("{}", render_message(message));
        }
    }

    eprintln!("watching conversation {} (ctrl-c to stop)", args.id);
    tokio::signal::ctrl_c().await.map_err(CliError::Signal)?;

    guard.dispose();
    client.shutdown();
    Ok(())
}

fn render_message(message: &Message) -> String {
    let when = message.created_at.map(|t| t.to_string()).unwrap_or_else(|| "-".to_owned());
    let who = if message.is_staff { format!("{} (staff)", message.sender) } else { message.sender.clone() };
    let mut line = format!("[{when}] {who}: {}", message.body);
    for attachment in &message.attachments {
        line.push_str(&format!("\n    attachment: {} <{}>", attachment.filename, attachment.url));
    }
    line
}

fn read_attachment(path: &Path) -> Result<AttachmentUpload, CliError> {
    let bytes = std::fs::read(path).map_err(|source| CliError::ReadAttachment { path: path.to_path_buf(), source })?;
    let filename = path
        .file_name()
        .map_or_else(|| "attachment".to_owned(), |name| name.to_string_lossy().into_owned());
    Ok(AttachmentUpload { filename, mime_type: guess_mime(path).to_owned(), bytes })
}

fn guess_mime(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" | "log" => "text/plain",
        _ => "application/octet-stream",
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guess_mime_by_extension() {
        assert_eq!(guess_mime(Path::new("photo.PNG")), "image/png");
        assert_eq!(guess_mime(Path::new("scan.jpeg")), "image/jpeg");
        assert_eq!(guess_mime(Path::new("notes")), "application/octet-stream");
    }

    #[test]
    fn render_message_marks_staff_and_attachments() {
        let message: Message = serde_json::from_value(serde_json::json!({
            "id": 1,
            "sender": "Sam",
            "is_staff": true,
            "body": "Here is the label",
            "attachments": [{"id": 1, "mime_type": "application/pdf", "url": "https://cdn.test/l.pdf", "filename": "label.pdf"}]
        }))
        .unwrap();

        let rendered = render_message(&message);
        assert!(rendered.starts_with("[-] Sam (staff): Here is the label"));
        assert!(rendered.contains("attachment: label.pdf <https://cdn.test/l.pdf>"));
    }

    #[test]
    fn cli_parses_watch_with_history() {
        let id = Uuid::new_v4();
        let cli = Cli::try_parse_from(["helpdesk", "--api-url", "http://x/api", "watch", &id.to_string(), "--history"]).unwrap();
        assert_eq!(cli.api_url, "http://x/api");
        assert!(matches!(cli.command, Command::Watch(WatchArgs { history: true, .. })));
    }
}
