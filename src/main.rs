mod ai_sdk;
mod backend;
mod client;
mod config;
mod error;
mod pipeline;
mod protocol;
mod server;
mod stream;

use std::io::Write;
use std::sync::Arc;

use backend::BackendClient;
use clap::{Parser, Subcommand};
use client::{ChatClient, ClientConfig};
use config::{BackendArgs, KnowledgeArgs, ListenArgs};
use pipeline::ChatUseCase;

type MainResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, Parser)]
#[command(name = "ragbridge", version, about = "Retrieval-grounded chat over a completion backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the chat API
    Serve {
        #[command(flatten)]
        listen: ListenArgs,
        #[command(flatten)]
        backend: BackendArgs,
        #[command(flatten)]
        knowledge: KnowledgeArgs,
    },
    /// Ask a running server a question
    Ask {
        message: String,
        #[arg(long, env = "RAGBRIDGE_SERVER", default_value = "http://127.0.0.1:3001")]
        server: String,
        #[arg(long, env = "RAGBRIDGE_TOKEN", hide_env_values = true)]
        token: Option<String>,
        /// Print the answer as it is generated
        #[arg(long)]
        stream: bool,
    },
}

#[tokio::main]
async fn main() -> MainResult {
    dotenvy::dotenv().ok();
    init_logging();

    match Cli::parse().command {
        Command::Serve {
            listen,
            backend,
            knowledge,
        } => serve(listen, backend, knowledge).await,
        Command::Ask {
            message,
            server,
            token,
            stream,
        } => ask(message, server, token, stream).await,
    }
}

async fn serve(listen: ListenArgs, backend: BackendArgs, knowledge: KnowledgeArgs) -> MainResult {
    let backend = backend.into_config();
    let knowledge = knowledge.load()?;
    tracing::info!(
        backend = %backend.base_url,
        model = %backend.model,
        shape = ?backend.shape,
        documents = knowledge.documents().len(),
        "configured completion backend"
    );

    let chat = ChatUseCase::new(Arc::new(BackendClient::new(backend)), Arc::new(knowledge));
    server::run(listen.into_config(), chat).await
}

async fn ask(message: String, server: String, token: Option<String>, stream: bool) -> MainResult {
    let client = ChatClient::new(ClientConfig {
        base_url: server,
        token,
    });

    if !stream {
        println!("{}", client.chat(message).await?);
        return Ok(());
    }

    let mut stdout = std::io::stdout();
    client
        .chat_stream(message, |chunk| {
            write!(stdout, "{}", chunk)?;
            stdout.flush()?;
            Ok(())
        })
        .await?;
    println!();
    Ok(())
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ragbridge=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}
