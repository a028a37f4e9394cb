use anyhow::Context as _;
use clap::{Parser, Subcommand};
use futures::future::try_join_all;
use serde::Serialize;
use serde_json::Value;
use std::process::ExitCode;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

use ultracontext::adapter::out_adapters::ReqwestTransport;
use ultracontext::domain::{
    CompressOptions, CompressStrategy, CreateContextOptions, GetContextOptions, Metadata,
    MessagePatch, NewMessage, UncompressOptions,
};
use ultracontext::{AsyncContextClient, ClientConfig, ContextPort, UltraContextError};

/// Command line client for the UltraContext context store
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Server URL (overrides configuration)
    #[clap(short, long)]
    server: Option<String>,

    /// API key (overrides configuration)
    #[clap(long)]
    api_key: Option<String>,

    /// Log requests and version tracking to stderr
    #[clap(short, long)]
    verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new context
    Create {
        /// Caller-chosen id (server assigns one otherwise)
        #[clap(long)]
        id: Option<String>,

        /// Metadata as a JSON object
        #[clap(short, long)]
        metadata: Option<String>,
    },

    /// List all contexts
    List,

    /// Fetch one or more contexts
    Get {
        /// Context ids
        #[clap(required = true)]
        ids: Vec<String>,

        /// Read the log as of this version
        #[clap(long)]
        version: Option<u64>,

        /// Read the log as of the version containing this message index
        #[clap(long)]
        at: Option<u64>,

        /// Read the log as of the last version before this RFC 3339 timestamp
        #[clap(long)]
        before: Option<String>,

        /// Include the version history
        #[clap(long)]
        history: bool,
    },

    /// Append messages to a context
    Append {
        id: String,

        /// Role of every appended message
        #[clap(short, long, default_value = "user")]
        role: String,

        /// Message contents, one message each
        #[clap(required = true)]
        contents: Vec<String>,

        /// Version the context is expected to be at
        #[clap(long)]
        if_version: Option<u64>,
    },

    /// Edit one message in place
    Update {
        id: String,

        /// Target message id
        #[clap(long, conflicts_with = "index")]
        message_id: Option<String>,

        /// Target message index
        #[clap(long)]
        index: Option<u64>,

        /// New role
        #[clap(long)]
        role: Option<String>,

        /// New content
        #[clap(short, long)]
        content: Option<String>,

        /// Version the context is expected to be at
        #[clap(long)]
        if_version: Option<u64>,
    },

    /// Delete a context
    Delete {
        id: String,

        /// Version the context is expected to be at
        #[clap(long)]
        if_version: Option<u64>,
    },

    /// Compress a range of messages
    Compress {
        id: String,

        /// First index of the range
        #[clap(long)]
        start: Option<u64>,

        /// End of the range, exclusive
        #[clap(long)]
        end: Option<u64>,

        /// summarize, truncate or archive
        #[clap(long, default_value = "summarize", value_parser = parse_strategy)]
        strategy: CompressStrategy,

        /// Version the context is expected to be at
        #[clap(long)]
        if_version: Option<u64>,
    },

    /// Restore compressed messages in a range
    Uncompress {
        id: String,

        /// First index of the range
        #[clap(long)]
        start: Option<u64>,

        /// End of the range, exclusive
        #[clap(long)]
        end: Option<u64>,

        /// Version the context is expected to be at
        #[clap(long)]
        if_version: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::WARN })
        .with_writer(std::io::stderr)
        .finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install logger: {err}");
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<UltraContextError>() {
                Some(UltraContextError::Conflict(conflict)) => {
                    eprintln!("Error: {err}");
                    match conflict.current_version {
                        Some(version) => eprintln!("Current version: {version}"),
                        None => eprintln!("Current version: unknown"),
                    }
                }
                _ => eprintln!("Error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = ClientConfig::load().context("failed to load configuration")?;
    if let Some(server) = cli.server {
        config.base_url = server;
    }
    if let Some(api_key) = cli.api_key {
        config.api_key = Some(api_key);
    }
    debug!(base_url = %config.base_url, "using server");

    let client = AsyncContextClient::from_config(&config)?;

    match cli.command {
        Command::Create { id, metadata } => {
            let metadata = metadata.as_deref().map(parse_metadata).transpose()?;
            print_json(&client.create(CreateContextOptions { id, metadata }).await?)
        }

        Command::List => print_json(&client.list().await?),

        Command::Get {
            ids,
            version,
            at,
            before,
            history,
        } => {
            let options = GetContextOptions {
                version,
                at,
                before,
                history,
            };
            let responses =
                try_join_all(ids.iter().map(|id| client.get(id, options.clone()))).await?;
            for response in &responses {
                print_json(response)?;
            }
            Ok(())
        }

        Command::Append {
            id,
            role,
            contents,
            if_version,
        } => {
            expect_version(&client, &id, if_version);
            let messages = contents
                .into_iter()
                .map(|content| NewMessage::new(role.clone(), content))
                .collect();
            print_json(&client.append(&id, messages).await?)
        }

        Command::Update {
            id,
            message_id,
            index,
            role,
            content,
            if_version,
        } => {
            let mut patch = match (message_id, index) {
                (Some(message_id), _) => MessagePatch::by_id(message_id),
                (None, Some(index)) => MessagePatch::by_index(index),
                (None, None) => anyhow::bail!("update needs --message-id or --index"),
            };
            if let Some(role) = role {
                patch = patch.role(role);
            }
            if let Some(content) = content {
                patch = patch.content(content);
            }
            expect_version(&client, &id, if_version);
            print_json(&client.update(&id, vec![patch]).await?)
        }

        Command::Delete { id, if_version } => {
            expect_version(&client, &id, if_version);
            print_json(&client.delete(&id).await?)
        }

        Command::Compress {
            id,
            start,
            end,
            strategy,
            if_version,
        } => {
            expect_version(&client, &id, if_version);
            let options = CompressOptions {
                start,
                end,
                strategy,
            };
            print_json(&client.compress(&id, options).await?)
        }

        Command::Uncompress {
            id,
            start,
            end,
            if_version,
        } => {
            expect_version(&client, &id, if_version);
            print_json(&client.uncompress(&id, UncompressOptions { start, end }).await?)
        }
    }
}

/// Each invocation starts with an empty tracker; `--if-version` seeds it
fn expect_version(
    client: &AsyncContextClient<ReqwestTransport>,
    context_id: &str,
    version: Option<u64>,
) {
    if let Some(version) = version {
        client.tracker().observe(context_id, version);
    }
}

fn parse_strategy(raw: &str) -> Result<CompressStrategy, String> {
    CompressStrategy::parse(raw).ok_or_else(|| format!("unknown strategy '{raw}'"))
}

fn parse_metadata(raw: &str) -> anyhow::Result<Metadata> {
    match serde_json::from_str(raw).context("metadata is not valid JSON")? {
        Value::Object(metadata) => Ok(metadata),
        _ => anyhow::bail!("metadata must be a JSON object"),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
