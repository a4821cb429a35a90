//! Postbox - command line front end

use anyhow::{bail, Context};
use bytes::Bytes;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use postbox_core::storage::{BlobMeta, BlobStore, SortOrder};
use postbox_core::{
    AuthCache, AuthRequest, Config, DirectoryAuthenticator, Flag, FlagPatch, FsBlobStore, InboundReceipt, ListRequest,
    MailService, MailboxKind, MailparseParser, OutboundEnvelope, SmtpTransmitter, SqliteRecordStore, StaticDirectory,
    StorageManager, UrlSigner,
};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable debug mode
    #[arg(short, long)]
    debug: bool,

    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Verified phone number of the caller (default: POSTBOX_PHONE)
    #[arg(long)]
    phone: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store one copy of a raw RFC 822 message for each To address
    Ingest {
        file: PathBuf,
        #[arg(long)]
        receipt_id: Option<String>,
    },
    /// List the caller's mailbox
    List {
        #[arg(long)]
        mailbox: Option<MailboxKind>,
        #[arg(long)]
        sender: Option<String>,
        #[arg(long)]
        start_date: Option<String>,
        #[arg(long)]
        end_date: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        cursor: Option<String>,
        /// Oldest first
        #[arg(long)]
        ascending: bool,
    },
    /// Show a conversation
    Thread {
        thread_id: Uuid,
        #[arg(long)]
        include_body: bool,
    },
    /// Show one message by its body key
    Detail {
        s3_key: String,
        #[arg(long)]
        include_thread: bool,
    },
    /// Store a file as a pending attachment
    Upload {
        file: PathBuf,
        #[arg(long, default_value = "application/octet-stream")]
        content_type: String,
    },
    /// Send a message from the caller's default mailbox
    Send {
        #[arg(long, required = true)]
        to: Vec<String>,
        #[arg(long)]
        cc: Vec<String>,
        #[arg(long)]
        bcc: Vec<String>,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        body: String,
        /// Pending attachment key from `upload`
        #[arg(long)]
        attach: Vec<String>,
        #[arg(long)]
        in_reply_to: Option<String>,
        #[arg(long)]
        references: Vec<String>,
    },
    /// Set read/archived on a message
    Update {
        timestamp: String,
        #[arg(long)]
        read: Option<bool>,
        #[arg(long)]
        archived: Option<bool>,
    },
    /// Flip read or archived on a message
    Toggle {
        timestamp: String,
        /// `read` or `archived`
        flag: Flag,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn build_service(config: &Config) -> anyhow::Result<MailService> {
    let mut records = SqliteRecordStore::new(config.database_file_path()).await?;
    records.initialize().await?;

    let signer = UrlSigner::new(&config.presign.base_url, config.presign.secret.clone())?;
    let blobs = FsBlobStore::new(config.blob_dir(), signer)?;
    let storage = StorageManager::new(Arc::new(records), Arc::new(blobs));

    let authenticator = DirectoryAuthenticator::new(
        Arc::new(StaticDirectory::new(config.auth.directory.clone())),
        AuthCache::new(config.auth_cache_ttl(), config.auth.cache_capacity),
        config.mail.domain.clone(),
    );
    let transmitter = SmtpTransmitter::from_config(&config.mail.smtp)?;

    Ok(MailService::new(Arc::new(authenticator), &storage, Arc::new(transmitter), config.mail.domain.clone())
        .with_url_ttl(config.url_ttl())
        .with_page_size(config.query.default_page_size))
}

async fn run(args: Args, config: Config) -> anyhow::Result<()> {
    let service = build_service(&config).await?;
    let auth = AuthRequest {
        phone_number: args.phone.clone().or_else(|| std::env::var("POSTBOX_PHONE").ok()),
    };

    match args.command {
        Command::Ingest { file, receipt_id } => {
            let raw = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let receipt = InboundReceipt {
                receipt_id: receipt_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                received_at: Utc::now(),
            };
            let mut events = service.writer().subscribe();
            let ingestor = service.ingestor(Arc::new(MailparseParser::new(config.mail.domain.clone())));
            ingestor.stage(&receipt, Bytes::from(raw)).await?;
            let stored = ingestor.receive(&receipt).await?;
            while let Ok(event) = events.try_recv() {
                info!("New mail for {} from {}: {}", event.recipient, event.sender, event.subject);
            }
            print_json(&stored)
        }
        Command::List {
            mailbox,
            sender,
            start_date,
            end_date,
            limit,
            cursor,
            ascending,
        } => {
            let request = ListRequest {
                sender,
                start_date,
                end_date,
                mailbox,
                limit,
                sort_order: ascending.then_some(SortOrder::Asc),
                cursor,
            };
            print_json(&service.list(&auth, &request).await?)
        }
        Command::Thread { thread_id, include_body } => {
            print_json(&service.get_thread(&auth, thread_id, include_body).await?)
        }
        Command::Detail { s3_key, include_thread } => {
            print_json(&service.detail(&auth, &s3_key, include_thread).await?)
        }
        Command::Upload { file, content_type } => {
            let filename = file
                .file_name()
                .and_then(|name| name.to_str())
                .context("attachment path has no file name")?
                .to_string();
            let content = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let ticket = service.attachment_upload_url(&auth, &filename, &content_type).await?;
            service
                .blobs()
                .put(&ticket.attachment_key, Bytes::from(content), BlobMeta::new(content_type))
                .await?;
            print_json(&ticket)
        }
        Command::Send {
            to,
            cc,
            bcc,
            subject,
            body,
            attach,
            in_reply_to,
            references,
        } => {
            let envelope = OutboundEnvelope {
                to,
                subject,
                body,
                cc,
                bcc,
                reply_to: Vec::new(),
                attachment_keys: attach,
                in_reply_to,
                references,
            };
            print_json(&service.send(&auth, envelope).await?)
        }
        Command::Update {
            timestamp,
            read,
            archived,
        } => {
            if read.is_none() && archived.is_none() {
                bail!("pass --read and/or --archived");
            }
            let outcome = service.update(&auth, &timestamp, FlagPatch { read, archived }).await?;
            if !outcome.is_synced() {
                error!("Flags stored but the message body was not updated");
            }
            print_json(&outcome)
        }
        Command::Toggle { timestamp, flag } => {
            let outcome = service.toggle(&auth, &timestamp, flag).await?;
            if !outcome.is_synced() {
                error!("Flags stored but the message body was not updated");
            }
            print_json(&outcome)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        "debug".to_string()
    } else {
        std::env::var("POSTBOX_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(match log_level.as_str() {
            "debug" => tracing::Level::DEBUG,
            "info" => tracing::Level::INFO,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        })
        .init();

    info!("Starting Postbox v{}", postbox_core::VERSION);

    if let Some(data_dir) = &args.data_dir {
        std::env::set_var("POSTBOX_DATA_DIR", data_dir);
    }

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => Config::default_path()?,
    };
    let config = Config::load_or_default(&config_path)?.with_env();
    config.validate()?;

    if let Err(e) = run(args, config).await {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}
