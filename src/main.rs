//! archivist CLI entry point

use archivist::{
    config::Config,
    error::{Error, Result},
    indexer::HttpIndexer,
    ledger::JobLedger,
    scheduler::SyncScheduler,
    store::{DocumentStore, NewDocument},
    tags::TagIndex,
    worker::WorkerPool,
};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "archivist")]
#[command(version, about = "Knowledge-document store with async sync to an indexing backend", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize archivist configuration and database
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Manage documents
    Doc {
        #[command(subcommand)]
        action: DocAction,
    },

    /// Manage tags
    Tag {
        #[command(subcommand)]
        action: TagAction,
    },

    /// Show sync status for a document
    Status {
        /// Document ID
        document_id: String,
    },

    /// List documents whose sync is exhausted
    Failed {
        /// Knowledge base ID
        knowledge_base_id: String,
    },

    /// Run the sync worker pool
    Sync {
        /// Process queued jobs until the ledger is empty, then exit
        #[arg(long)]
        drain: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum DocAction {
    /// Add a document from a file
    Add {
        /// Knowledge base ID
        knowledge_base_id: String,

        /// Path to the content file
        file: PathBuf,

        /// Identity to record as creator
        #[arg(long)]
        created_by: Option<String>,
    },

    /// Replace a document's content from a file
    Update {
        /// Document ID
        document_id: String,

        /// Path to the new content file
        file: PathBuf,

        /// Identity to record as editor
        #[arg(long)]
        updated_by: Option<String>,
    },

    /// Soft-delete a document and schedule its external removal
    Rm {
        /// Document ID
        document_id: String,
    },

    /// Archive a document (keeps it indexed)
    Archive {
        /// Document ID
        document_id: String,
    },

    /// Restore an archived document to active
    Restore {
        /// Document ID
        document_id: String,
    },

    /// Show a document
    Show {
        /// Document ID
        document_id: String,

        /// Count this as a read
        #[arg(long)]
        mark_read: bool,
    },

    /// List documents in a knowledge base
    List {
        /// Knowledge base ID
        knowledge_base_id: String,
    },
}

#[derive(Subcommand)]
enum TagAction {
    /// Create a tag in a knowledge base
    Create {
        /// Knowledge base ID
        knowledge_base_id: String,
        /// Tag name
        name: String,
    },

    /// Delete a tag and all its document links
    Rm {
        /// Tag ID
        tag_id: String,
    },

    /// Attach a tag to a document (by tag name)
    Attach {
        /// Document ID
        document_id: String,
        /// Tag name within the document's knowledge base
        name: String,
    },

    /// Detach a tag from a document (by tag name)
    Detach {
        /// Document ID
        document_id: String,
        /// Tag name within the document's knowledge base
        name: String,
    },

    /// List tags in a knowledge base, or of one document
    List {
        /// Knowledge base ID
        knowledge_base_id: String,

        /// Only tags attached to this document
        #[arg(long)]
        document: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Handle init command specially (doesn't need existing config)
    if let Commands::Init { force } = cli.command {
        return handle_init(cli.config, force).await;
    }

    // Handle completions command (doesn't need config/db)
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "archivist", &mut std::io::stdout());
        return Ok(());
    }

    // Load configuration
    let config = match cli.config.as_deref() {
        Some(path) => Config::load(path)?,
        None => Config::load_from(None)?,
    };

    // Initialize components
    let store = DocumentStore::connect(&config).await?;
    if !store.is_initialized().await? {
        return Err(Error::NotInitialized);
    }
    let ledger = JobLedger::new(store.pool().clone());
    let tags = TagIndex::new(store.pool().clone());
    let scheduler = SyncScheduler::new(store.clone(), ledger.clone());

    match cli.command {
        Commands::Init { .. } | Commands::Completions { .. } => unreachable!(),

        Commands::Doc { action } => {
            handle_doc(&store, &scheduler, action, cli.json).await?;
        }

        Commands::Tag { action } => {
            handle_tag(&store, &tags, action, cli.json).await?;
        }

        Commands::Status { document_id } => {
            let doc = store
                .get_document(&document_id)
                .await?
                .ok_or_else(|| Error::DocumentNotFound(document_id.clone()))?;
            let job_state = ledger.sync_status(&document_id).await?;

            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "document_id": doc.id,
                        "version": doc.version,
                        "status": doc.status,
                        "sync_status": doc.sync_status,
                        "external_document_id": doc.external_document_id,
                        "job_state": job_state.map(|s| s.to_string()),
                    }))?
                );
            } else {
                println!("Document {} (version {})", doc.id, doc.version);
                println!("  status:      {}", doc.status);
                println!("  sync status: {}", doc.sync_status);
                match job_state {
                    Some(state) => println!("  latest job:  {}", state),
                    None => println!("  latest job:  none"),
                }
                if let Some(external_id) = &doc.external_document_id {
                    println!("  external id: {}", external_id);
                }
            }
        }

        Commands::Failed { knowledge_base_id } => {
            let failed = ledger.list_failed(&knowledge_base_id).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&failed)?);
            } else if failed.is_empty() {
                println!("No exhausted sync jobs in {}", knowledge_base_id);
            } else {
                for entry in &failed {
                    println!(
                        "{}  {}  {} attempt(s)  {}",
                        entry.document_id,
                        entry.file_name,
                        entry.attempt,
                        entry.last_error.as_deref().unwrap_or("-")
                    );
                }
            }
        }

        Commands::Sync { drain } => {
            let indexer = Arc::new(HttpIndexer::from_config(&config)?);
            let pool = WorkerPool::new(
                store.clone(),
                ledger.clone(),
                scheduler.clone(),
                indexer,
                config.sync.clone(),
            );

            if drain {
                pool.drain().await?;
                println!("✓ Sync ledger drained");
            } else {
                let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
                tokio::spawn(async move {
                    let _ = tokio::signal::ctrl_c().await;
                    let _ = shutdown_tx.send(true);
                });
                pool.run(shutdown_rx).await?;
            }
        }
    }

    Ok(())
}

async fn handle_init(config_path: Option<PathBuf>, force: bool) -> Result<()> {
    let base_dir = match &config_path {
        Some(path) => path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(Config::default_base_dir),
        None => Config::default_base_dir(),
    };

    let mut config = Config::default();
    config.init_paths(Some(base_dir));

    if config.paths.config_file.exists() && !force {
        return Err(Error::AlreadyInitialized(
            config.paths.config_file.display().to_string(),
        ));
    }

    config.save()?;

    let store = DocumentStore::connect(&config).await?;
    store.init_schema().await?;

    println!("✓ archivist initialized successfully");
    println!("  Config: {}", config.paths.config_file.display());
    println!("\nNext steps:");
    println!("  1. Point indexer.url at your indexing backend");
    println!("  2. Add documents: archivist doc add <kb-id> <file>");
    println!("  3. Run the workers: archivist sync");

    Ok(())
}

async fn handle_doc(
    store: &DocumentStore,
    scheduler: &SyncScheduler,
    action: DocAction,
    json: bool,
) -> Result<()> {
    match action {
        DocAction::Add {
            knowledge_base_id,
            file,
            created_by,
        } => {
            let content = std::fs::read_to_string(&file)?;
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "document".to_string());
            let mime_type = mime_guess::from_path(&file)
                .first()
                .map(|m| m.to_string());

            let doc = store
                .create_document(NewDocument {
                    knowledge_base_id,
                    file_name,
                    file_path: file.display().to_string(),
                    mime_type,
                    content,
                    created_by,
                })
                .await?;
            scheduler.on_document_changed(&doc.id).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                println!("✓ Added document {} (sync queued)", doc.id);
            }
        }

        DocAction::Update {
            document_id,
            file,
            updated_by,
        } => {
            let content = std::fs::read_to_string(&file)?;
            let update = store
                .upsert_content(&document_id, &content, updated_by.as_deref())
                .await?;

            if update.hash_changed {
                scheduler.on_document_changed(&document_id).await?;
                println!(
                    "✓ Document {} now at version {} (sync queued)",
                    document_id, update.version
                );
            } else {
                println!("Content unchanged, nothing to sync");
            }
        }

        DocAction::Rm { document_id } => {
            store.mark_deleted(&document_id, None).await?;
            scheduler.on_document_changed(&document_id).await?;
            println!("✓ Document {} deleted (external removal queued)", document_id);
        }

        DocAction::Archive { document_id } => {
            store.archive(&document_id, None).await?;
            println!("✓ Document {} archived", document_id);
        }

        DocAction::Restore { document_id } => {
            store.restore(&document_id, None).await?;
            println!("✓ Document {} restored", document_id);
        }

        DocAction::Show {
            document_id,
            mark_read,
        } => {
            let doc = store
                .get_document(&document_id)
                .await?
                .ok_or_else(|| Error::DocumentNotFound(document_id.clone()))?;
            if mark_read {
                store.increment_read_count(&document_id).await?;
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                println!("{} ({}, version {})", doc.file_name, doc.id, doc.version);
                println!("  {}", doc.content);
            }
        }

        DocAction::List { knowledge_base_id } => {
            let docs = store.list_documents(&knowledge_base_id).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&docs)?);
            } else {
                for doc in &docs {
                    println!(
                        "{}  v{}  {}  {}  {}",
                        doc.id, doc.version, doc.status, doc.sync_status, doc.file_name
                    );
                }
            }
        }
    }

    Ok(())
}

async fn handle_tag(
    store: &DocumentStore,
    tags: &TagIndex,
    action: TagAction,
    json: bool,
) -> Result<()> {
    match action {
        TagAction::Create {
            knowledge_base_id,
            name,
        } => {
            let tag = tags.create_tag(&knowledge_base_id, &name).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tag)?);
            } else {
                println!("✓ Created tag {} ({})", tag.name, tag.id);
            }
        }

        TagAction::Rm { tag_id } => {
            tags.delete_tag(&tag_id).await?;
            println!("✓ Tag {} removed", tag_id);
        }

        TagAction::Attach { document_id, name } => {
            let tag = resolve_tag(store, tags, &document_id, &name).await?;
            tags.attach(&document_id, &tag.id).await?;
            println!("✓ Tagged document {} with {}", document_id, tag.name);
        }

        TagAction::Detach { document_id, name } => {
            let tag = resolve_tag(store, tags, &document_id, &name).await?;
            tags.detach(&document_id, &tag.id).await?;
            println!("✓ Untagged {} from document {}", tag.name, document_id);
        }

        TagAction::List {
            knowledge_base_id,
            document,
        } => {
            let listed = match document {
                Some(document_id) => tags.tags_of(&document_id).await?,
                None => tags.list_tags(&knowledge_base_id).await?,
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&listed)?);
            } else {
                for tag in &listed {
                    println!("{}  {}", tag.id, tag.name);
                }
            }
        }
    }

    Ok(())
}

async fn resolve_tag(
    store: &DocumentStore,
    tags: &TagIndex,
    document_id: &str,
    name: &str,
) -> Result<archivist::tags::Tag> {
    let doc = store
        .get_document(document_id)
        .await?
        .ok_or_else(|| Error::DocumentNotFound(document_id.to_string()))?;
    tags.get_tag_by_name(&doc.knowledge_base_id, name)
        .await?
        .ok_or_else(|| Error::TagNotFound(name.to_string()))
}
