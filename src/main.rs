//! # docqa CLI
//!
//! Command-line interface for the document question-answering pipeline.
//!
//! ```bash
//! # Initialize the database
//! docqa init --config ./config/docqa.toml
//!
//! # Ingest a text or markdown file
//! docqa ingest ./handbook.md --name "Employee Handbook"
//!
//! # One-shot question answering
//! docqa ask "how many vacation days do I get?"
//!
//! # Conversational turns with streaming output
//! docqa sessions new --title "benefits questions"
//! docqa chat <session-id> "how many vacation days do I get?"
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use docqa::config::{self, Config};
use docqa::documents::DocumentService;
use docqa::embedding::{create_provider, EmbeddingGateway};
use docqa::error::RagError;
use docqa::llm::{LlmProvider, OpenAiChat};
use docqa::models::SourceType;
use docqa::rag::{QueryOptions, RagPipeline};
use docqa::session::{ChatSessionManager, StreamEvent};
use docqa::snowflake::IdGenerator;
use docqa::store::ChunkStore;
use docqa::vector::create_index;
use docqa::{db, migrate};

/// docqa — question answering over your own documents.
#[derive(Parser)]
#[command(
    name = "docqa",
    about = "Document question answering: ingest, retrieve, answer with sources",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docqa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest a text or markdown file.
    Ingest {
        /// Path to the file to ingest.
        path: PathBuf,

        /// Display name for the document. Defaults to the file name.
        #[arg(long)]
        name: Option<String>,

        /// Source type override (txt, md, csv, ...). Inferred from the
        /// file extension when omitted.
        #[arg(long = "type")]
        source_type: Option<String>,
    },

    /// List ingested documents with their status.
    Documents,

    /// Delete a document, its chunks, and its vectors.
    Delete {
        /// Document id.
        id: i64,
    },

    /// Re-push a document's vectors into the index.
    ///
    /// Repairs the state left behind when chunk rows committed but the
    /// vector write failed.
    Resync {
        /// Document id.
        id: i64,
    },

    /// Retrieve the chunks most similar to a query, without answering.
    Search {
        /// The search query.
        query: String,

        /// Restrict to one document.
        #[arg(long)]
        document: Option<i64>,

        /// Maximum number of chunks to return.
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum similarity, overriding the configured threshold.
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Ask a one-shot question and print the answer with sources.
    Ask {
        /// The question.
        question: String,

        /// Restrict retrieval to one document.
        #[arg(long)]
        document: Option<i64>,

        /// Bypass the query cache for this question.
        #[arg(long)]
        no_cache: bool,
    },

    /// Send one conversational turn, streaming the answer.
    Chat {
        /// Session id (create one with `sessions new`).
        session: i64,

        /// The message.
        message: String,

        /// Restrict retrieval to one document.
        #[arg(long)]
        document: Option<i64>,
    },

    /// Manage chat sessions.
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Inspect or clear the query cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Create a new session.
    New {
        #[arg(long, default_value = "New conversation")]
        title: String,
    },
    /// List active sessions.
    List,
    /// Print a session's recent messages.
    Show {
        id: i64,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Soft-delete a session.
    Delete { id: i64 },
    /// Rename a session.
    Rename { id: i64, title: String },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Print cache statistics.
    Stats,
    /// Drop all cached answers.
    Clear,
}

/// Wired-up pipeline components for one invocation.
struct App {
    documents: DocumentService,
    pipeline: Arc<RagPipeline>,
    sessions: ChatSessionManager,
    store: Arc<ChunkStore>,
    config: Config,
}

async fn build_app(config: Config) -> Result<App> {
    let pool = db::connect(&config).await?;
    migrate::run(&pool).await?;

    let ids = Arc::new(IdGenerator::new(
        config.generator.datacenter_id,
        config.generator.worker_id,
    )?);
    let embeddings = Arc::new(EmbeddingGateway::new(
        create_provider(&config.embedding)?,
        &config.embedding,
    ));
    let index = create_index(&config.vector)?;
    let store = Arc::new(ChunkStore::new(
        pool.clone(),
        index,
        embeddings,
        ids.clone(),
    ));
    let llm: Arc<dyn LlmProvider> = Arc::new(OpenAiChat::new(&config.llm)?);

    let pipeline = Arc::new(RagPipeline::new(
        store.clone(),
        llm,
        config.retrieval.clone(),
        config.ranking.clone(),
        &config.cache,
    ));
    let documents = DocumentService::new(
        pool.clone(),
        store.clone(),
        ids.clone(),
        config.chunking.clone(),
    );
    let sessions = ChatSessionManager::new(pool.clone(), pipeline.clone(), ids);

    Ok(App {
        documents,
        pipeline,
        sessions,
        store,
        config,
    })
}

fn infer_source_type(path: &std::path::Path, flag: Option<&str>) -> Result<SourceType> {
    if let Some(s) = flag {
        return Ok(s.parse()?);
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("txt")
        .to_lowercase();
    Ok(ext.parse().unwrap_or(SourceType::Txt))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("docqa=info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            path,
            name,
            source_type,
        } => {
            let app = build_app(cfg).await?;
            let text = std::fs::read_to_string(&path).map_err(|e| {
                RagError::Extraction(format!("failed to read {}: {e}", path.display()))
            })?;
            let name = name.unwrap_or_else(|| {
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "document".to_string())
            });
            let source_type = infer_source_type(&path, source_type.as_deref())?;

            let doc = app.documents.ingest_text(&name, source_type, &text).await?;
            println!(
                "Ingested document {} ({}) with {} chunks.",
                doc.id,
                doc.name,
                doc.metadata["chunk_count"].as_u64().unwrap_or(0)
            );
        }
        Commands::Documents => {
            let app = build_app(cfg).await?;
            let docs = app.documents.list_documents().await?;
            if docs.is_empty() {
                println!("No documents ingested.");
            }
            for d in docs {
                println!(
                    "{:>20}  {:<10} {:<10} {}",
                    d.id,
                    d.source_type.as_str(),
                    d.status.as_str(),
                    d.name
                );
            }
        }
        Commands::Delete { id } => {
            let app = build_app(cfg).await?;
            app.documents.delete_document(id).await?;
            println!("Deleted document {id}.");
        }
        Commands::Resync { id } => {
            let app = build_app(cfg).await?;
            let count = app.store.resync_document(id).await?;
            println!("Resynced {count} vectors for document {id}.");
        }
        Commands::Search {
            query,
            document,
            limit,
            threshold,
        } => {
            let app = build_app(cfg).await?;
            let results = app
                .store
                .similarity_search(
                    &query,
                    limit.unwrap_or(app.config.retrieval.top_k),
                    threshold.unwrap_or(app.config.retrieval.similarity_threshold),
                    document,
                )
                .await?;
            if results.is_empty() {
                println!("No chunks above the similarity threshold.");
            }
            for r in results {
                println!(
                    "[doc {} chunk {}] similarity {:.3}\n{}\n",
                    r.document_id,
                    r.chunk_index,
                    r.similarity,
                    r.content.chars().take(200).collect::<String>()
                );
            }
        }
        Commands::Ask {
            question,
            document,
            no_cache,
        } => {
            let app = build_app(cfg).await?;
            let options = QueryOptions {
                document_id: document,
                use_cache: !no_cache,
                ..Default::default()
            };
            let response = app.pipeline.query(&question, &options).await?;

            println!("{}\n", response.answer);
            if !response.sources.is_empty() {
                println!("Sources:");
                for s in &response.sources {
                    println!(
                        "  doc {} chunk {} (similarity {:.3}, score {:.3})",
                        s.document_id, s.chunk_index, s.similarity, s.enhanced_score
                    );
                }
            }
            for tip in response.suggestions.iter().chain(&response.tips) {
                println!("hint: {tip}");
            }
            println!(
                "confidence {:.2} | {} chunks | {:.2}s{}",
                response.confidence,
                response.retrieved_documents,
                response.processing_time,
                if response.from_cache { " | cached" } else { "" }
            );
            if let Some(warning) = &response.performance_warning {
                println!("warning: {warning}");
            }
        }
        Commands::Chat {
            session,
            message,
            document,
        } => {
            let app = build_app(cfg).await?;
            let mut rx = app.sessions.stream_message(session, &message, document).await?;

            use std::io::Write;
            while let Some(event) = rx.recv().await {
                match event {
                    StreamEvent::MessageCreated { .. } => {}
                    StreamEvent::ContentDelta { delta } => {
                        print!("{delta}");
                        std::io::stdout().flush().ok();
                    }
                    StreamEvent::MessageCompleted {
                        sources,
                        confidence,
                        ..
                    } => {
                        println!();
                        if !sources.is_empty() {
                            println!("({} sources, confidence {confidence:.2})", sources.len());
                        }
                    }
                    StreamEvent::Error { message } => {
                        println!();
                        anyhow::bail!("stream failed: {message}");
                    }
                }
            }
        }
        Commands::Sessions { action } => {
            let app = build_app(cfg).await?;
            match action {
                SessionAction::New { title } => {
                    let session = app.sessions.create_session(&title).await?;
                    println!("Created session {} ({})", session.id, session.title);
                }
                SessionAction::List => {
                    let sessions = app.sessions.list_sessions().await?;
                    if sessions.is_empty() {
                        println!("No active sessions.");
                    }
                    for s in sessions {
                        println!("{:>20}  {}", s.id, s.title);
                    }
                }
                SessionAction::Show { id, limit } => {
                    for m in app.sessions.session_messages(id, limit).await? {
                        println!("[{}] {}", m.role.as_str(), m.content);
                    }
                }
                SessionAction::Delete { id } => {
                    app.sessions.delete_session(id).await?;
                    println!("Deleted session {id}.");
                }
                SessionAction::Rename { id, title } => {
                    app.sessions.update_session_title(id, &title).await?;
                    println!("Renamed session {id}.");
                }
            }
        }
        Commands::Cache { action } => {
            let app = build_app(cfg).await?;
            match action {
                CacheAction::Stats => {
                    let stats = app.pipeline.cache().stats();
                    println!(
                        "{} / {} entries, ttl {} minutes",
                        stats.size, stats.max_entries, stats.ttl_minutes
                    );
                }
                CacheAction::Clear => {
                    let n = app.pipeline.cache().clear();
                    println!("Cleared {n} cached answers.");
                }
            }
        }
    }

    Ok(())
}
