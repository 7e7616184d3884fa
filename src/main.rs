//! # Avivo CLI (`avivo`)
//!
//! Ask questions about your documents and get descriptions of your images,
//! answered by local models.
//!
//! ## Usage
//!
//! ```bash
//! avivo --config ./config/avivo.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `avivo serve` | Start the REST server |
//! | `avivo ingest <paths…>` | Add files (or every file under a directory) to the knowledge base |
//! | `avivo query "<question>"` | Answer a question from the knowledge base |
//! | `avivo describe <image>` | Describe an image |
//! | `avivo stats` | Show models, index size and retrieval settings |
//! | `avivo clear` | Empty the knowledge base |
//! | `avivo cache stats` | Show cache counters of a running server |
//! | `avivo cache clear --type rag` | Clear part of a running server's cache |
//!
//! The cache lives inside the `serve` process, so `cache` commands talk to
//! it over HTTP at `[server].bind` (or `--server`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use walkdir::WalkDir;

use avivo::backend;
use avivo::cache::CacheScope;
use avivo::config;
use avivo::extract;
use avivo::logging;
use avivo::query::QueryOptions;
use avivo::server;
use avivo::service::Services;

/// Grounded question answering over your documents, plus image descriptions.
#[derive(Parser)]
#[command(name = "avivo", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Missing sections fall back to defaults that talk to a local Ollama.
    #[arg(long, global = true, default_value = "./config/avivo.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST server on `[server].bind`.
    Serve,

    /// Ingest files into the knowledge base.
    ///
    /// Directories are walked recursively; files with an unsupported
    /// extension inside a directory are skipped. Each file is indexed under
    /// its path as written, so re-ingesting the same path replaces it.
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Answer a question from the knowledge base.
    Query {
        question: String,

        /// Passages to retrieve (defaults to `[retrieval].top_k`).
        #[arg(long)]
        top_k: Option<usize>,

        /// Print the passages the answer was grounded on.
        #[arg(long)]
        sources: bool,
    },

    /// Describe an image file.
    Describe { image: PathBuf },

    /// Show knowledge base statistics.
    Stats,

    /// Remove every document from the knowledge base.
    Clear,

    /// Inspect or clear the cache of a running server.
    Cache {
        /// Server base URL (defaults to `http://` + `[server].bind`).
        #[arg(long)]
        server: Option<String>,

        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show key counts and hit/miss counters.
    Stats,
    /// Clear cached entries.
    Clear {
        /// `all`, `images` or `rag`.
        #[arg(long = "type", default_value = "all")]
        cache_type: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = if cli.config.exists() {
        config::load_config(&cli.config)?
    } else {
        config::Config::default()
    };
    logging::init(&cfg.logging);

    if let Commands::Cache { server, action } = &cli.command {
        let base = server.clone().unwrap_or_else(|| server_url(&cfg.server.bind));
        return run_cache(&base, action).await;
    }

    let services = Arc::new(Services::from_config(cfg).await?);

    match cli.command {
        Commands::Serve => {
            server::run_server(services).await?;
        }
        Commands::Ingest { paths } => {
            run_ingest(&services, &paths).await?;
        }
        Commands::Query {
            question,
            top_k,
            sources,
        } => {
            let options = QueryOptions {
                top_k,
                include_sources: sources,
            };
            let answer = services.query.answer_with(&question, options).await?;
            println!("{}", answer.answer);
            if let Some(refs) = answer.sources {
                println!();
                for (i, r) in refs.iter().enumerate() {
                    println!("[{}] {} (score {:.3})", i + 1, r.source_id, r.score);
                    println!("    {}", r.preview.replace('\n', " "));
                }
            }
        }
        Commands::Describe { image } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("Failed to read {}", image.display()))?;
            let description = services.vision.describe(&bytes).await?;
            println!("{}", description.description);
        }
        Commands::Stats => {
            let stats = services.rag_stats().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Clear => {
            let removed = services.clear_knowledge_base().await?;
            println!("Knowledge base cleared ({} chunks removed).", removed);
        }
        // Answered by the running server; see above.
        Commands::Cache { .. } => {}
    }

    Ok(())
}

/// Base URL for a bind address; wildcard hosts are reached over loopback.
fn server_url(bind: &str) -> String {
    let addr = bind
        .strip_prefix("0.0.0.0:")
        .map(|port| format!("127.0.0.1:{}", port))
        .unwrap_or_else(|| bind.to_string());
    format!("http://{}", addr)
}

async fn run_cache(base: &str, action: &CacheAction) -> Result<()> {
    let client = backend::http_client(10)?;
    let base = backend::base_url(base);
    let request = match action {
        CacheAction::Stats => client.get(format!("{}/api/cache/stats", base)),
        CacheAction::Clear { cache_type } => {
            let scope: CacheScope = cache_type.parse().map_err(anyhow::Error::msg)?;
            client
                .delete(format!("{}/api/cache/clear", base))
                .query(&[("cache_type", scope.to_string())])
        }
    };

    let resp = request
        .send()
        .await
        .with_context(|| format!("Cannot reach avivo server at {} (is `avivo serve` running?)", base))?;
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.context("Server returned a non-JSON body")?;
    if !status.is_success() {
        bail!("Server returned {}: {}", status, body);
    }

    match action {
        CacheAction::Stats => println!("{}", serde_json::to_string_pretty(&body)?),
        CacheAction::Clear { .. } => println!(
            "{}",
            body.get("message").and_then(|m| m.as_str()).unwrap_or("Cache cleared")
        ),
    }
    Ok(())
}

async fn run_ingest(services: &Services, paths: &[PathBuf]) -> Result<()> {
    let mut files: Vec<PathBuf> = Vec::new();
    for path in paths {
        if path.is_dir() {
            files.extend(supported_files_under(path));
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            bail!("No such file or directory: {}", path.display());
        }
    }

    let mut failed = 0usize;
    for file in &files {
        match services.ingestor.ingest_path(file).await {
            Ok(report) => println!(
                "{}: {} chunks ({} total)",
                file.display(),
                report.chunk_count,
                report.total_chunks
            ),
            Err(e) => {
                failed += 1;
                eprintln!("{}: {}", file.display(), e);
            }
        }
    }

    println!("Ingested {} of {} files.", files.len() - failed, files.len());
    if failed > 0 {
        bail!("{} file(s) failed to ingest", failed);
    }
    Ok(())
}

fn supported_files_under(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| extract::is_supported(&e.to_ascii_lowercase()))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}
