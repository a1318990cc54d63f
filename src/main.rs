mod adapters;
mod config;
mod core;
mod processor;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use adapters::llm::ReviewType;
use processor::{summary_markdown, ReviewProcessor};

#[derive(Parser)]
#[command(name = "mrscope")]
#[command(about = "Automated merge request review: fetch, chunk, analyze, comment", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, help = "Model name (claude-* or OpenAI-compatible)")]
    model: Option<String>,

    #[arg(long, global = true, help = "Token budget per diff chunk")]
    max_chunk_tokens: Option<i64>,

    #[arg(long, global = true, help = "Custom review prompt")]
    prompt: Option<String>,

    #[arg(long, global = true, default_value = "markdown")]
    output_format: OutputFormat,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Review a merge request and print or post the findings")]
    Review {
        #[arg(help = "Project ID or group/project path")]
        project: String,

        #[arg(long, help = "Merge request IID")]
        mr: u64,

        #[arg(long, value_enum, default_value = "general")]
        review_type: ReviewType,

        #[arg(long, help = "Post findings back as inline comments")]
        post_comments: bool,

        #[arg(short, long, help = "Write the report to a file instead of stdout")]
        output: Option<PathBuf>,
    },
    #[command(about = "Print diff statistics for a merge request without calling the LLM")]
    Summary {
        #[arg(help = "Project ID or group/project path")]
        project: String,

        #[arg(long, help = "Merge request IID")]
        mr: u64,

        #[arg(long, help = "Post the summary as an MR note")]
        post: bool,
    },
    #[command(about = "Parse a saved changes JSON payload and print summary and chunk layout")]
    Parse {
        #[arg(help = "Path to a JSON file holding the changes array")]
        payload: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Json,
    Markdown,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = config::Config::load()?;
    config.merge_with_cli(cli.model.clone(), cli.max_chunk_tokens, cli.prompt.clone());
    config.validate()?;

    match cli.command {
        Commands::Review {
            project,
            mr,
            review_type,
            post_comments,
            output,
        } => {
            review_command(
                config,
                &project,
                mr,
                review_type,
                post_comments,
                output,
                cli.output_format,
            )
            .await?;
        }
        Commands::Summary { project, mr, post } => {
            summary_command(config, &project, mr, post, cli.output_format).await?;
        }
        Commands::Parse { payload } => {
            parse_command(config, payload, cli.output_format)?;
        }
    }

    Ok(())
}

async fn review_command(
    config: config::Config,
    project: &str,
    mr: u64,
    review_type: ReviewType,
    post_comments: bool,
    output: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    info!("starting review with model {}", config.model);
    let processor = ReviewProcessor::new(config)?;
    let report = processor
        .run(project, mr, review_type, post_comments)
        .await?;

    let rendered = match format {
        OutputFormat::Json => serde_json::to_string_pretty(&report)?,
        OutputFormat::Markdown => report.to_markdown(),
    };
    write_output(output, &rendered)
}

async fn summary_command(
    config: config::Config,
    project: &str,
    mr: u64,
    post: bool,
    format: OutputFormat,
) -> Result<()> {
    let processor = ReviewProcessor::new(config)?;
    let (title, summary) = processor.summarize(project, mr).await?;

    // MR notes are always markdown; the output format only shapes stdout.
    if post {
        let note = summary_markdown(&title, &summary);
        processor.post_summary_note(project, mr, &note).await?;
        info!("posted summary note on {}!{}", project, mr);
    }

    let rendered = match format {
        OutputFormat::Json => serde_json::to_string_pretty(&summary)?,
        OutputFormat::Markdown => summary_markdown(&title, &summary),
    };
    println!("{rendered}");
    Ok(())
}

/// Offline path: runs the parser and chunker over a payload saved from the
/// API (`.../merge_requests/:iid/changes`, the `changes` array).
fn parse_command(config: config::Config, payload: PathBuf, format: OutputFormat) -> Result<()> {
    let content = std::fs::read_to_string(&payload)
        .with_context(|| format!("Failed to read {}", payload.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("{} is not valid JSON", payload.display()))?;

    let parser = core::DiffParser::new(config.chunk_budget())?;
    let files = parser.parse_payload(&value)?;
    let summary = parser.get_diff_summary(&files);
    let chunks = parser.chunk_large_diff(&files);

    match format {
        OutputFormat::Json => {
            let contexts: Vec<_> = files.iter().map(|f| parser.extract_file_context(f)).collect();
            let layout: Vec<serde_json::Value> = chunks
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "files": c.files().iter().map(|f| f.file_path()).collect::<Vec<_>>(),
                        "estimated_tokens": c.estimated_tokens(),
                    })
                })
                .collect();
            let out = serde_json::json!({
                "summary": summary,
                "files": contexts,
                "chunks": layout,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Markdown => {
            println!("{}", summary_markdown(&payload.display().to_string(), &summary));
            println!("Chunk layout (budget {} tokens):", parser.max_chunk_tokens());
            for (idx, chunk) in chunks.iter().enumerate() {
                println!(
                    "- chunk {}: {} files, ~{} tokens",
                    idx + 1,
                    chunk.len(),
                    chunk.estimated_tokens()
                );
            }
        }
    }
    Ok(())
}

fn write_output(path: Option<PathBuf>, content: &str) -> Result<()> {
    match path {
        Some(path) => {
            std::fs::write(&path, content)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("report written to {}", path.display());
        }
        None => println!("{content}"),
    }
    Ok(())
}
