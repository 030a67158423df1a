mod output;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use harvest_client::ChromeBrowser;
use harvest_core::{LoadStatus, Page, RuleStore, SessionState};

use crate::output::JsonLinesHandler;

#[derive(Parser)]
#[command(name = "harvest", version, about = "Rule-driven browser extraction")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RuleSource {
    /// Rule files, or directories of *.yml / *.yaml rules
    #[arg(
        short,
        long = "rules",
        env = "HARVEST_RULES",
        value_delimiter = ',',
        required = true,
        num_args = 1..
    )]
    rules: Vec<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List installed rules in match order
    Rules {
        #[command(flatten)]
        source: RuleSource,

        /// Only list this group
        #[arg(short, long, env = "HARVEST_GROUP")]
        group: Option<String>,
    },

    /// Print the id of the rule that would handle a URL
    Match {
        #[command(flatten)]
        source: RuleSource,

        /// Rule group to match in
        #[arg(short, long, env = "HARVEST_GROUP")]
        group: String,

        /// URL to match
        #[arg(short, long)]
        url: String,
    },

    /// Load a page in Chromium and print the extracted data as JSON lines
    Collect {
        #[command(flatten)]
        source: RuleSource,

        /// Rule group to match in
        #[arg(short, long, env = "HARVEST_GROUP")]
        group: String,

        /// Page URL
        #[arg(short, long)]
        url: String,

        /// Page id reported with every record (defaults to a random UUID)
        #[arg(long)]
        id: Option<String>,

        /// Chrome/Chromium binary (falls back to CHROME_BIN and known paths)
        #[arg(long, env = "HARVEST_CHROME")]
        chrome: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("harvest=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Rules { source, group } => {
            let store = load_rules(&source.rules)?;
            cmd_rules(&store, group.as_deref());
        }
        Commands::Match { source, group, url } => {
            let store = load_rules(&source.rules)?;
            cmd_match(&store, &group, &url)?;
        }
        Commands::Collect {
            source,
            group,
            url,
            id,
            chrome,
        } => {
            let store = load_rules(&source.rules)?;
            let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
            cmd_collect(&store, &group, &url, id, chrome).await?;
        }
    }

    Ok(())
}

/// Build a store from rule files and directories.
///
/// A broken file inside a directory is logged and skipped; a broken file
/// named explicitly is an error.
fn load_rules(paths: &[PathBuf]) -> Result<RuleStore> {
    let store = RuleStore::new();
    let mut loaded = 0;
    let mut failed = 0;

    for path in paths {
        if path.is_dir() {
            let report = store
                .load_dir(path)
                .with_context(|| format!("Failed to read rule directory: {}", path.display()))?;
            for result in report {
                match result.status {
                    LoadStatus::Loaded(_) => loaded += 1,
                    LoadStatus::Failed { .. } => failed += 1,
                }
            }
        } else {
            store
                .append_file(path)
                .with_context(|| format!("Failed to load rule file: {}", path.display()))?;
            loaded += 1;
        }
    }

    tracing::info!(
        loaded,
        failed,
        groups = store.group_names().len(),
        "Rules loaded"
    );
    Ok(store)
}

fn cmd_rules(store: &RuleStore, group: Option<&str>) {
    let groups = match group {
        Some(g) => vec![g.to_string()],
        None => store.group_names(),
    };

    for group in groups {
        let rules = store.rules(&group);
        println!("{group} ({} rules)", rules.len());
        for rule in rules {
            let patterns: Vec<&str> = rule.patterns.iter().map(|p| p.as_str()).collect();
            println!(
                "  [{:>4}] {} v{}: {} field(s){} {}",
                rule.priority,
                rule.id,
                rule.version,
                rule.fields.len(),
                if rule.looping.is_some() { " + loop" } else { "" },
                patterns.join(" | "),
            );
        }
    }
}

fn cmd_match(store: &RuleStore, group: &str, url: &str) -> Result<()> {
    check_url(url)?;
    match store.match_url(group, url) {
        Some(rule) => {
            println!("{}", rule.id);
            Ok(())
        }
        None => bail!("No rule in group '{group}' matches {url}"),
    }
}

async fn cmd_collect(
    store: &RuleStore,
    group: &str,
    url: &str,
    id: String,
    chrome: Option<PathBuf>,
) -> Result<()> {
    check_url(url)?;
    let page = Page::new(id, url, group)?;

    tracing::info!("Launching browser");
    let browser = ChromeBrowser::with_binary(chrome)
        .await
        .context("Failed to start Chromium")?;

    let session = page
        .collect(&browser, store, Arc::new(JsonLinesHandler::stdout()))
        .await?;

    let state = tokio::select! {
        state = session.wait() => state,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, closing tab");
            SessionState::Closed
        }
    };
    session.close().await?;

    if state != SessionState::Completed {
        bail!("Collection of {url} did not complete");
    }
    Ok(())
}

fn check_url(url: &str) -> Result<()> {
    url::Url::parse(url).with_context(|| format!("Invalid URL: {url}"))?;
    Ok(())
}
