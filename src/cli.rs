use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use storyboard_studio::api::HttpImageSource;
use storyboard_studio::api::openai::{OpenAiImageService, OpenAiScriptAnalyzer};
use storyboard_studio::config::Config;
use storyboard_studio::init;
use storyboard_studio::pipeline::{PipelineSettings, StoryboardPipeline, plan_script};
use storyboard_studio::script::{HeuristicAnalyzer, ScriptAnalyzer};

/// Turn scripts into storyboards: shot lists, pencil-sketch pages, cropped
/// panels and high-fidelity frames.
#[derive(Parser, Debug)]
#[command(name = "storyboard", version)]
struct Args {
    /// Script documents to process. Defaults to everything under the scripts folder.
    scripts: Vec<PathBuf>,

    /// Path to the JSON config file
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Structure scripts with the built-in screenplay parser instead of a text model
    #[arg(long)]
    heuristic: bool,

    /// Only structure and paginate; no image generation calls
    #[arg(long)]
    plan_only: bool,

    /// Ignore manifests from earlier runs and start over
    #[arg(long)]
    fresh: bool,

    /// Override the cool-down between generation calls (milliseconds)
    #[arg(long)]
    cooldown_ms: Option<u64>,

    /// Write a config template to --config and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    if args.init_config {
        Config::write_template(&args.config).await?;
        eprintln!("[INFO] Wrote config template to {}", args.config.display());
        return Ok(());
    }

    let needs_key = !(args.plan_only && args.heuristic);
    let mut cfg = if args.config.exists() {
        Config::load(&args.config, needs_key).await?
    } else if !needs_key {
        Config::default()
    } else {
        anyhow::bail!(
            "{} not found (run with --init-config to create one)",
            args.config.display()
        );
    };
    if let Some(ms) = args.cooldown_ms {
        cfg.cooldown_ms = ms;
    }

    init::ensure_directories(&cfg).await?;

    let scripts = if args.scripts.is_empty() {
        init::find_scripts(&cfg.scripts_dir)
    } else {
        args.scripts.clone()
    };
    if scripts.is_empty() {
        eprintln!("[WARNING] No scripts found in {}", cfg.scripts_dir.display());
        return Ok(());
    }

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client")?;

    let analyzer: Box<dyn ScriptAnalyzer> = if args.heuristic {
        Box::new(HeuristicAnalyzer)
    } else {
        Box::new(OpenAiScriptAnalyzer::new(client.clone(), &cfg))
    };

    if args.plan_only {
        let planner = cfg.planner()?;
        let mut failed = 0;
        for path in &scripts {
            let planned =
                plan_script(&analyzer, &planner, path, &cfg.output_dir, Some(cfg.scripts_dir.as_path())).await;
            if let Err(err) = planned {
                eprintln!("[ERROR] {}: {}", path.display(), err);
                failed += 1;
            }
        }
        std::process::exit(if failed == 0 { 0 } else { 1 });
    }

    let settings = PipelineSettings::from_config(&cfg, !args.fresh)?;
    let service = Arc::new(OpenAiImageService::new(client.clone(), &cfg));
    let source = HttpImageSource::with_client(client);
    let pipeline = StoryboardPipeline::new(analyzer, service, source, settings);

    let code = pipeline.run_batch(&scripts).await;
    std::process::exit(code);
}
