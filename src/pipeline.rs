//! Pipeline driver: script → pages → lo-fi renders → cropped frames → hi-fi renders.
//!
//! Progress is persisted to `<output>/<slug>/manifest.json` after every
//! rendered item, so a later run over the same script skips finished pages
//! and shots.

use crate::api::{GenerationService, ImageSource, MediaStore};
use crate::config::Config;
use crate::error::{Result, StoryboardError};
use crate::grid::{ExtractionReport, FrameExtractor};
use crate::model::{GeneratedPage, HiFiFrame, PageSpec, ParsedScript};
use crate::planner::PagePlanner;
use crate::queue::{FrameRenderer, PageRenderer, QueueProgress, RenderQueue, Renderer, Step};
use crate::script::{ScriptAnalyzer, ScriptStructurer, load_script_text};
use crate::{logi, logok, logw};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;

const MANIFEST_FILE: &str = "manifest.json";
const PLAN_FILE: &str = "plan.json";
const FRAMES_DIR: &str = "frames";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunManifest {
    pub source: String,
    pub script: ParsedScript,
    #[serde(default)]
    pub pages: Vec<GeneratedPage>,
    #[serde(default)]
    pub hifi_frames: Vec<HiFiFrame>,
    /// Cropped panel PNGs, relative to the manifest's directory.
    #[serde(default)]
    pub frame_files: Vec<String>,
    #[serde(default)]
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunManifest {
    pub fn new(source: &Path, script: ParsedScript) -> Self {
        let now = Utc::now();
        Self {
            source: source.display().to_string(),
            script,
            pages: Vec::new(),
            hifi_frames: Vec::new(),
            frame_files: Vec::new(),
            completed: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub async fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILE);
        if fs::metadata(&path).await.is_err() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub async fn save(&mut self, dir: &Path) -> Result<()> {
        self.updated_at = Utc::now();
        let body = serde_json::to_vec_pretty(self)?;
        let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, dir.join(MANIFEST_FILE)).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    LoFi,
    HiFi,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::LoFi => f.write_str("lo-fi page render"),
            Stage::HiFi => f.write_str("hi-fi frame render"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// A remote call failed; re-running resumes at the halted item.
    Halted {
        stage: Stage,
        progress: QueueProgress,
    },
    /// Every queue finished but some pages could not be cropped.
    Incomplete { failed_pages: Vec<u32> },
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub title: String,
    pub output_dir: PathBuf,
    pub pages_planned: usize,
    pub pages_rendered: usize,
    pub frames_extracted: usize,
    pub dropped_panels: usize,
    pub hifi_frames: usize,
    pub status: RunStatus,
}

impl RunOutcome {
    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub output_root: PathBuf,
    pub planner: PagePlanner,
    pub cooldown: Duration,
    pub call_timeout: Option<Duration>,
    /// Reuse `manifest.json` from an earlier run of the same script.
    pub resume: bool,
    /// Scripts under this folder are keyed by their relative path, so
    /// `act1/intro.txt` and `act2/intro.txt` get separate output folders.
    pub scripts_root: Option<PathBuf>,
}

impl PipelineSettings {
    pub fn from_config(cfg: &Config, resume: bool) -> anyhow::Result<Self> {
        Ok(Self {
            output_root: cfg.output_dir.clone(),
            planner: cfg.planner()?,
            cooldown: cfg.cooldown(),
            call_timeout: cfg.request_timeout(),
            resume,
            scripts_root: Some(cfg.scripts_dir.clone()),
        })
    }
}

/// Lower-case ASCII slug of a script's file stem.
pub fn script_slug(path: &Path) -> String {
    slugify(path.file_stem().and_then(OsStr::to_str).unwrap_or("script"))
}

/// Slug of the script's path relative to `root` without its extension
/// (`act1/intro.txt` -> `act1-intro`). Falls back to [`script_slug`] when
/// the script does not live under `root`.
pub fn script_slug_under(path: &Path, root: Option<&Path>) -> String {
    let relative = root
        .and_then(|root| pathdiff::diff_paths(path, root))
        .filter(|rel| {
            rel.components().next().is_some()
                && rel.components().all(|c| matches!(c, Component::Normal(_)))
        });
    match relative {
        Some(rel) => slugify(&rel.with_extension("").to_string_lossy()),
        None => script_slug(path),
    }
}

fn slugify(stem: &str) -> String {
    let mut out = String::new();
    for ch in stem.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    let out = out.trim_end_matches('-').to_string();
    if out.is_empty() { "script".to_string() } else { out }
}

/// Reads and structures one script document.
pub async fn structure_script<A: ScriptAnalyzer>(analyzer: A, path: &Path) -> Result<ParsedScript> {
    let text = load_script_text(path).await?;
    let stem = path.file_stem().and_then(OsStr::to_str).unwrap_or("Untitled");
    ScriptStructurer::new(analyzer)
        .with_fallback_title(stem)
        .parse(&text)
        .await
}

/// Structures and paginates a script without any generation calls, writing
/// `plan.json` next to where the run manifest would go.
pub async fn plan_script<A: ScriptAnalyzer>(
    analyzer: A,
    planner: &PagePlanner,
    path: &Path,
    output_root: &Path,
    scripts_root: Option<&Path>,
) -> Result<(ParsedScript, Vec<PageSpec>)> {
    let script = structure_script(analyzer, path).await?;
    let pages = planner.plan(&script)?;

    let out_dir = output_root.join(script_slug_under(path, scripts_root));
    fs::create_dir_all(&out_dir).await?;
    let body = serde_json::to_vec_pretty(&serde_json::json!({
        "script": &script,
        "pages": &pages,
    }))?;
    fs::write(out_dir.join(PLAN_FILE), body).await?;
    logok(format!(
        "Planned {}: {} scenes, {} shots, {} pages -> {}",
        script.title,
        script.total_scenes,
        script.total_shots(),
        pages.len(),
        out_dir.join(PLAN_FILE).display()
    ));
    Ok((script, pages))
}

pub struct StoryboardPipeline<A, G, S> {
    analyzer: A,
    service: Arc<G>,
    extractor: FrameExtractor<S>,
    settings: PipelineSettings,
}

impl<A, G, S> StoryboardPipeline<A, G, S>
where
    A: ScriptAnalyzer,
    G: GenerationService + 'static,
    S: ImageSource,
{
    pub fn new(analyzer: A, service: Arc<G>, source: S, settings: PipelineSettings) -> Self {
        let extractor = FrameExtractor::new(source, settings.planner.geometry());
        Self {
            analyzer,
            service,
            extractor,
            settings,
        }
    }

    pub fn output_dir_for(&self, script_path: &Path) -> PathBuf {
        self.settings.output_root.join(script_slug_under(
            script_path,
            self.settings.scripts_root.as_deref(),
        ))
    }

    /// True when an earlier run of this same script finished every stage.
    pub async fn already_completed(&self, script_path: &Path) -> bool {
        match RunManifest::load(&self.output_dir_for(script_path)).await {
            Ok(Some(m)) => m.completed && same_source(&m.source, script_path).await,
            _ => false,
        }
    }

    pub async fn run(&self, script_path: &Path) -> Result<RunOutcome> {
        let out_dir = self.output_dir_for(script_path);
        let frames_dir = out_dir.join(FRAMES_DIR);
        fs::create_dir_all(&frames_dir).await?;

        let existing = if self.settings.resume {
            RunManifest::load(&out_dir).await?
        } else {
            None
        };
        let mut manifest = match existing {
            Some(m) if !same_source(&m.source, script_path).await => {
                return Err(StoryboardError::Config(format!(
                    "{} already holds the run of {}; cannot resume {} there",
                    out_dir.display(),
                    m.source,
                    script_path.display()
                )));
            }
            Some(m) => {
                logi(format!(
                    "Resuming {} from manifest ({} pages, {} hi-fi frames recorded)",
                    m.script.title,
                    m.pages.len(),
                    m.hifi_frames.len()
                ));
                m
            }
            None => {
                let script = structure_script(&self.analyzer, script_path).await?;
                RunManifest::new(script_path, script)
            }
        };
        manifest.completed = false;
        manifest.save(&out_dir).await?;

        let script = manifest.script.clone();
        let plan = self.settings.planner.plan(&script)?;
        logi(format!(
            "{}: {} scenes, {} shots, {} pages",
            script.title,
            script.total_scenes,
            script.total_shots(),
            plan.len()
        ));

        let store = MediaStore::new(&out_dir);
        let page_renderer = PageRenderer::new(Arc::clone(&self.service)).with_store(store.clone());
        let mut lofi = RenderQueue::new(page_renderer, plan.clone())
            .with_cooldown(self.settings.cooldown)
            .with_call_timeout(self.settings.call_timeout)
            .with_outputs(manifest.pages.iter().map(|p| (p.page_number, p.clone())));
        let lofi_halt = drive(&mut lofi, &mut manifest, &out_dir, |m, pages| m.pages = pages).await?;
        let generated = lofi.outputs_in_order();
        let fetchable: Vec<GeneratedPage> = generated
            .iter()
            .map(|page| GeneratedPage {
                image_url: store.resolve(&page.image_url),
                ..page.clone()
            })
            .collect();

        let report = self.extractor.extract_all(&fetchable, &script).await?;
        let dropped_panels = report_dropped_panels(&report, &plan);
        manifest.frame_files = write_frames(&report, &frames_dir, &out_dir).await?;
        manifest.save(&out_dir).await?;

        let mut outcome = RunOutcome {
            title: script.title.clone(),
            output_dir: out_dir.clone(),
            pages_planned: plan.len(),
            pages_rendered: generated.len(),
            frames_extracted: report.frames().count(),
            dropped_panels,
            hifi_frames: 0,
            status: RunStatus::Completed,
        };

        if let Some(progress) = lofi_halt {
            outcome.hifi_frames = manifest.hifi_frames.len();
            outcome.status = RunStatus::Halted {
                stage: Stage::LoFi,
                progress,
            };
            return Ok(outcome);
        }

        let failed_pages = report.failed_pages();
        let frames = report.into_frames();
        let frame_renderer = FrameRenderer::new(Arc::clone(&self.service)).with_store(store);
        let mut hifi = RenderQueue::new(frame_renderer, frames)
            .with_cooldown(self.settings.cooldown)
            .with_call_timeout(self.settings.call_timeout)
            .with_outputs(manifest.hifi_frames.iter().map(|f| (f.shot_number, f.clone())));
        let hifi_halt = drive(&mut hifi, &mut manifest, &out_dir, |m, frames| m.hifi_frames = frames).await?;
        outcome.hifi_frames = hifi.outputs_in_order().len();

        outcome.status = match hifi_halt {
            Some(progress) => RunStatus::Halted {
                stage: Stage::HiFi,
                progress,
            },
            None if !failed_pages.is_empty() => RunStatus::Incomplete { failed_pages },
            None => RunStatus::Completed,
        };

        manifest.completed = outcome.is_complete();
        manifest.save(&out_dir).await?;
        Ok(outcome)
    }

    /// Runs every script in turn. Returns the process exit code: 0 when all
    /// scripts completed, 1 otherwise.
    pub async fn run_batch(&self, scripts: &[PathBuf]) -> i32 {
        let mut completed = 0usize;
        let mut attempted = 0usize;

        for path in scripts {
            if self.settings.resume && self.already_completed(path).await {
                logi(format!("Skipping {} (already completed)", path.display()));
                completed += 1;
                continue;
            }

            attempted += 1;
            logi(format!("=== Processing: {} ===", path.display()));
            match self.run(path).await {
                Ok(outcome) => {
                    report_outcome(&outcome);
                    if outcome.is_complete() {
                        completed += 1;
                    }
                }
                Err(err) => logw(format!("FAILED: {}: {}", path.display(), err)),
            }
        }

        logi(format!(
            "All done. {}/{} scripts complete ({} processed this run)",
            completed,
            scripts.len(),
            attempted
        ));
        if completed == scripts.len() { 0 } else { 1 }
    }
}

/// Whether a manifest's recorded source is the script at `path`.
async fn same_source(recorded: &str, path: &Path) -> bool {
    let recorded = Path::new(recorded);
    if recorded == path {
        return true;
    }
    match (fs::canonicalize(recorded).await, fs::canonicalize(path).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Steps a queue to the end, persisting the manifest after each rendered
/// item. `Some(progress)` when the queue halted on a render failure.
async fn drive<R: Renderer>(
    queue: &mut RenderQueue<R>,
    manifest: &mut RunManifest,
    out_dir: &Path,
    record: fn(&mut RunManifest, Vec<R::Output>),
) -> Result<Option<QueueProgress>> {
    loop {
        match queue.render_next().await {
            Ok(Some(Step::Rendered { .. })) => {
                record(manifest, queue.outputs().values().cloned().collect());
                manifest.save(out_dir).await?;
            }
            Ok(Some(Step::Skipped { .. })) => {}
            Ok(None) => return Ok(None),
            Err(StoryboardError::Render { .. }) => return Ok(Some(queue.progress())),
            Err(err) => return Err(err),
        }
    }
}

/// Counts dropped panels and flags drops on pages that are not the last of
/// their scene, which only a pagination defect can cause.
fn report_dropped_panels(report: &ExtractionReport, plan: &[PageSpec]) -> usize {
    let mut total = 0;
    for page in &report.pages {
        if page.dropped_panels.is_empty() {
            continue;
        }
        total += page.dropped_panels.len();
        let last_of_scene = plan
            .iter()
            .filter(|p| p.scene_number == page.scene_number)
            .map(|p| p.page_number)
            .max();
        if last_of_scene != Some(page.page_number) {
            logw(format!(
                "Page {} (scene {}) left panels {:?} empty but is not the last page of its scene",
                page.page_number, page.scene_number, page.dropped_panels
            ));
        }
    }
    total
}

async fn write_frames(report: &ExtractionReport, frames_dir: &Path, out_dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for frame in report.frames() {
        let path = frames_dir.join(format!(
            "page_{:03}_panel_{}_shot_{:04}.png",
            frame.page_number, frame.frame_index, frame.shot_number
        ));
        fs::write(&path, STANDARD.decode(&frame.base64)?).await?;
        let rel = pathdiff::diff_paths(&path, out_dir).unwrap_or(path);
        files.push(rel.to_string_lossy().replace('\\', "/"));
    }
    Ok(files)
}

fn report_outcome(outcome: &RunOutcome) {
    let summary = format!(
        "{}: {}/{} pages, {} frames ({} empty panels dropped), {} hi-fi frames -> {}",
        outcome.title,
        outcome.pages_rendered,
        outcome.pages_planned,
        outcome.frames_extracted,
        outcome.dropped_panels,
        outcome.hifi_frames,
        outcome.output_dir.display()
    );
    match &outcome.status {
        RunStatus::Completed => logok(format!("DONE: {}", summary)),
        RunStatus::Halted { stage, progress } => {
            logw(format!("HALTED during {}: {}", stage, progress));
            logw(format!("{} (re-run to resume)", summary));
        }
        RunStatus::Incomplete { failed_pages } => {
            logw(format!("INCOMPLETE: pages {:?} could not be cropped", failed_pages));
            logw(summary);
        }
    }
}
