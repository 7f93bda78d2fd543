//! Sequential render queue.
//!
//! Drives a list of render requests through a remote capability strictly one
//! at a time. Outputs are kept in a map keyed by each request's natural key
//! (page number or shot number); a request whose key already has an output is
//! skipped without a remote call. A failed call halts the queue at that index
//! with earlier outputs intact; resuming re-enters at the halted index.
//!
//! Between successful calls a fixed cool-down is enforced: the next remote
//! call never starts earlier than `cooldown` after the previous success
//! completed.

use crate::api::{GenerationRequest, GenerationService, MediaStore};
use crate::error::{Result, StoryboardError};
use crate::model::{CroppedFrame, GeneratedPage, HiFiFrame, PageSpec};
use crate::planner::hifi_prompt;
use crate::{logi, logok, logw};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(1);

/// One deployment of the queue: how a request is keyed and rendered.
#[async_trait]
pub trait Renderer: Send + Sync {
    type Request: Send + Sync;
    type Key: Ord + Clone + fmt::Display + Send + Sync;
    type Output: Clone + Send + Sync;

    /// Noun used in progress lines ("page", "shot").
    fn item_label(&self) -> &'static str;

    fn key(&self, request: &Self::Request) -> Self::Key;

    async fn render(&self, request: &Self::Request) -> Result<Self::Output>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Running { current: usize },
    Completed,
    Stopped { index: usize, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Rendered { index: usize },
    Skipped { index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueProgress {
    pub completed: usize,
    pub total: usize,
    /// `(index, cause)` of the item the queue halted on.
    pub halted: Option<(usize, String)>,
}

impl fmt::Display for QueueProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} items completed", self.completed, self.total)?;
        if let Some((index, cause)) = &self.halted {
            write!(f, ", stopped at item {} due to: {}", index + 1, cause)?;
        }
        Ok(())
    }
}

pub struct RenderQueue<R: Renderer> {
    renderer: R,
    requests: Vec<R::Request>,
    outputs: BTreeMap<R::Key, R::Output>,
    cursor: usize,
    state: QueueState,
    cooldown: Duration,
    call_timeout: Option<Duration>,
    last_success: Option<Instant>,
}

impl<R: Renderer> RenderQueue<R> {
    pub fn new(renderer: R, requests: Vec<R::Request>) -> Self {
        Self {
            renderer,
            requests,
            outputs: BTreeMap::new(),
            cursor: 0,
            state: QueueState::Idle,
            cooldown: DEFAULT_COOLDOWN,
            call_timeout: None,
            last_success: None,
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Optional upper bound on a single remote call.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Seeds outputs recorded by an earlier run; their items will be skipped.
    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = (R::Key, R::Output)>) -> Self {
        self.outputs.extend(outputs);
        self
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn state(&self) -> &QueueState {
        &self.state
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn output(&self, key: &R::Key) -> Option<&R::Output> {
        self.outputs.get(key)
    }

    pub fn outputs(&self) -> &BTreeMap<R::Key, R::Output> {
        &self.outputs
    }

    /// Outputs in request order, one per distinct key.
    pub fn outputs_in_order(&self) -> Vec<R::Output> {
        let mut seen = Vec::new();
        let mut out = Vec::new();
        for request in &self.requests {
            let key = self.renderer.key(request);
            if seen.contains(&key) {
                continue;
            }
            if let Some(output) = self.outputs.get(&key) {
                out.push(output.clone());
            }
            seen.push(key);
        }
        out
    }

    pub fn progress(&self) -> QueueProgress {
        let completed = self
            .requests
            .iter()
            .filter(|r| self.outputs.contains_key(&self.renderer.key(r)))
            .count();
        let halted = match &self.state {
            QueueState::Stopped { index, error } => Some((*index, error.clone())),
            _ => None,
        };
        QueueProgress {
            completed,
            total: self.requests.len(),
            halted,
        }
    }

    fn all_rendered(&self) -> bool {
        self.requests
            .iter()
            .all(|r| self.outputs.contains_key(&self.renderer.key(r)))
    }

    /// Processes the item at `index`: skips it when its key already has an
    /// output, otherwise waits out the cool-down and issues the remote call.
    pub async fn render_item(&mut self, index: usize) -> Result<Step> {
        let Some(request) = self.requests.get(index) else {
            return Err(StoryboardError::PlanningInvariant(format!(
                "render index {} out of range ({} items)",
                index,
                self.requests.len()
            )));
        };
        let key = self.renderer.key(request);
        let label = self.renderer.item_label();
        let total = self.requests.len();

        if self.outputs.contains_key(&key) {
            logi(format!("Skipping {} {} (already rendered)", label, key));
            self.advance_past(index);
            return Ok(Step::Skipped { index });
        }

        if let Some(last) = self.last_success {
            let ready_at = last + self.cooldown;
            let now = Instant::now();
            if now < ready_at {
                logi(format!(
                    "Cooling down {}ms before {} {}",
                    (ready_at - now).as_millis(),
                    label,
                    key
                ));
                tokio::time::sleep_until(ready_at).await;
            }
        }

        self.state = QueueState::Running { current: index };
        logi(format!("Rendering {} {} ({}/{})...", label, key, index + 1, total));

        let call = self.renderer.render(request);
        let result = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(StoryboardError::Generation(format!(
                    "timed out after {}s",
                    limit.as_secs_f64()
                ))),
            },
            None => call.await,
        };

        match result {
            Ok(output) => {
                self.outputs.insert(key.clone(), output);
                self.last_success = Some(Instant::now());
                logok(format!("Rendered {} {}", label, key));
                self.advance_past(index);
                Ok(Step::Rendered { index })
            }
            Err(err) => {
                let cause = err.to_string();
                self.cursor = index;
                self.state = QueueState::Stopped {
                    index,
                    error: cause.clone(),
                };
                logw(format!("Render halted: {}", self.progress()));
                match err {
                    StoryboardError::PlanningInvariant(_) | StoryboardError::Config(_) => Err(err),
                    _ => Err(StoryboardError::Render {
                        index,
                        key: format!("{} {}", label, key),
                        cause,
                    }),
                }
            }
        }
    }

    fn advance_past(&mut self, index: usize) {
        self.cursor = index + 1;
        self.state = if self.cursor < self.requests.len() {
            QueueState::Running {
                current: self.cursor,
            }
        } else if self.all_rendered() {
            QueueState::Completed
        } else {
            QueueState::Idle
        };
    }

    /// Processes the item at the cursor. `Ok(None)` once the end is reached.
    pub async fn render_next(&mut self) -> Result<Option<Step>> {
        if self.cursor >= self.requests.len() {
            if self.all_rendered() {
                self.state = QueueState::Completed;
            }
            return Ok(None);
        }
        self.render_item(self.cursor).await.map(Some)
    }

    /// Runs from `start` to the end, or until the first failure.
    pub async fn run_from(&mut self, start: usize) -> Result<QueueProgress> {
        self.cursor = start;
        while self.render_next().await?.is_some() {}
        let progress = self.progress();
        logok(format!("{} queue finished: {}", self.renderer.item_label(), progress));
        Ok(progress)
    }

    pub async fn run(&mut self) -> Result<QueueProgress> {
        self.run_from(0).await
    }

    /// Continues from the halted index, or from the cursor when not halted.
    pub async fn resume(&mut self) -> Result<QueueProgress> {
        let start = match &self.state {
            QueueState::Stopped { index, .. } => *index,
            _ => self.cursor,
        };
        self.run_from(start).await
    }

    pub fn into_outputs(self) -> BTreeMap<R::Key, R::Output> {
        self.outputs
    }
}

/// Lo-fi deployment: one pencil-sketch page per `PageSpec`, keyed by page number.
pub struct PageRenderer<G> {
    service: G,
    store: Option<MediaStore>,
}

impl<G: GenerationService> PageRenderer<G> {
    pub fn new(service: G) -> Self {
        Self {
            service,
            store: None,
        }
    }

    /// Inline results are written under the store instead of kept as data URLs.
    pub fn with_store(mut self, store: MediaStore) -> Self {
        self.store = Some(store);
        self
    }
}

#[async_trait]
impl<G: GenerationService> Renderer for PageRenderer<G> {
    type Request = PageSpec;
    type Key = u32;
    type Output = GeneratedPage;

    fn item_label(&self) -> &'static str {
        "page"
    }

    fn key(&self, request: &PageSpec) -> u32 {
        request.page_number
    }

    async fn render(&self, page: &PageSpec) -> Result<GeneratedPage> {
        let media = self
            .service
            .submit(&GenerationRequest::text(page.prompt.clone()))
            .await?;
        let image_url = match &self.store {
            Some(store) => store.keep(media, &format!("pages/page_{:03}", page.page_number)).await?,
            None => media.into_url(),
        };
        Ok(GeneratedPage {
            page_number: page.page_number,
            scene_number: page.scene_number,
            image_url,
            shots_included: page.shot_numbers(),
            generation_prompt: page.prompt.clone(),
        })
    }
}

/// Hi-fi deployment: one still per cropped frame, conditioned on the frame and
/// keyed by shot number.
pub struct FrameRenderer<G> {
    service: G,
    store: Option<MediaStore>,
}

impl<G: GenerationService> FrameRenderer<G> {
    pub fn new(service: G) -> Self {
        Self {
            service,
            store: None,
        }
    }

    /// Inline results are written under the store instead of kept as data URLs.
    pub fn with_store(mut self, store: MediaStore) -> Self {
        self.store = Some(store);
        self
    }
}

#[async_trait]
impl<G: GenerationService> Renderer for FrameRenderer<G> {
    type Request = CroppedFrame;
    type Key = u32;
    type Output = HiFiFrame;

    fn item_label(&self) -> &'static str {
        "shot"
    }

    fn key(&self, request: &CroppedFrame) -> u32 {
        request.shot_number
    }

    async fn render(&self, frame: &CroppedFrame) -> Result<HiFiFrame> {
        let prompt = hifi_prompt(&frame.shot_data);
        let media = self
            .service
            .submit(&GenerationRequest::with_reference(prompt.clone(), frame.data_url()))
            .await?;
        let image_url = match &self.store {
            Some(store) => store.keep(media, &format!("hifi/shot_{:04}", frame.shot_number)).await?,
            None => media.into_url(),
        };
        Ok(HiFiFrame {
            shot_number: frame.shot_number,
            image_url,
            generation_prompt: prompt,
        })
    }
}

pub type PageQueue<G> = RenderQueue<PageRenderer<G>>;
pub type FrameQueue<G> = RenderQueue<FrameRenderer<G>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::GeneratedMedia;
    use crate::model::{Shot, ShotType};
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    /// Records every call with the (paused) tokio clock and fails on demand.
    #[derive(Default)]
    struct FakeService {
        calls: Mutex<Vec<(String, Option<String>, Instant)>>,
        fail_prompts: Mutex<HashSet<String>>,
        latency: Duration,
    }

    impl FakeService {
        fn fail_on(&self, prompt: &str) {
            self.fail_prompts.lock().unwrap().insert(prompt.to_string());
        }

        fn heal(&self) {
            self.fail_prompts.lock().unwrap().clear();
        }

        fn prompts(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|c| c.0.clone()).collect()
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().iter().map(|c| c.2).collect()
        }
    }

    #[async_trait]
    impl GenerationService for FakeService {
        async fn submit(&self, request: &GenerationRequest) -> Result<GeneratedMedia> {
            self.calls.lock().unwrap().push((
                request.prompt.clone(),
                request.reference_image.clone(),
                Instant::now(),
            ));
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            if self.fail_prompts.lock().unwrap().contains(&request.prompt) {
                return Err(StoryboardError::Generation("HTTP 503".into()));
            }
            Ok(GeneratedMedia::Url(format!("https://cdn/{}", request.prompt)))
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    fn pages(n: u32) -> Vec<PageSpec> {
        (1..=n)
            .map(|i| PageSpec {
                page_number: i,
                scene_number: 1,
                scene_description: "s".into(),
                shots: Vec::new(),
                prompt: format!("p{}", i),
            })
            .collect()
    }

    fn frame(shot_number: u32) -> CroppedFrame {
        CroppedFrame {
            frame_index: 0,
            page_number: 1,
            shot_number,
            base64: "QUJD".into(),
            shot_data: Shot {
                shot_number,
                shot_type: ShotType::Wide,
                camera_movement: "static".into(),
                composition: String::new(),
                lighting: String::new(),
                action: format!("beat {}", shot_number),
                dialogue: None,
                style_notes: String::new(),
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn halt_then_resume_matches_uninterrupted_run() {
        let service = Arc::new(FakeService::default());
        service.fail_on("p4");
        let mut queue = RenderQueue::new(PageRenderer::new(service.clone()), pages(5));

        let err = queue.run().await.unwrap_err();
        assert!(matches!(err, StoryboardError::Render { index: 3, .. }));
        assert_eq!(
            queue.state(),
            &QueueState::Stopped {
                index: 3,
                error: "Generation failed: HTTP 503".into()
            }
        );
        let progress = queue.progress();
        assert_eq!(progress.completed, 3);
        assert_eq!(
            progress.to_string(),
            "3/5 items completed, stopped at item 4 due to: Generation failed: HTTP 503"
        );
        assert_eq!(queue.outputs_in_order().len(), 3);

        service.heal();
        let progress = queue.resume().await.unwrap();
        assert_eq!(progress.completed, 5);
        assert_eq!(queue.state(), &QueueState::Completed);
        assert_eq!(service.prompts(), vec!["p1", "p2", "p3", "p4", "p4", "p5"]);

        let baseline_service = Arc::new(FakeService::default());
        let mut baseline = RenderQueue::new(PageRenderer::new(baseline_service), pages(5));
        baseline.run().await.unwrap();
        assert_eq!(queue.outputs_in_order(), baseline.outputs_in_order());
    }

    #[tokio::test(start_paused = true)]
    async fn existing_outputs_are_never_rerendered() {
        let service = Arc::new(FakeService::default());
        let mut queue = RenderQueue::new(PageRenderer::new(service.clone()), pages(3));

        assert_eq!(queue.render_item(1).await.unwrap(), Step::Rendered { index: 1 });
        assert_eq!(queue.render_item(1).await.unwrap(), Step::Skipped { index: 1 });
        assert_eq!(service.prompts(), vec!["p2"]);

        queue.run().await.unwrap();
        assert_eq!(service.prompts(), vec!["p2", "p1", "p3"]);
        let urls: Vec<String> = queue.outputs_in_order().into_iter().map(|p| p.image_url).collect();
        assert_eq!(urls, vec!["https://cdn/p1", "https://cdn/p2", "https://cdn/p3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn seeded_outputs_skip_remote_calls() {
        let service = Arc::new(FakeService::default());
        let seed = GeneratedPage {
            page_number: 2,
            scene_number: 1,
            image_url: "old".into(),
            shots_included: vec![],
            generation_prompt: "p2".into(),
        };
        let mut queue =
            RenderQueue::new(PageRenderer::new(service.clone()), pages(3)).with_outputs([(2, seed)]);
        queue.run().await.unwrap();
        assert_eq!(service.prompts(), vec!["p1", "p3"]);
        assert_eq!(queue.output(&2).unwrap().image_url, "old");
    }

    #[tokio::test(start_paused = true)]
    async fn successive_calls_respect_cooldown() {
        let service = Arc::new(FakeService {
            latency: Duration::from_millis(250),
            ..FakeService::default()
        });
        let cooldown = Duration::from_secs(1);
        let mut queue =
            RenderQueue::new(PageRenderer::new(service.clone()), pages(4)).with_cooldown(cooldown);
        queue.run().await.unwrap();

        let times = service.call_times();
        assert_eq!(times.len(), 4);
        for pair in times.windows(2) {
            // start-to-start = latency of the previous call + cool-down
            assert!(pair[1] - pair[0] >= cooldown + Duration::from_millis(250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_call_does_not_start_a_cooldown() {
        let service = Arc::new(FakeService::default());
        service.fail_on("p1");
        let mut queue = RenderQueue::new(PageRenderer::new(service.clone()), pages(2))
            .with_cooldown(Duration::from_secs(5));
        assert!(queue.run().await.is_err());

        service.heal();
        let before = Instant::now();
        queue.resume().await.unwrap();
        let times = service.call_times();
        assert_eq!(times[1], before);
        assert!(times[2] - times[1] >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn call_timeout_halts_the_queue() {
        let service = Arc::new(FakeService {
            latency: Duration::from_secs(30),
            ..FakeService::default()
        });
        let mut queue = RenderQueue::new(PageRenderer::new(service), pages(2))
            .with_call_timeout(Some(Duration::from_secs(10)));
        let err = queue.run().await.unwrap_err();
        assert!(matches!(err, StoryboardError::Render { index: 0, .. }));
        assert_eq!(queue.progress().completed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hifi_frames_are_keyed_by_shot_and_carry_reference() {
        let service = Arc::new(FakeService::default());
        let frames = vec![frame(7), frame(8), frame(7)];
        let mut queue = RenderQueue::new(FrameRenderer::new(service.clone()), frames)
            .with_cooldown(Duration::ZERO);
        let progress = queue.run().await.unwrap();

        assert_eq!(progress.completed, 3);
        let calls = service.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1.as_deref(), Some("data:image/png;base64,QUJD"));
        let shots: Vec<u32> = queue.outputs_in_order().iter().map(|f| f.shot_number).collect();
        assert_eq!(shots, vec![7, 8]);
    }

    #[tokio::test]
    async fn out_of_range_index_is_rejected() {
        let mut queue = RenderQueue::new(PageRenderer::new(FakeService::default()), pages(1));
        assert!(matches!(
            queue.render_item(5).await,
            Err(StoryboardError::PlanningInvariant(_))
        ));
    }
}
