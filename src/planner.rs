use crate::error::{Result, StoryboardError};
use crate::grid::GridGeometry;
use crate::logw;
use crate::model::{PageSpec, ParsedScript, Sequence, Shot};

pub const PAGE_CAPACITY: usize = 6;

const FRAME_SEPARATOR: &str = " | ";

/// Splits scenes into fixed-capacity pages and writes one sketch prompt per page.
#[derive(Debug, Clone)]
pub struct PagePlanner {
    capacity: usize,
    geometry: GridGeometry,
}

impl PagePlanner {
    pub fn new(capacity: usize, geometry: GridGeometry) -> Result<Self> {
        if capacity == 0 || capacity > geometry.cells() {
            return Err(StoryboardError::Config(format!(
                "page capacity {} must be between 1 and the {} panels of a {}x{} grid",
                capacity,
                geometry.cells(),
                geometry.cols,
                geometry.rows
            )));
        }
        Ok(Self { capacity, geometry })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn geometry(&self) -> GridGeometry {
        self.geometry
    }

    pub fn plan(&self, script: &ParsedScript) -> Result<Vec<PageSpec>> {
        let mut page_numbers = Sequence::default();
        self.plan_with(script, &mut page_numbers)
    }

    /// Plans with a caller-supplied page counter, which keeps counting across scenes.
    pub fn plan_with(
        &self,
        script: &ParsedScript,
        page_numbers: &mut Sequence,
    ) -> Result<Vec<PageSpec>> {
        let mut pages = Vec::with_capacity(script.total_shots().div_ceil(self.capacity));

        for scene in &script.scenes {
            for chunk in scene.shots.chunks(self.capacity) {
                let page_number = page_numbers.next_value();
                if self.geometry.hint_mismatch(chunk.len()) {
                    logw(format!(
                        "Page {} has {} panel(s): its prompt asks for a 1x2 or 2x1 layout but it will be cropped as {}x{}",
                        page_number,
                        chunk.len(),
                        self.geometry.cols,
                        self.geometry.rows
                    ));
                }
                pages.push(PageSpec {
                    page_number,
                    scene_number: scene.scene_number,
                    scene_description: scene.scene_description.clone(),
                    shots: chunk.to_vec(),
                    prompt: page_prompt(&scene.scene_description, chunk, self.geometry),
                });
            }
        }

        verify_plan(script, &pages, self.capacity)?;
        Ok(pages)
    }
}

impl Default for PagePlanner {
    fn default() -> Self {
        Self {
            capacity: PAGE_CAPACITY,
            geometry: GridGeometry::STORYBOARD,
        }
    }
}

/// Checks that pages cover the script exactly once, in order, one scene per
/// page, with contiguous page numbers and 1..=capacity shots each.
pub fn verify_plan(script: &ParsedScript, pages: &[PageSpec], capacity: usize) -> Result<()> {
    let violation = |msg: String| Err(StoryboardError::PlanningInvariant(msg));

    let mut expected = script
        .scenes
        .iter()
        .flat_map(|scene| scene.shots.iter().map(move |shot| (scene.scene_number, shot.shot_number)));

    for (pos, page) in pages.iter().enumerate() {
        if pos > 0 && page.page_number != pages[pos - 1].page_number + 1 {
            return violation(format!(
                "page numbers jump from {} to {}",
                pages[pos - 1].page_number,
                page.page_number
            ));
        }
        if page.shots.is_empty() || page.shots.len() > capacity {
            return violation(format!(
                "page {} holds {} shots (capacity {})",
                page.page_number,
                page.shots.len(),
                capacity
            ));
        }
        for shot in &page.shots {
            match expected.next() {
                Some((scene_number, shot_number))
                    if scene_number == page.scene_number && shot_number == shot.shot_number => {}
                Some((scene_number, shot_number)) => {
                    return violation(format!(
                        "page {} (scene {}) has shot {} where scene {} shot {} was expected",
                        page.page_number, page.scene_number, shot.shot_number, scene_number, shot_number
                    ));
                }
                None => {
                    return violation(format!(
                        "page {} has extra shot {}",
                        page.page_number, shot.shot_number
                    ));
                }
            }
        }
    }

    if let Some((_, shot_number)) = expected.next() {
        return violation(format!("shot {} is not on any page", shot_number));
    }
    Ok(())
}

/// "Frame k: composition. action. shot-type shot."
fn frame_fragment(k: usize, shot: &Shot) -> String {
    let mut parts = Vec::with_capacity(3);
    for text in [shot.composition.as_str(), shot.action.as_str()] {
        let text = text.trim().trim_end_matches('.');
        if !text.is_empty() {
            parts.push(format!("{}.", text));
        }
    }
    parts.push(format!("{} shot.", shot.shot_type));
    format!("Frame {}: {}", k, parts.join(" "))
}

pub fn page_prompt(scene_description: &str, shots: &[Shot], geometry: GridGeometry) -> String {
    let frames = shots
        .iter()
        .enumerate()
        .map(|(i, shot)| frame_fragment(i + 1, shot))
        .collect::<Vec<_>>()
        .join(FRAME_SEPARATOR);
    let panels = match shots.len() {
        1 => "1 panel".to_string(),
        n => format!("{} panels", n),
    };

    format!(
        "Hand-drawn pencil storyboard sketch page with {} in a {}. Scene: {}. {}. \
         Rough graphite linework on white paper, black and white, clear panel borders, \
         panels read left to right then top to bottom, professional film storyboard, \
         clean composition, high quality.",
        panels,
        geometry.layout_hint(shots.len()),
        scene_description.trim().trim_end_matches('.'),
        frames.trim_end_matches('.')
    )
}

/// Prompt for one high-fidelity still, conditioned on the shot's cropped sketch.
pub fn hifi_prompt(shot: &Shot) -> String {
    let mut prompt = format!(
        "Cinematic high-fidelity film still, {} shot. {}.",
        shot.shot_type,
        shot.action.trim().trim_end_matches('.')
    );
    let extras = [
        ("Composition", shot.composition.as_str()),
        ("Camera", shot.camera_movement.as_str()),
        ("Lighting", shot.lighting.as_str()),
        ("Style", shot.style_notes.as_str()),
    ];
    for (label, value) in extras {
        let value = value.trim().trim_end_matches('.');
        if !value.is_empty() {
            prompt.push_str(&format!(" {}: {}.", label, value));
        }
    }
    prompt.push_str(
        " Follow the framing and blocking of the reference sketch exactly. \
         Photorealistic, detailed, 35mm film look.",
    );
    prompt
}
