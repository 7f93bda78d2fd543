use crate::error::{Result, StoryboardError};
use crate::model::{ParsedScript, Scene, Sequence, Shot, ShotType};
use crate::{logi, logw};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::path::Path;
use tokio::fs;

const UNTITLED: &str = "Untitled";

/// Loosely-typed structure as produced by a text-understanding step.
/// Numbering in a draft is advisory; the structurer assigns its own.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScriptDraft {
    pub title: Option<String>,
    pub scenes: Vec<SceneDraft>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SceneDraft {
    #[serde(alias = "scene_number", deserialize_with = "lenient_number")]
    pub scene_number: Option<u32>,
    #[serde(alias = "heading", alias = "setting")]
    pub location: String,
    #[serde(alias = "scene_description", alias = "description")]
    pub scene_description: String,
    pub shots: Vec<ShotDraft>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShotDraft {
    #[serde(alias = "shot_number", alias = "number", deserialize_with = "lenient_number")]
    pub shot_number: Option<u32>,
    #[serde(alias = "shot_type", alias = "type")]
    pub shot_type: String,
    #[serde(alias = "camera_movement", alias = "camera")]
    pub camera_movement: String,
    pub composition: String,
    pub lighting: String,
    #[serde(alias = "description")]
    pub action: String,
    pub dialogue: Option<String>,
    #[serde(alias = "style_notes", alias = "style")]
    pub style_notes: String,
}

fn lenient_number<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// External text-understanding capability that infers scenes and shots from prose.
#[async_trait]
pub trait ScriptAnalyzer: Send + Sync {
    async fn analyze(&self, text: &str) -> Result<ScriptDraft>;

    fn name(&self) -> &'static str;
}

#[async_trait]
impl<T: ScriptAnalyzer + ?Sized> ScriptAnalyzer for &T {
    async fn analyze(&self, text: &str) -> Result<ScriptDraft> {
        (**self).analyze(text).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

#[async_trait]
impl<T: ScriptAnalyzer + ?Sized> ScriptAnalyzer for Box<T> {
    async fn analyze(&self, text: &str) -> Result<ScriptDraft> {
        (**self).analyze(text).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

pub struct ScriptStructurer<A> {
    analyzer: A,
    fallback_title: Option<String>,
}

impl<A: ScriptAnalyzer> ScriptStructurer<A> {
    pub fn new(analyzer: A) -> Self {
        Self {
            analyzer,
            fallback_title: None,
        }
    }

    /// Title used when the draft carries none.
    pub fn with_fallback_title(mut self, title: impl Into<String>) -> Self {
        self.fallback_title = Some(title.into());
        self
    }

    pub async fn parse(&self, raw_text: &str) -> Result<ParsedScript> {
        if raw_text.trim().is_empty() {
            return Err(StoryboardError::Parse("script text is empty".to_string()));
        }

        logi(format!(
            "Structuring script ({} chars) with {} analyzer...",
            raw_text.len(),
            self.analyzer.name()
        ));
        let mut draft = self.analyzer.analyze(raw_text).await?;
        let has_title = draft
            .title
            .as_deref()
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false);
        if !has_title {
            draft.title = self.fallback_title.clone();
        }

        let script = structure_draft(draft)?;
        logi(format!(
            "Script structured: {} scenes, {} shots",
            script.total_scenes,
            script.total_shots()
        ));
        Ok(script)
    }
}

/// Validates a draft and assigns scene and shot numbers in document order.
/// The draft is consumed; nothing is returned unless every scene and shot is usable.
pub fn structure_draft(draft: ScriptDraft) -> Result<ParsedScript> {
    if draft.scenes.is_empty() {
        return Err(StoryboardError::Parse(
            "structuring produced zero scenes".to_string(),
        ));
    }

    let mut scene_seq = Sequence::default();
    let mut shot_seq = Sequence::default();
    let mut renumbered = 0usize;
    let mut scenes = Vec::with_capacity(draft.scenes.len());

    for (scene_pos, scene_draft) in draft.scenes.into_iter().enumerate() {
        let location = scene_draft.location.trim().to_string();
        if scene_draft.shots.is_empty() {
            return Err(StoryboardError::Parse(format!(
                "scene {} ({}) has no shots",
                scene_pos + 1,
                if location.is_empty() { "no location" } else { location.as_str() }
            )));
        }

        let scene_number = scene_seq.next_value();
        if scene_draft.scene_number.is_some_and(|n| n != scene_number) {
            renumbered += 1;
        }

        let mut shots = Vec::with_capacity(scene_draft.shots.len());
        for (shot_pos, shot_draft) in scene_draft.shots.into_iter().enumerate() {
            let mut action = shot_draft.action.trim().to_string();
            let composition = shot_draft.composition.trim().to_string();
            if action.is_empty() {
                if composition.is_empty() {
                    return Err(StoryboardError::Parse(format!(
                        "shot {} of scene {} has neither action nor composition",
                        shot_pos + 1,
                        scene_number
                    )));
                }
                action = composition.clone();
            }

            let shot_number = shot_seq.next_value();
            if shot_draft.shot_number.is_some_and(|n| n != shot_number) {
                renumbered += 1;
            }

            shots.push(Shot {
                shot_number,
                shot_type: ShotType::parse(&shot_draft.shot_type),
                camera_movement: non_empty_or(&shot_draft.camera_movement, "static"),
                composition,
                lighting: shot_draft.lighting.trim().to_string(),
                action,
                dialogue: shot_draft
                    .dialogue
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty()),
                style_notes: shot_draft.style_notes.trim().to_string(),
            });
        }

        let scene_description = match scene_draft.scene_description.trim() {
            "" => location.clone(),
            desc => desc.to_string(),
        };
        scenes.push(Scene {
            scene_number,
            location,
            scene_description,
            shots,
        });
    }

    if renumbered > 0 {
        logw(format!(
            "Draft numbering disagreed with document order in {} places; renumbered.",
            renumbered
        ));
    }

    let title = draft
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| UNTITLED.to_string());

    Ok(ParsedScript {
        title,
        total_scenes: scenes.len(),
        scenes,
    })
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    match value.trim() {
        "" => fallback.to_string(),
        v => v.to_string(),
    }
}

/// Parses a model reply that should contain a single JSON object, tolerating
/// Markdown fences and chatter around it.
pub fn draft_from_model_text(text: &str) -> Result<ScriptDraft> {
    let start = text.find('{');
    let end = text.rfind('}');
    let body = match (start, end) {
        (Some(s), Some(e)) if e > s => &text[s..=e],
        _ => {
            return Err(StoryboardError::Parse(
                "model reply contains no JSON object".to_string(),
            ));
        }
    };
    serde_json::from_str(body)
        .map_err(|e| StoryboardError::Parse(format!("model reply is not a script draft: {}", e)))
}

/// Offline analyzer for screenplay-formatted text.
///
/// Scene headings (`INT.`, `EXT.`, `INT./EXT.`, `I/E`) open scenes, each action
/// paragraph becomes a shot, and a character cue attaches dialogue to the
/// shot before it.
#[derive(Debug, Clone, Default)]
pub struct HeuristicAnalyzer;

#[async_trait]
impl ScriptAnalyzer for HeuristicAnalyzer {
    async fn analyze(&self, text: &str) -> Result<ScriptDraft> {
        Ok(heuristic_draft(text))
    }

    fn name(&self) -> &'static str {
        "heuristic"
    }
}

pub fn heuristic_draft(text: &str) -> ScriptDraft {
    let mut draft = ScriptDraft::default();
    let mut current: Option<SceneDraft> = None;
    let mut lighting = String::new();

    for paragraph in paragraphs(text) {
        let mut lines: &[&str] = &paragraph;

        if let Some(title) = lines[0].trim().strip_prefix("Title:") {
            if draft.title.is_none() {
                draft.title = Some(title.trim().to_string());
            }
            lines = &lines[1..];
            if lines.is_empty() {
                continue;
            }
        }

        if let Some((location, time_of_day)) = parse_scene_heading(lines[0]) {
            if let Some(scene) = current.take() {
                draft.scenes.push(scene);
            }
            lighting = lighting_for(&time_of_day);
            current = Some(SceneDraft {
                location,
                ..SceneDraft::default()
            });
            lines = &lines[1..];
            if lines.is_empty() {
                continue;
            }
        }

        if is_transition(lines[0]) {
            continue;
        }

        let scene = current.get_or_insert_with(|| SceneDraft {
            location: "Unspecified location".to_string(),
            ..SceneDraft::default()
        });

        if lines.len() > 1 && is_character_cue(lines[0]) {
            let speaker = strip_extension(lines[0].trim());
            let spoken = lines[1..]
                .iter()
                .map(|l| l.trim())
                .filter(|l| !(l.starts_with('(') && l.ends_with(')')))
                .collect::<Vec<_>>()
                .join(" ");
            let line = format!("{}: {}", speaker, spoken);
            match scene.shots.last_mut() {
                Some(shot) => {
                    shot.dialogue = Some(match shot.dialogue.take() {
                        Some(prev) => format!("{} / {}", prev, line),
                        None => line,
                    });
                }
                None => scene.shots.push(ShotDraft {
                    shot_type: "medium".to_string(),
                    action: format!("{} speaks.", speaker),
                    lighting: lighting.clone(),
                    dialogue: Some(line),
                    ..ShotDraft::default()
                }),
            }
            continue;
        }

        let action_text = lines
            .iter()
            .map(|l| l.trim())
            .collect::<Vec<_>>()
            .join(" ");
        let (shot_type, action) = split_shot_keyword(&action_text);
        let shot_type = shot_type.unwrap_or_else(|| {
            if scene.shots.is_empty() { "wide" } else { "medium" }.to_string()
        });
        if scene.scene_description.is_empty() {
            scene.scene_description = action.clone();
        }
        scene.shots.push(ShotDraft {
            shot_type,
            camera_movement: camera_movement_for(&action).to_string(),
            lighting: lighting.clone(),
            action,
            ..ShotDraft::default()
        });
    }

    if let Some(scene) = current.take() {
        draft.scenes.push(scene);
    }
    draft.scenes.retain(|s| !s.shots.is_empty());
    draft
}

fn paragraphs(text: &str) -> Vec<Vec<&str>> {
    let mut out = Vec::new();
    let mut cur: Vec<&str> = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if !cur.is_empty() {
                out.push(std::mem::take(&mut cur));
            }
            continue;
        }
        // A heading always starts a new paragraph, even without a blank line.
        if !cur.is_empty() && parse_scene_heading(trimmed).is_some() {
            out.push(std::mem::take(&mut cur));
        }
        cur.push(trimmed);
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

fn heading_regex() -> &'static Regex {
    static HEADING_RE: OnceCell<Regex> = OnceCell::new();
    HEADING_RE.get_or_init(|| {
        Regex::new(r"^(?:\d+\s+)?(?:INT\./EXT\.|EXT\./INT\.|INT\.|EXT\.|I/E\.?)\s*(.+?)\s*$")
            .unwrap_or_else(|e| panic!("heading regex is invalid: {e}"))
    })
}

fn shot_keyword_regex() -> &'static Regex {
    static SHOT_RE: OnceCell<Regex> = OnceCell::new();
    SHOT_RE.get_or_init(|| {
        Regex::new(
            r"^(EXTREME CLOSE[- ]UP|CLOSE[- ]UP|CLOSE ON|ANGLE ON|EXTREME WIDE|WIDE SHOT|WIDE|ESTABLISHING SHOT|ESTABLISHING|INSERT|POV|OVER THE SHOULDER|TWO[- ]SHOT|MEDIUM SHOT)\b[\s:\-]*(?:ON\b)?[\s:\-]*",
        )
        .unwrap_or_else(|e| panic!("shot keyword regex is invalid: {e}"))
    })
}

/// Returns `(location, time_of_day)` for a scene heading line.
fn parse_scene_heading(line: &str) -> Option<(String, String)> {
    let caps = heading_regex().captures(line.trim())?;
    let rest = caps.get(1)?.as_str();
    match rest.rsplit_once(" - ") {
        Some((loc, tod)) => Some((loc.trim().to_string(), tod.trim().to_string())),
        None => Some((rest.trim().to_string(), String::new())),
    }
}

fn lighting_for(time_of_day: &str) -> String {
    let tod = time_of_day.to_ascii_uppercase();
    if tod.contains("NIGHT") {
        "night, low-key".to_string()
    } else if tod.contains("DAWN") || tod.contains("SUNRISE") {
        "dawn light".to_string()
    } else if tod.contains("DUSK") || tod.contains("SUNSET") || tod.contains("EVENING") {
        "dusk light".to_string()
    } else if tod.contains("DAY") || tod.contains("MORNING") || tod.contains("AFTERNOON") {
        "daylight".to_string()
    } else {
        String::new()
    }
}

fn is_transition(line: &str) -> bool {
    let t = line.trim();
    t == "FADE IN:"
        || t.starts_with("FADE OUT")
        || t.starts_with("FADE TO")
        || (t.ends_with("TO:") && t == t.to_ascii_uppercase())
}

fn is_character_cue(line: &str) -> bool {
    let t = line.trim();
    if t.is_empty() || t.len() > 40 || parse_scene_heading(t).is_some() {
        return false;
    }
    let name = strip_extension(t);
    !name.is_empty()
        && name.chars().any(|c| c.is_ascii_alphabetic())
        && name
            .chars()
            .all(|c| c.is_ascii_uppercase() || c == ' ' || c == '.' || c == '\'' || c == '-')
}

fn strip_extension(cue: &str) -> String {
    match cue.find('(') {
        Some(i) => cue[..i].trim().to_string(),
        None => cue.trim().to_string(),
    }
}

fn split_shot_keyword(action: &str) -> (Option<String>, String) {
    let re = shot_keyword_regex();
    let Some(m) = re.find(action) else {
        return (None, action.to_string());
    };
    let keyword = re
        .captures(action)
        .and_then(|c| c.get(1))
        .map(|k| k.as_str().to_ascii_lowercase())
        .unwrap_or_default();
    let shot_type = match keyword.as_str() {
        "close on" | "angle on" => "close-up".to_string(),
        "wide shot" => "wide".to_string(),
        "establishing shot" => "establishing".to_string(),
        "medium shot" => "medium".to_string(),
        other => other.to_string(),
    };
    let rest = action[m.end()..].trim();
    let rest = if rest.is_empty() { action } else { rest };
    (Some(shot_type), rest.to_string())
}

fn camera_movement_for(action: &str) -> &'static str {
    let lower = action.to_ascii_lowercase();
    if lower.contains("push in") || lower.contains("pushes in") {
        "push in"
    } else if lower.contains("dolly") {
        "dolly"
    } else if lower.contains("track") {
        "tracking"
    } else if lower.contains("pan") && lower.contains("camera") {
        "pan"
    } else if lower.contains("zoom") {
        "zoom"
    } else if lower.contains("crane") {
        "crane"
    } else if lower.contains("handheld") {
        "handheld"
    } else {
        "static"
    }
}

/// Reads an uploaded script document as plain text. HTML is stripped to text;
/// anything else is taken as UTF-8.
pub async fn load_script_text(path: &Path) -> Result<String> {
    let bytes = fs::read(path).await?;
    let text = String::from_utf8_lossy(&bytes).into_owned();

    let is_html = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("html") || e.eq_ignore_ascii_case("htm"))
        .unwrap_or(false);

    Ok(if is_html { html_to_text_basic(&text) } else { text })
}

pub fn html_to_text_basic(html: &str) -> String {
    let mut out = String::new();
    let mut rest = html;

    while let Some(ch) = rest.chars().next() {
        if ch == '<' {
            let (tag, tag_end) = match rest.find('>') {
                Some(gt) => (&rest[1..gt], gt + 1),
                None => (&rest[1..], rest.len()),
            };
            let tag_lower = tag.trim().to_ascii_lowercase();
            let closing = tag_lower.starts_with('/');
            let name = tag_lower
                .trim_start_matches('/')
                .split(|c: char| c.is_whitespace() || c == '/')
                .next()
                .unwrap_or_default();
            if name == "br" || (closing && name == "p") {
                out.push('\n');
            }
            rest = &rest[tag_end..];
            continue;
        }

        if ch == '&' {
            let entities = [
                ("&nbsp;", ' '),
                ("&amp;", '&'),
                ("&lt;", '<'),
                ("&gt;", '>'),
                ("&quot;", '"'),
                ("&#39;", '\''),
            ];
            if let Some((ent, rep)) = entities.iter().find(|(ent, _)| rest.starts_with(ent)) {
                out.push(*rep);
                rest = &rest[ent.len()..];
                continue;
            }
        }

        out.push(ch);
        rest = &rest[ch.len_utf8()..];
    }

    out
}
