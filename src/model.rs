use serde::{Deserialize, Serialize};
use std::fmt;

/// Camera setup category of a shot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ShotType {
    ExtremeWide,
    Wide,
    Establishing,
    #[default]
    Medium,
    MediumCloseUp,
    CloseUp,
    ExtremeCloseUp,
    OverTheShoulder,
    PointOfView,
    TwoShot,
    Insert,
    Other(String),
}

impl ShotType {
    pub fn label(&self) -> &str {
        match self {
            ShotType::ExtremeWide => "extreme wide",
            ShotType::Wide => "wide",
            ShotType::Establishing => "establishing",
            ShotType::Medium => "medium",
            ShotType::MediumCloseUp => "medium close-up",
            ShotType::CloseUp => "close-up",
            ShotType::ExtremeCloseUp => "extreme close-up",
            ShotType::OverTheShoulder => "over-the-shoulder",
            ShotType::PointOfView => "point-of-view",
            ShotType::TwoShot => "two-shot",
            ShotType::Insert => "insert",
            ShotType::Other(s) => s.as_str(),
        }
    }

    /// Lenient parse of free-form labels ("CU", "Close Up", "close-up shot", ...).
    pub fn parse(raw: &str) -> Self {
        let norm: String = raw
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == '-' || c == '_' { ' ' } else { c })
            .collect();
        let norm = norm.trim_end_matches(" shot").trim().to_string();

        match norm.as_str() {
            "ews" | "extreme wide" | "extreme long" | "els" => ShotType::ExtremeWide,
            "ws" | "wide" | "long" | "ls" | "full" | "fs" => ShotType::Wide,
            "establishing" | "est" => ShotType::Establishing,
            "ms" | "medium" | "mid" | "medium wide" | "cowboy" => ShotType::Medium,
            "mcu" | "medium close up" | "medium closeup" => ShotType::MediumCloseUp,
            "cu" | "close up" | "closeup" | "close" => ShotType::CloseUp,
            "ecu" | "extreme close up" | "extreme closeup" => ShotType::ExtremeCloseUp,
            "ots" | "over the shoulder" => ShotType::OverTheShoulder,
            "pov" | "point of view" => ShotType::PointOfView,
            "two" | "2 shot" | "two shot" => ShotType::TwoShot,
            "insert" | "detail" => ShotType::Insert,
            "" => ShotType::Medium,
            _ => ShotType::Other(raw.trim().to_string()),
        }
    }
}

impl From<String> for ShotType {
    fn from(value: String) -> Self {
        ShotType::parse(&value)
    }
}

impl From<ShotType> for String {
    fn from(value: ShotType) -> Self {
        value.label().to_string()
    }
}

impl fmt::Display for ShotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shot {
    /// Global, strictly increasing across the whole script.
    pub shot_number: u32,
    pub shot_type: ShotType,
    pub camera_movement: String,
    pub composition: String,
    pub lighting: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialogue: Option<String>,
    pub style_notes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub scene_number: u32,
    pub location: String,
    pub scene_description: String,
    /// Script order. Panel N of a page is the Nth shot of its slice of this list.
    pub shots: Vec<Shot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedScript {
    pub title: String,
    pub total_scenes: usize,
    pub scenes: Vec<Scene>,
}

impl ParsedScript {
    pub fn shots(&self) -> impl Iterator<Item = &Shot> {
        self.scenes.iter().flat_map(|s| s.shots.iter())
    }

    pub fn total_shots(&self) -> usize {
        self.scenes.iter().map(|s| s.shots.len()).sum()
    }

    pub fn find_shot(&self, shot_number: u32) -> Option<&Shot> {
        self.shots().find(|s| s.shot_number == shot_number)
    }
}

/// One planned storyboard page. Disposable planning state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSpec {
    pub page_number: u32,
    pub scene_number: u32,
    pub scene_description: String,
    pub shots: Vec<Shot>,
    pub prompt: String,
}

impl PageSpec {
    pub fn shot_numbers(&self) -> Vec<u32> {
        self.shots.iter().map(|s| s.shot_number).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedPage {
    pub page_number: u32,
    pub scene_number: u32,
    pub image_url: String,
    /// Index i holds the shot drawn in grid panel i.
    pub shots_included: Vec<u32>,
    pub generation_prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CroppedFrame {
    pub frame_index: usize,
    pub page_number: u32,
    pub shot_number: u32,
    /// PNG bytes, standard base64 without a data-URL prefix.
    pub base64: String,
    pub shot_data: Shot,
}

impl CroppedFrame {
    pub fn data_url(&self) -> String {
        format!("data:image/png;base64,{}", self.base64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HiFiFrame {
    pub shot_number: u32,
    pub image_url: String,
    pub generation_prompt: String,
}

/// Explicit monotonic counter handed through structuring/planning code.
#[derive(Debug, Clone)]
pub struct Sequence {
    next: u32,
}

impl Sequence {
    pub fn starting_at(first: u32) -> Self {
        Self { next: first }
    }

    pub fn next_value(&mut self) -> u32 {
        let value = self.next;
        self.next += 1;
        value
    }

    pub fn peek(&self) -> u32 {
        self.next
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shot_type_parses_common_abbreviations() {
        assert_eq!(ShotType::parse("CU"), ShotType::CloseUp);
        assert_eq!(ShotType::parse("Close-Up Shot"), ShotType::CloseUp);
        assert_eq!(ShotType::parse("extreme_close_up"), ShotType::ExtremeCloseUp);
        assert_eq!(ShotType::parse("POV"), ShotType::PointOfView);
        assert_eq!(
            ShotType::parse("Dutch angle"),
            ShotType::Other("Dutch angle".to_string())
        );
    }

    #[test]
    fn shot_serializes_with_camel_case_and_label() {
        let shot = Shot {
            shot_number: 7,
            shot_type: ShotType::Wide,
            camera_movement: "static".into(),
            composition: "rule of thirds".into(),
            lighting: "dusk".into(),
            action: "A car pulls up".into(),
            dialogue: None,
            style_notes: String::new(),
        };
        let json = serde_json::to_value(&shot).unwrap();
        assert_eq!(json["shotNumber"], 7);
        assert_eq!(json["shotType"], "wide");
        assert!(json.get("dialogue").is_none());

        let back: Shot = serde_json::from_value(json).unwrap();
        assert_eq!(back, shot);
    }

    #[test]
    fn sequence_counts_up_from_start() {
        let mut seq = Sequence::default();
        assert_eq!(seq.next_value(), 1);
        assert_eq!(seq.next_value(), 2);
        assert_eq!(seq.peek(), 3);
    }
}
