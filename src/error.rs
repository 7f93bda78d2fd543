use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoryboardError {
    /// The structuring step produced no usable Script/Scene/Shot tree.
    #[error("Script parse failure: {0}")]
    Parse(String),

    /// A broken page/panel/shot correspondence. Always fatal to the run.
    #[error("Planning invariant violated: {0}")]
    PlanningInvariant(String),

    /// One remote generation call failed. The capability itself is not
    /// aware of queue positions; the queue wraps this into `Render`.
    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Render failed at item {index} ({key}): {cause}")]
    Render {
        index: usize,
        key: String,
        cause: String,
    },

    #[error("Frame extraction failed for page {page_number}: {cause}")]
    Extraction { page_number: u32, cause: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl StoryboardError {
    /// Errors a caller may recover from by retrying or skipping the item.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StoryboardError::Render { .. }
                | StoryboardError::Extraction { .. }
                | StoryboardError::Generation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StoryboardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_violations_are_not_recoverable() {
        assert!(!StoryboardError::PlanningInvariant("x".into()).is_recoverable());
        assert!(!StoryboardError::Parse("x".into()).is_recoverable());
        let render = StoryboardError::Render {
            index: 3,
            key: "page 4".into(),
            cause: "HTTP 500".into(),
        };
        assert!(render.is_recoverable());
        assert_eq!(
            render.to_string(),
            "Render failed at item 3 (page 4): HTTP 500"
        );
    }
}
