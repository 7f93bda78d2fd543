pub mod generation;
pub mod openai;

pub use generation::{
    GeneratedMedia, GenerationRequest, GenerationService, HttpImageSource, ImageSource, MediaStore,
};
