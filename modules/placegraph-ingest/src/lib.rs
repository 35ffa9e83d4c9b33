pub mod extractor;
pub mod pipeline;
pub mod weight;

pub use extractor::{ExtractedAttraction, Extractor, TextChunk};
pub use pipeline::{IngestStats, Pipeline};
