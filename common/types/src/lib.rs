pub mod category;
pub mod content;
pub mod fingerprint;
pub mod headline;
pub mod sentiment;

pub use category::Category;
pub use content::{ContentMetadata, RawContent};
pub use headline::{Headline, HeadlineMeta};
pub use sentiment::{SentimentAnalysisInput, SentimentAnalysisResult, SentimentLabel};
