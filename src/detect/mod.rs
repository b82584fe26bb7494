//! Normalization, outlier scoring, and the engine that drives them.

pub mod engine;
pub mod normalize;
pub mod score;

pub use engine::{Engine, EngineStats, RequestView};
pub use normalize::Normalizer;
pub use score::{Detection, Nearest, OutlierScorer, ScoreSnapshot, Verdict};
