/// Scores index-aligned with the model's fixed category order
/// (for example the 52 facial blend-shape weights). Labels are not carried.
pub type ClassificationScores = Vec<f32>;
