use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("no tax parameters for {jurisdiction} in {year}")]
    MissingTaxParameters { year: i32, jurisdiction: String },
    #[error("benefit calculation failed: {0}")]
    Benefit(String),
}
