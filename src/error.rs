use thiserror::Error;

#[derive(Error, Debug)]
pub enum OccuError {
    #[error("Invalid run configuration: {0}")]
    Config(String),
    #[error("Dimension mismatch: {0}")]
    Shape(String),
    #[error("Invalid survey data: {0}")]
    Data(String),
    #[error("Non-finite value for {parameter} in chain {chain} at iteration {iteration}")]
    NonFinite {
        chain: usize,
        iteration: usize,
        parameter: String,
    },
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),
    #[error("Diagnostics unavailable: {0}")]
    Diagnostics(String),
    #[error("Sampling error: {0}")]
    Sampling(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, OccuError>;

impl From<ndarray::ShapeError> for OccuError {
    fn from(e: ndarray::ShapeError) -> Self {
        Self::Shape(e.to_string())
    }
}
