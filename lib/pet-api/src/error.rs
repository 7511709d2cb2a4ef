use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid networking config: {0}")]
    InvalidNetworkingConfig(String),

    #[error("Networking config parse error: {0}")]
    IniError(#[from] ini::ParseError),

    #[error("Allocation table error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Allocation table encoding error: {0}")]
    EncodingError(String),
}
