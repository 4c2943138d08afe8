use thiserror::Error;

/// Pipeline error taxonomy. Per-cell and per-shard failures are recovered
/// locally and surfaced in aggregate; everything else aborts the stage.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error in {stage}: {message}")]
    Configuration {
        stage: &'static str,
        message: String,
    },

    #[error("segmentation error: {0}")]
    Segmentation(String),

    #[error("matching error: {0}")]
    Matching(String),

    #[error("extraction error: {0}")]
    Extraction(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tiff error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("inference error: {0}")]
    Inference(#[from] ort::Error),
}

impl Error {
    pub fn config(stage: &'static str, message: impl Into<String>) -> Self {
        Error::Configuration {
            stage,
            message: message.into(),
        }
    }
}

impl From<zarrs::array::ArrayError> for Error {
    fn from(e: zarrs::array::ArrayError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<zarrs::array::ArrayCreateError> for Error {
    fn from(e: zarrs::array::ArrayCreateError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<zarrs::group::GroupCreateError> for Error {
    fn from(e: zarrs::group::GroupCreateError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<zarrs::storage::StorageError> for Error {
    fn from(e: zarrs::storage::StorageError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<zarrs::filesystem::FilesystemStoreCreateError> for Error {
    fn from(e: zarrs::filesystem::FilesystemStoreCreateError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<ndarray::ShapeError> for Error {
    fn from(e: ndarray::ShapeError) -> Self {
        Error::Segmentation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
