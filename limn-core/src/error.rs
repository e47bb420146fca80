/// Failure taxonomy for the whole pipeline.
///
/// `Configuration` is fatal at startup and never retried; `Extraction` and
/// `InvalidRequest` are caller errors; `Inference` covers everything the
/// underlying model stack can throw and is surfaced without retry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The chat model answered without a double-quoted description.
    #[error("no quoted description in model output")]
    Extraction,

    #[error("inference failed: {0}")]
    Inference(String),
}

impl From<candle_core::Error> for Error {
    fn from(err: candle_core::Error) -> Self {
        Error::Inference(err.to_string())
    }
}

impl From<tokenizers::Error> for Error {
    fn from(err: tokenizers::Error) -> Self {
        Error::Inference(err.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Inference(err.to_string())
    }
}
