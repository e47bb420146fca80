pub mod cache;
pub mod chat;
pub mod device;
pub mod diffusion;
pub mod portrait;

mod error;

pub use cache::WeightsCache;
pub use device::DeviceMap;
pub use error::Error;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

/// Body of `POST /v1/images/generations`.
///
/// Validated at the boundary before any model is touched; the services
/// themselves assume well-formed parameters.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub samples: usize,
    pub steps: usize,
    pub batch_size: usize,
}

impl GenerationRequest {
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(Error::InvalidRequest("prompt must not be empty".into()));
        }
        if self.samples == 0 {
            return Err(Error::InvalidRequest("samples must be at least 1".into()));
        }
        if self.steps == 0 {
            return Err(Error::InvalidRequest("steps must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidRequest("batch_size must be at least 1".into()));
        }
        Ok(())
    }
}

/// One diffusion round: `batch_size` samples of the same prompt, in the order
/// the pipeline produced them.
pub trait ImageModelLike: Send + Sync {
    fn run(&self, prompt: &str, steps: usize, batch_size: usize) -> Result<Vec<DynamicImage>>;
}

/// Batched chat generation: one continuation per question, in input order.
pub trait ChatModelLike: Send + Sync {
    fn run(&self, questions: &[String]) -> Result<Vec<String>>;
}

/// Builds a model from the provisioned weight cache. Loading is strictly
/// cache-only; a missing snapshot fails with a configuration error.
pub trait Loader {
    type Model;

    fn load(weights: &WeightsCache, device_map: DeviceMap) -> Result<Self::Model>
    where
        Self: Sized;
}

#[cfg(test)]
mod tests {
    use super::GenerationRequest;
    use crate::Error;

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "a cat".to_string(),
            samples: 2,
            steps: 10,
            batch_size: 3,
        }
    }

    #[test]
    fn valid_request_passes() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn zero_fields_are_rejected() {
        for broken in [
            GenerationRequest { samples: 0, ..request() },
            GenerationRequest { steps: 0, ..request() },
            GenerationRequest { batch_size: 0, ..request() },
            GenerationRequest { prompt: "  ".to_string(), ..request() },
        ] {
            assert!(matches!(broken.validate(), Err(Error::InvalidRequest(_))));
        }
    }

    #[test]
    fn request_deserializes_from_endpoint_body() {
        let req: GenerationRequest =
            serde_json::from_str(r#"{"prompt":"a cat","samples":2,"steps":10,"batch_size":3}"#)
                .unwrap();
        assert_eq!(req, request());
    }
}
