pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::StubBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;

use anyhow::{anyhow, Result};

use crate::config::DetectionSettings;
use crate::detect::backend::DetectorBackend;

/// Construct and warm up the configured detector backend.
pub fn build_backend(settings: &DetectionSettings) -> Result<Box<dyn DetectorBackend>> {
    let mut backend: Box<dyn DetectorBackend> = match settings.backend.as_str() {
        "stub" => Box::new(StubBackend::new()),
        #[cfg(feature = "backend-tract")]
        "tract" => {
            let model_path = settings
                .model_path
                .as_ref()
                .ok_or_else(|| anyhow!("tract backend requires detection.model_path"))?;
            Box::new(
                TractBackend::new(
                    model_path,
                    settings.input_size,
                    settings.input_size,
                    settings.class_names.clone(),
                )?
                .with_threshold(settings.confidence_threshold),
            )
        }
        #[cfg(not(feature = "backend-tract"))]
        "tract" => return Err(anyhow!("tract backend requires the backend-tract feature")),
        other => return Err(anyhow!("unknown detector backend '{}'", other)),
    };
    backend.warm_up()?;
    log::info!("detector backend '{}' ready", backend.name());
    Ok(backend)
}
