mod backend;
mod backends;
mod classify;
mod result;

pub use backend::DetectorBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use backends::{build_backend, StubBackend};
pub use classify::{Category, CategoryClassifier};
pub use result::{BoundingBox, Detection};
