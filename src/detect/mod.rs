mod backend;
pub mod backends;
mod registry;
mod result;
pub mod yolo;

pub use backend::DetectorBackend;
pub use backends::{BlockNumberBackend, FixedRegionPlateBackend, HsvSignBackend};
pub use registry::BackendRegistry;
pub use result::Detection;

#[cfg(feature = "backend-tract")]
pub use backends::YoloPlateBackend;
