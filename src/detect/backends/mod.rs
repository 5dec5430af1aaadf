pub mod block_numbers;
pub mod fallback;
pub mod signs;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use block_numbers::BlockNumberBackend;
pub use fallback::FixedRegionPlateBackend;
pub use signs::HsvSignBackend;

#[cfg(feature = "backend-tract")]
pub use tract::YoloPlateBackend;
