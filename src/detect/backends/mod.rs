pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::StubFaceDetector;

#[cfg(feature = "backend-tract")]
pub use tract::TractFaceDetector;
