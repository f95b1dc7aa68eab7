//! Face-region detection backends.
//!
//! The face sampler only needs "image in, relative boxes out". Backends filter
//! out detections below their own minimum confidence, so callers never see them.

mod backend;
mod backends;
mod result;

pub use backend::{build_face_detector, FaceBackendKind, FaceDetector};
pub use backends::StubFaceDetector;
#[cfg(feature = "backend-tract")]
pub use backends::TractFaceDetector;
pub use result::{FaceDetection, RelativeBox};
