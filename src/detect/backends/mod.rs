mod fixed;
mod motion;
#[cfg(feature = "backend-tract")]
mod tract;

pub use fixed::StaticDetector;
pub use motion::MotionDetector;
#[cfg(feature = "backend-tract")]
pub use tract::TractDetector;
