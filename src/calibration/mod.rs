pub mod annotation;
pub mod locks;
pub mod pipeline;
pub mod points;
pub mod snapshot;

pub use annotation::{AnnotationService, LabelFont};
pub use locks::{FrameGuard, FrameKey, LockRegistry};
pub use pipeline::{CalibrationPipeline, SavedCalibration, UploadedSnapshot};
pub use points::CalibrationPoints;
