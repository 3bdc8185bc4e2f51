//! Output records handed to session callers, the engine-native payloads they
//! are built from, and the marshaler converting one into the other.
//!
//! - `native`: payload shapes as the graph engine emits them.
//! - `landmark`, `detection`, `classification`: caller-owned records.
//! - `marshal`: pure deep-copy conversions between the two.

pub mod classification;
pub mod detection;
pub mod landmark;
pub mod marshal;
pub mod native;

pub use classification::ClassificationScores;
pub use detection::{
    AssociatedDetection, BinaryMask, BoundingBox, DetectionRecord, LocationData, LocationFormat,
    MaskInterval, Region, RelativeBoundingBox, RelativeKeypoint,
};
pub use landmark::{Landmark, LandmarkList, LandmarkSet};
pub use marshal::MarshalError;
