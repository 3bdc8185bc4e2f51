//! Payload shapes as emitted by the graph engine.
//!
//! These follow the engine's message layout: repeated fields may disagree in
//! length and optional sub-messages may be missing. They are owned by the
//! engine's packet and must be marshaled before the caller keeps them.

use serde::{Deserialize, Serialize};

use crate::detection::{
    AssociatedDetection, BinaryMask, BoundingBox, LocationFormat, RelativeBoundingBox,
    RelativeKeypoint,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeLandmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub visibility: f32,
    pub presence: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeLandmarkList {
    pub landmark: Vec<NativeLandmark>,
}

impl NativeLandmarkList {
    pub fn len(&self) -> usize {
        self.landmark.len()
    }

    pub fn is_empty(&self) -> bool {
        self.landmark.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeLocationData {
    pub format: LocationFormat,
    pub bounding_box: Option<BoundingBox>,
    pub relative_bounding_box: Option<RelativeBoundingBox>,
    pub mask: Option<BinaryMask>,
    pub relative_keypoints: Vec<RelativeKeypoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeDetection {
    pub label: Vec<String>,
    pub label_id: Vec<i32>,
    pub score: Vec<f32>,
    pub location_data: Option<NativeLocationData>,
    pub feature_tag: String,
    pub track_id: String,
    pub detection_id: i64,
    pub associated_detections: Vec<AssociatedDetection>,
    pub display_name: Vec<String>,
    pub timestamp_usec: i64,
}

impl NativeDetection {
    /// Number of categories described by any of the per-category fields.
    pub fn category_count(&self) -> usize {
        self.label
            .len()
            .max(self.label_id.len())
            .max(self.score.len())
            .max(self.display_name.len())
            .max(self.associated_detections.len())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeClassification {
    pub index: i32,
    pub score: f32,
    pub label: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeClassificationList {
    pub classification: Vec<NativeClassification>,
}
