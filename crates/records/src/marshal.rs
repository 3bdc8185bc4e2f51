//! Conversions from engine-native payloads into caller-owned records.
//!
//! Every function deep-copies: nothing returned here borrows from the engine
//! packet. Coordinates and scores pass through untouched; pixel scaling and
//! score normalization are the caller's business.

use thiserror::Error;

use crate::classification::ClassificationScores;
use crate::detection::{DetectionRecord, LocationData};
use crate::landmark::{Landmark, LandmarkList, LandmarkSet};
use crate::native::{
    NativeClassificationList, NativeDetection, NativeLandmark, NativeLandmarkList,
    NativeLocationData,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MarshalError {
    #[error("output buffer holds {expected} element(s) but the payload carries {actual}")]
    CountMismatch { expected: usize, actual: usize },
}

pub fn landmark(native: &NativeLandmark) -> Landmark {
    Landmark {
        x: native.x,
        y: native.y,
        z: native.z,
        visibility: native.visibility,
        presence: native.presence,
    }
}

pub fn landmark_list(native: &NativeLandmarkList) -> LandmarkList {
    native.landmark.iter().map(landmark).collect()
}

pub fn landmark_set(native: &[NativeLandmarkList]) -> LandmarkSet {
    native.iter().map(landmark_list).collect()
}

/// Flatten one detection.
///
/// The category count is the longest of the per-category fields; shorter
/// fields are padded with defaults so the output arrays stay parallel and
/// index `i` never picks up data from index `i + 1`.
pub fn detection(native: &NativeDetection) -> DetectionRecord {
    let categories = native.category_count();
    let mut record = DetectionRecord {
        labels: Vec::with_capacity(categories),
        label_ids: Vec::with_capacity(categories),
        scores: Vec::with_capacity(categories),
        location: native
            .location_data
            .as_ref()
            .map(location_data)
            .unwrap_or_default(),
        feature_tag: native.feature_tag.clone(),
        track_id: native.track_id.clone(),
        detection_id: native.detection_id,
        associated: Vec::with_capacity(categories),
        display_names: Vec::with_capacity(categories),
        timestamp_usec: native.timestamp_usec,
    };

    for index in 0..categories {
        record
            .labels
            .push(native.label.get(index).cloned().unwrap_or_default());
        record
            .label_ids
            .push(native.label_id.get(index).copied().unwrap_or_default());
        record
            .scores
            .push(native.score.get(index).copied().unwrap_or_default());
        record
            .display_names
            .push(native.display_name.get(index).cloned().unwrap_or_default());
        record.associated.push(
            native
                .associated_detections
                .get(index)
                .copied()
                .unwrap_or_default(),
        );
    }

    record
}

pub fn detections(native: &[NativeDetection]) -> Vec<DetectionRecord> {
    native.iter().map(detection).collect()
}

fn location_data(native: &NativeLocationData) -> LocationData {
    LocationData {
        format: native.format,
        bounding_box: native.bounding_box.unwrap_or_default(),
        relative_bounding_box: native.relative_bounding_box.unwrap_or_default(),
        mask: native.mask.clone().unwrap_or_default(),
        relative_keypoints: native.relative_keypoints.clone(),
    }
}

pub fn classification_scores(native: &NativeClassificationList) -> ClassificationScores {
    native.classification.iter().map(|c| c.score).collect()
}

/// Copy `source` into a caller-sized buffer.
///
/// The buffer length is the caller's expected count; any difference is an
/// error and leaves `out` untouched.
pub fn copy_into<T: Copy>(source: &[T], out: &mut [T]) -> Result<usize, MarshalError> {
    if source.len() != out.len() {
        return Err(MarshalError::CountMismatch {
            expected: out.len(),
            actual: source.len(),
        });
    }
    out.copy_from_slice(source);
    Ok(source.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{
        AssociatedDetection, BinaryMask, LocationFormat, MaskInterval, Region, RelativeKeypoint,
    };
    use crate::native::NativeClassification;

    fn native_point(seed: f32) -> NativeLandmark {
        NativeLandmark {
            x: seed,
            y: seed + 0.1,
            z: -seed,
            visibility: 0.5,
            presence: 0.75,
        }
    }

    #[test]
    fn landmarks_copy_all_five_scalars_unscaled() {
        let list = NativeLandmarkList {
            landmark: (0..21).map(|i| native_point(i as f32 / 100.0)).collect(),
        };
        let out = landmark_list(&list);
        assert_eq!(out.len(), 21);
        let source = &list.landmark[3];
        assert_eq!(
            out[3],
            Landmark::new(source.x, source.y, source.z, 0.5, 0.75)
        );
    }

    #[test]
    fn landmark_set_keeps_instance_order() {
        let set = vec![
            NativeLandmarkList {
                landmark: vec![native_point(0.1)],
            },
            NativeLandmarkList {
                landmark: vec![native_point(0.9), native_point(0.8)],
            },
        ];
        let out = landmark_set(&set);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 1);
        assert_eq!(out[1][1].x, 0.8);
    }

    #[test]
    fn detection_arrays_stay_parallel_and_mask_is_verbatim() {
        let intervals: Vec<MaskInterval> = (0..5)
            .map(|row| MaskInterval {
                row,
                left_x: row * 2,
                right_x: row * 2 + 3,
            })
            .collect();
        let native = NativeDetection {
            label: vec!["left".into(), "right".into(), "center".into()],
            label_id: vec![10, 11, 12],
            score: vec![0.1, 0.2, 0.3],
            display_name: vec!["L".into(), "R".into(), "C".into()],
            associated_detections: vec![
                AssociatedDetection {
                    id: 1,
                    confidence: 0.5,
                },
                AssociatedDetection {
                    id: 2,
                    confidence: 0.6,
                },
                AssociatedDetection {
                    id: 3,
                    confidence: 0.7,
                },
            ],
            location_data: Some(NativeLocationData {
                format: LocationFormat::Mask,
                mask: Some(BinaryMask {
                    width: 16,
                    height: 16,
                    intervals: intervals.clone(),
                }),
                relative_keypoints: vec![RelativeKeypoint {
                    x: 0.4,
                    y: 0.6,
                    label: "nose".into(),
                    score: 0.8,
                }],
                ..Default::default()
            }),
            detection_id: 42,
            timestamp_usec: 3000,
            ..Default::default()
        };

        let record = detection(&native);
        assert_eq!(record.labels.len(), 3);
        assert_eq!(record.label_ids.len(), 3);
        assert_eq!(record.scores.len(), 3);
        assert_eq!(record.display_names.len(), 3);
        assert_eq!(record.associated.len(), 3);
        for (index, category) in record.categories().enumerate() {
            assert_eq!(category.label_id, 10 + index as i32);
            assert_eq!(category.associated.id, 1 + index as i32);
        }
        match record.location.region() {
            Region::Mask(mask) => assert_eq!(mask.intervals, intervals),
            other => panic!("unexpected region {other:?}"),
        }
        assert_eq!(record.location.relative_keypoints[0].label, "nose");
        assert_eq!(record.detection_id, 42);
        assert_eq!(record.timestamp_usec, 3000);
    }

    #[test]
    fn short_category_fields_are_padded_not_shifted() {
        let native = NativeDetection {
            label_id: vec![0, 1],
            score: vec![0.9, 0.8],
            ..Default::default()
        };
        let record = detection(&native);
        assert_eq!(record.category_count(), 2);
        assert_eq!(record.labels, vec![String::new(), String::new()]);
        assert_eq!(record.associated[1], AssociatedDetection::default());
        assert_eq!(record.scores, vec![0.9, 0.8]);
    }

    #[test]
    fn missing_location_is_global() {
        let record = detection(&NativeDetection::default());
        assert_eq!(record.location.region(), Region::Global);
        assert_eq!(record.category_count(), 0);
    }

    #[test]
    fn scores_follow_model_order_without_normalization() {
        let native = NativeClassificationList {
            classification: [3.0_f32, -1.0, 0.25]
                .iter()
                .enumerate()
                .map(|(index, score)| NativeClassification {
                    index: index as i32,
                    score: *score,
                    ..Default::default()
                })
                .collect(),
        };
        assert_eq!(classification_scores(&native), vec![3.0, -1.0, 0.25]);
    }

    #[test]
    fn copy_into_rejects_size_mismatch_without_writing() {
        let source = [Landmark::new(1.0, 2.0, 3.0, 4.0, 5.0); 3];
        let mut short = [Landmark::default(); 2];
        assert_eq!(
            copy_into(&source, &mut short),
            Err(MarshalError::CountMismatch {
                expected: 2,
                actual: 3
            })
        );
        assert_eq!(short, [Landmark::default(); 2]);

        let mut exact = [Landmark::default(); 3];
        assert_eq!(copy_into(&source, &mut exact), Ok(3));
        assert_eq!(exact, source);
    }
}
