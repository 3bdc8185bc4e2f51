//! Flat detection records.
//!
//! A [`DetectionRecord`] stores per-category data as parallel arrays keyed by
//! category index: `labels[i]`, `label_ids[i]`, `scores[i]`,
//! `display_names[i]` and `associated[i]` all describe category `i`.

use serde::{Deserialize, Serialize};

/// Which region of a [`LocationData`] is meaningful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationFormat {
    /// The whole image; no region is carried.
    #[default]
    Global,
    /// Absolute pixel box.
    BoundingBox,
    /// Box in normalized `[0, 1]` coordinates.
    RelativeBoundingBox,
    /// Run-length encoded binary mask.
    Mask,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundingBox {
    pub x_min: i32,
    pub y_min: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelativeBoundingBox {
    pub x_min: f32,
    pub y_min: f32,
    pub width: f32,
    pub height: f32,
}

/// One horizontal run `[left_x, right_x]` of set pixels on `row`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskInterval {
    pub row: i32,
    pub left_x: i32,
    pub right_x: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinaryMask {
    pub width: i32,
    pub height: i32,
    pub intervals: Vec<MaskInterval>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelativeKeypoint {
    pub x: f32,
    pub y: f32,
    pub label: String,
    pub score: f32,
}

/// Where a detection sits in the frame.
///
/// Every region field is always present; only the one selected by `format`
/// holds data. Use [`LocationData::region`] rather than reading the fields
/// directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocationData {
    pub format: LocationFormat,
    pub bounding_box: BoundingBox,
    pub relative_bounding_box: RelativeBoundingBox,
    pub mask: BinaryMask,
    pub relative_keypoints: Vec<RelativeKeypoint>,
}

/// The meaningful region of a [`LocationData`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Region<'a> {
    Global,
    BoundingBox(&'a BoundingBox),
    RelativeBoundingBox(&'a RelativeBoundingBox),
    Mask(&'a BinaryMask),
}

impl LocationData {
    pub fn region(&self) -> Region<'_> {
        match self.format {
            LocationFormat::Global => Region::Global,
            LocationFormat::BoundingBox => Region::BoundingBox(&self.bounding_box),
            LocationFormat::RelativeBoundingBox => {
                Region::RelativeBoundingBox(&self.relative_bounding_box)
            }
            LocationFormat::Mask => Region::Mask(&self.mask),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociatedDetection {
    pub id: i32,
    pub confidence: f32,
}

/// Caller-owned copy of one engine detection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionRecord {
    pub labels: Vec<String>,
    pub label_ids: Vec<i32>,
    pub scores: Vec<f32>,
    pub location: LocationData,
    pub feature_tag: String,
    pub track_id: String,
    pub detection_id: i64,
    pub associated: Vec<AssociatedDetection>,
    pub display_names: Vec<String>,
    pub timestamp_usec: i64,
}

/// Borrowed view of category `i` across the parallel arrays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Category<'a> {
    pub label: &'a str,
    pub label_id: i32,
    pub score: f32,
    pub display_name: &'a str,
    pub associated: AssociatedDetection,
}

impl DetectionRecord {
    /// Number of categories. All parallel arrays share this length.
    pub fn category_count(&self) -> usize {
        self.scores.len()
    }

    pub fn category(&self, index: usize) -> Option<Category<'_>> {
        Some(Category {
            label: self.labels.get(index)?,
            label_id: *self.label_ids.get(index)?,
            score: *self.scores.get(index)?,
            display_name: self.display_names.get(index)?,
            associated: *self.associated.get(index)?,
        })
    }

    pub fn categories(&self) -> impl Iterator<Item = Category<'_>> {
        (0..self.category_count()).filter_map(|index| self.category(index))
    }

    /// Category with the highest score, if any.
    pub fn best_category(&self) -> Option<Category<'_>> {
        self.categories().max_by(|a, b| a.score.total_cmp(&b.score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_category_record() -> DetectionRecord {
        DetectionRecord {
            labels: vec!["face".into(), "person".into()],
            label_ids: vec![0, 1],
            scores: vec![0.4, 0.9],
            display_names: vec!["Face".into(), "Person".into()],
            associated: vec![
                AssociatedDetection {
                    id: 7,
                    confidence: 0.1,
                },
                AssociatedDetection {
                    id: 8,
                    confidence: 0.2,
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn region_follows_format_tag() {
        let mut location = LocationData {
            relative_bounding_box: RelativeBoundingBox {
                x_min: 0.1,
                y_min: 0.2,
                width: 0.3,
                height: 0.4,
            },
            ..Default::default()
        };
        assert_eq!(location.region(), Region::Global);

        location.format = LocationFormat::RelativeBoundingBox;
        match location.region() {
            Region::RelativeBoundingBox(rel) => assert_eq!(rel.width, 0.3),
            other => panic!("unexpected region {other:?}"),
        }
    }

    #[test]
    fn category_view_reads_one_index_across_arrays() {
        let record = two_category_record();
        let second = record.category(1).expect("second category");
        assert_eq!(second.label, "person");
        assert_eq!(second.label_id, 1);
        assert_eq!(second.display_name, "Person");
        assert_eq!(second.associated.id, 8);
        assert!(record.category(2).is_none());
    }

    #[test]
    fn best_category_picks_highest_score() {
        let record = two_category_record();
        assert_eq!(record.best_category().map(|c| c.label), Some("person"));
        assert!(DetectionRecord::default().best_category().is_none());
    }
}
