//! Task variants: which streams a session observes and what callers receive.
//!
//! Five output shapes exist. Each is a marker type implementing
//! [`TaskVariant`], so a [`Session`](crate::Session) is generic over its task
//! instead of repeating the lifecycle per task.

use std::fmt;

use graphpipe_records::{
    ClassificationScores, DetectionRecord, Landmark, LandmarkList, LandmarkSet, marshal,
};
use serde::Serialize;

use crate::{
    engine::{Payload, PayloadKind},
    error::{Result, SessionError},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Detection,
    SingleLandmarks,
    MultiLandmarks,
    Holistic,
    Scores,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TaskKind::Detection => "detection",
            TaskKind::SingleLandmarks => "single-landmarks",
            TaskKind::MultiLandmarks => "multi-landmarks",
            TaskKind::Holistic => "holistic",
            TaskKind::Scores => "scores",
        };
        f.pad(text)
    }
}

/// The single output channel of a one-channel task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Primary;

/// Stream names for a one-channel task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelLayout {
    pub output: String,
    /// Boolean stream gating `output`; only consulted by pollers.
    pub presence: Option<String>,
}

impl ChannelLayout {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            presence: None,
        }
    }

    pub fn with_presence(mut self, presence: impl Into<String>) -> Self {
        self.presence = Some(presence.into());
        self
    }

    pub fn face_detection() -> Self {
        Self::new("face_detections")
    }

    pub fn face_mesh() -> Self {
        Self::new("multi_face_landmarks").with_presence("multi_landmarks_presence")
    }

    pub fn hand_tracking() -> Self {
        Self::new("landmarks")
    }

    pub fn pose_tracking() -> Self {
        Self::new("pose_landmarks")
    }

    pub fn face_blendshapes() -> Self {
        Self::new("blendshapes").with_presence("landmarks_presence")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HolisticPart {
    Pose,
    Face,
    LeftHand,
    RightHand,
}

impl HolisticPart {
    pub const ALL: [HolisticPart; 4] = [
        HolisticPart::Pose,
        HolisticPart::Face,
        HolisticPart::LeftHand,
        HolisticPart::RightHand,
    ];

    pub fn label(self) -> &'static str {
        match self {
            HolisticPart::Pose => "pose",
            HolisticPart::Face => "face",
            HolisticPart::LeftHand => "left_hand",
            HolisticPart::RightHand => "right_hand",
        }
    }
}

/// Stream names for the four synchronized holistic outputs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HolisticLayout {
    pub pose: String,
    pub face: String,
    pub left_hand: String,
    pub right_hand: String,
}

impl HolisticLayout {
    pub fn stream(&self, part: HolisticPart) -> &str {
        match part {
            HolisticPart::Pose => &self.pose,
            HolisticPart::Face => &self.face,
            HolisticPart::LeftHand => &self.left_hand,
            HolisticPart::RightHand => &self.right_hand,
        }
    }
}

impl Default for HolisticLayout {
    fn default() -> Self {
        Self {
            pose: "pose_landmarks".to_owned(),
            face: "face_landmarks".to_owned(),
            left_hand: "left_hand_landmarks".to_owned(),
            right_hand: "right_hand_landmarks".to_owned(),
        }
    }
}

/// Streams backing one output channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Streams<'a> {
    pub output: &'a str,
    pub presence: Option<&'a str>,
}

pub trait TaskVariant: Send + 'static {
    /// Caller-owned value delivered for one payload packet.
    type Output: Send + 'static;
    /// Names one output channel of the task.
    type Slot: Copy + fmt::Debug + Send + 'static;
    type Layout: Clone + fmt::Debug + Send + 'static;

    const KIND: TaskKind;
    const SLOTS: &'static [Self::Slot];
    /// Payload shape the task's output streams carry.
    const PAYLOAD: PayloadKind;

    fn default_layout() -> Self::Layout;

    fn streams(layout: &Self::Layout, slot: Self::Slot) -> Streams<'_>;

    /// Deep-copy a payload of kind [`Self::PAYLOAD`] into the output type.
    fn marshal(payload: &Payload) -> Option<Self::Output>;
}

/// Tasks whose output is a flat run of plain values that can be copied into
/// a caller-provided buffer.
pub trait BufferedTask: TaskVariant {
    type Element: Copy;

    fn elements(output: &Self::Output) -> &[Self::Element];
}

pub(crate) fn decode<V: TaskVariant>(stream: &str, payload: &Payload) -> Result<V::Output> {
    V::marshal(payload).ok_or_else(|| SessionError::UnexpectedPayload {
        stream: stream.to_owned(),
        expected: V::PAYLOAD,
        found: payload.kind(),
    })
}

/// Lists of detections, e.g. face detection.
#[derive(Debug)]
pub enum DetectionTask {}

impl TaskVariant for DetectionTask {
    type Output = Vec<DetectionRecord>;
    type Slot = Primary;
    type Layout = ChannelLayout;

    const KIND: TaskKind = TaskKind::Detection;
    const SLOTS: &'static [Primary] = &[Primary];
    const PAYLOAD: PayloadKind = PayloadKind::Detections;

    fn default_layout() -> ChannelLayout {
        ChannelLayout::face_detection()
    }

    fn streams(layout: &ChannelLayout, _: Primary) -> Streams<'_> {
        primary_streams(layout)
    }

    fn marshal(payload: &Payload) -> Option<Vec<DetectionRecord>> {
        match payload {
            Payload::Detections(list) => Some(marshal::detections(list)),
            _ => None,
        }
    }
}

/// One landmark list per frame, e.g. pose tracking.
#[derive(Debug)]
pub enum SingleLandmarkTask {}

impl TaskVariant for SingleLandmarkTask {
    type Output = LandmarkList;
    type Slot = Primary;
    type Layout = ChannelLayout;

    const KIND: TaskKind = TaskKind::SingleLandmarks;
    const SLOTS: &'static [Primary] = &[Primary];
    const PAYLOAD: PayloadKind = PayloadKind::LandmarkList;

    fn default_layout() -> ChannelLayout {
        ChannelLayout::pose_tracking()
    }

    fn streams(layout: &ChannelLayout, _: Primary) -> Streams<'_> {
        primary_streams(layout)
    }

    fn marshal(payload: &Payload) -> Option<LandmarkList> {
        match payload {
            Payload::LandmarkList(list) => Some(marshal::landmark_list(list)),
            _ => None,
        }
    }
}

impl BufferedTask for SingleLandmarkTask {
    type Element = Landmark;

    fn elements(output: &LandmarkList) -> &[Landmark] {
        output
    }
}

/// One landmark list per detected subject, e.g. face mesh or hand tracking.
#[derive(Debug)]
pub enum MultiLandmarkTask {}

impl TaskVariant for MultiLandmarkTask {
    type Output = LandmarkSet;
    type Slot = Primary;
    type Layout = ChannelLayout;

    const KIND: TaskKind = TaskKind::MultiLandmarks;
    const SLOTS: &'static [Primary] = &[Primary];
    const PAYLOAD: PayloadKind = PayloadKind::LandmarkLists;

    fn default_layout() -> ChannelLayout {
        ChannelLayout::face_mesh()
    }

    fn streams(layout: &ChannelLayout, _: Primary) -> Streams<'_> {
        primary_streams(layout)
    }

    fn marshal(payload: &Payload) -> Option<LandmarkSet> {
        match payload {
            Payload::LandmarkLists(lists) => Some(marshal::landmark_set(lists)),
            _ => None,
        }
    }
}

/// Buffered reads take the first subject only.
impl BufferedTask for MultiLandmarkTask {
    type Element = Landmark;

    fn elements(output: &LandmarkSet) -> &[Landmark] {
        output.first().map(Vec::as_slice).unwrap_or_default()
    }
}

/// Pose, face and both hands from one graph, delivered per part.
#[derive(Debug)]
pub enum HolisticTask {}

impl TaskVariant for HolisticTask {
    type Output = LandmarkList;
    type Slot = HolisticPart;
    type Layout = HolisticLayout;

    const KIND: TaskKind = TaskKind::Holistic;
    const SLOTS: &'static [HolisticPart] = &HolisticPart::ALL;
    const PAYLOAD: PayloadKind = PayloadKind::LandmarkList;

    fn default_layout() -> HolisticLayout {
        HolisticLayout::default()
    }

    fn streams(layout: &HolisticLayout, part: HolisticPart) -> Streams<'_> {
        Streams {
            output: layout.stream(part),
            presence: None,
        }
    }

    fn marshal(payload: &Payload) -> Option<LandmarkList> {
        SingleLandmarkTask::marshal(payload)
    }
}

impl BufferedTask for HolisticTask {
    type Element = Landmark;

    fn elements(output: &LandmarkList) -> &[Landmark] {
        output
    }
}

/// Ordered score vectors, e.g. face blendshapes.
#[derive(Debug)]
pub enum ScoreTask {}

impl TaskVariant for ScoreTask {
    type Output = ClassificationScores;
    type Slot = Primary;
    type Layout = ChannelLayout;

    const KIND: TaskKind = TaskKind::Scores;
    const SLOTS: &'static [Primary] = &[Primary];
    const PAYLOAD: PayloadKind = PayloadKind::Classifications;

    fn default_layout() -> ChannelLayout {
        ChannelLayout::face_blendshapes()
    }

    fn streams(layout: &ChannelLayout, _: Primary) -> Streams<'_> {
        primary_streams(layout)
    }

    fn marshal(payload: &Payload) -> Option<ClassificationScores> {
        match payload {
            Payload::Classifications(list) => Some(marshal::classification_scores(list)),
            _ => None,
        }
    }
}

impl BufferedTask for ScoreTask {
    type Element = f32;

    fn elements(output: &ClassificationScores) -> &[f32] {
        output
    }
}

fn primary_streams(layout: &ChannelLayout) -> Streams<'_> {
    Streams {
        output: &layout.output,
        presence: layout.presence.as_deref(),
    }
}

#[cfg(test)]
mod tests {
    use graphpipe_records::native::{
        NativeClassification, NativeClassificationList, NativeLandmark, NativeLandmarkList,
    };

    use super::*;

    fn native_list(xs: &[f32]) -> NativeLandmarkList {
        NativeLandmarkList {
            landmark: xs
                .iter()
                .map(|x| NativeLandmark {
                    x: *x,
                    ..NativeLandmark::default()
                })
                .collect(),
        }
    }

    #[test]
    fn presets_use_the_well_known_stream_names() {
        let mesh = MultiLandmarkTask::default_layout();
        assert_eq!(
            MultiLandmarkTask::streams(&mesh, Primary),
            Streams {
                output: "multi_face_landmarks",
                presence: Some("multi_landmarks_presence"),
            }
        );
        assert_eq!(ChannelLayout::hand_tracking().output, "landmarks");
        assert_eq!(
            HolisticTask::streams(&HolisticLayout::default(), HolisticPart::RightHand).output,
            "right_hand_landmarks"
        );
        assert_eq!(
            ScoreTask::default_layout().presence.as_deref(),
            Some("landmarks_presence")
        );
    }

    #[test]
    fn decode_refuses_the_wrong_payload_shape() {
        let err = decode::<ScoreTask>("blendshapes", &Payload::Presence(true)).unwrap_err();
        assert!(matches!(
            err,
            SessionError::UnexpectedPayload {
                expected: PayloadKind::Classifications,
                found: PayloadKind::Presence,
                ..
            }
        ));
    }

    #[test]
    fn scores_keep_category_order() {
        let payload = Payload::Classifications(NativeClassificationList {
            classification: [0.9, 0.1, 0.5]
                .into_iter()
                .map(|score| NativeClassification {
                    score,
                    ..NativeClassification::default()
                })
                .collect(),
        });
        let scores = decode::<ScoreTask>("blendshapes", &payload).expect("scores");
        assert_eq!(scores, vec![0.9, 0.1, 0.5]);
    }

    #[test]
    fn multi_subject_buffer_view_is_the_first_subject() {
        let payload = Payload::LandmarkLists(vec![native_list(&[1.0, 2.0]), native_list(&[3.0])]);
        let set = decode::<MultiLandmarkTask>("landmarks", &payload).expect("set");
        let first = MultiLandmarkTask::elements(&set);
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].x, 2.0);

        let empty: LandmarkSet = Vec::new();
        assert!(MultiLandmarkTask::elements(&empty).is_empty());
    }
}
