use serde::Serialize;

/// Normalized 3-D keypoint with visibility and presence confidences.
///
/// The layout is `#[repr(C)]` so a `&[Landmark]` can be handed to foreign
/// code as a pointer + length pair without repacking.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub visibility: f32,
    pub presence: f32,
}

impl Landmark {
    pub const fn new(x: f32, y: f32, z: f32, visibility: f32, presence: f32) -> Self {
        Self {
            x,
            y,
            z,
            visibility,
            presence,
        }
    }

    /// Project the normalized coordinates into pixel space.
    ///
    /// The marshaler never scales; callers that draw overlays use this.
    pub fn to_pixel(&self, width: u32, height: u32) -> (f32, f32) {
        (self.x * width as f32, self.y * height as f32)
    }
}

/// Points of one subject in model-defined order (21 for a hand, 33 for a pose).
pub type LandmarkList = Vec<Landmark>;

/// One [`LandmarkList`] per detected subject. Order carries no identity.
pub type LandmarkSet = Vec<LandmarkList>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_projection_scales_each_axis_independently() {
        let point = Landmark::new(0.5, 0.25, -0.1, 0.9, 1.0);
        assert_eq!(point.to_pixel(640, 480), (320.0, 120.0));
    }

    #[test]
    fn layout_is_five_packed_floats() {
        assert_eq!(std::mem::size_of::<Landmark>(), 5 * std::mem::size_of::<f32>());
        assert_eq!(std::mem::align_of::<Landmark>(), std::mem::align_of::<f32>());
    }
}
