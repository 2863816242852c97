use serde::Serialize;

/// One bounding box reported by a detection oracle.
///
/// Coordinates are integer pixels in the frame the oracle was given
/// (`x1, y1` top-left, `x2, y2` bottom-right).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    bbox: [i32; 4],
    label: String,
    confidence: f32,
}

impl Detection {
    /// Confidence is clamped into `[0, 1]`; NaN becomes 0.
    pub fn new(bbox: [i32; 4], label: impl Into<String>, confidence: f32) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            bbox,
            label: label.into(),
            confidence,
        }
    }

    pub fn bbox(&self) -> [i32; 4] {
        self.bbox
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(Detection::new([0, 0, 1, 1], "pothole", 1.7).confidence(), 1.0);
        assert_eq!(Detection::new([0, 0, 1, 1], "pothole", -0.2).confidence(), 0.0);
        assert_eq!(Detection::new([0, 0, 1, 1], "pothole", f32::NAN).confidence(), 0.0);
    }
}
