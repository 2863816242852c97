#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectionOracle;
use crate::detect::result::Detection;
use crate::frame::Frame;

const NMS_IOU: f32 = 0.45;

/// Tract-based oracle for YOLO-style ONNX detectors.
///
/// Expects a single output of shape `[1, 4 + classes, anchors]` with boxes as
/// centre/size in model-input pixels. Frames are resized to the model input,
/// and boxes are scaled back to frame pixels.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_width: u32,
    input_height: u32,
    labels: Vec<String>,
    min_confidence: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        input_width: u32,
        input_height: u32,
        labels: Vec<String>,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_height as usize, input_width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_width,
            input_height,
            labels,
            min_confidence: 0.25,
        })
    }

    /// Drop candidate boxes scoring below `threshold` before NMS.
    pub fn with_min_confidence(mut self, threshold: f32) -> Self {
        self.min_confidence = threshold;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let image = frame
            .to_rgb_image()
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
        let resized = imageops::resize(
            &image,
            self.input_width,
            self.input_height,
            FilterType::Triangle,
        );
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.input_height as usize, self.input_width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        let view = view
            .into_dimensionality::<tract_ndarray::Ix3>()
            .map_err(|_| anyhow!("unexpected detector output shape {:?}", shape))?;
        if shape[0] != 1 || shape[1] <= 4 {
            return Err(anyhow!("unexpected detector output shape {:?}", shape));
        }
        let classes = shape[1] - 4;
        let anchors = shape[2];

        let scale_x = frame.width as f32 / self.input_width as f32;
        let scale_y = frame.height as f32 / self.input_height as f32;

        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let (class, score) = (0..classes)
                .map(|c| (c, view[[0, 4 + c, anchor]]))
                .fold((0, f32::NEG_INFINITY), |best, item| {
                    if item.1 > best.1 {
                        item
                    } else {
                        best
                    }
                });
            if !score.is_finite() || score < self.min_confidence {
                continue;
            }
            let cx = view[[0, 0, anchor]];
            let cy = view[[0, 1, anchor]];
            let w = view[[0, 2, anchor]];
            let h = view[[0, 3, anchor]];
            let corners = [
                (cx - w / 2.0) * scale_x,
                (cy - h / 2.0) * scale_y,
                (cx + w / 2.0) * scale_x,
                (cy + h / 2.0) * scale_y,
            ];
            candidates.push(Candidate {
                corners,
                class,
                score,
            });
        }

        let kept = non_max_suppression(candidates, NMS_IOU);
        Ok(kept
            .into_iter()
            .map(|candidate| {
                let label = self
                    .labels
                    .get(candidate.class)
                    .cloned()
                    .unwrap_or_else(|| format!("class{}", candidate.class));
                Detection::new(
                    clamp_box(candidate.corners, frame.width, frame.height),
                    label,
                    candidate.score,
                )
            })
            .collect())
    }
}

impl DetectionOracle for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = Frame::rgb(
            vec![0u8; self.input_width as usize * self.input_height as usize * 3],
            self.input_width,
            self.input_height,
        )?;
        self.detect(&blank).map(|_| ())
    }
}

#[derive(Clone, Debug)]
struct Candidate {
    corners: [f32; 4],
    class: usize,
    score: f32,
}

/// Greedy per-class NMS, highest score first.
fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        let overlaps = kept.iter().any(|existing| {
            existing.class == candidate.class
                && iou(&existing.corners, &candidate.corners) > iou_threshold
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);
    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area = |r: &[f32; 4]| (r[2] - r[0]).max(0.0) * (r[3] - r[1]).max(0.0);
    let union = area(a) + area(b) - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

fn clamp_box(corners: [f32; 4], width: u32, height: u32) -> [i32; 4] {
    let max_x = width.saturating_sub(1) as f32;
    let max_y = height.saturating_sub(1) as f32;
    [
        corners[0].clamp(0.0, max_x).round() as i32,
        corners[1].clamp(0.0, max_y).round() as i32,
        corners[2].clamp(0.0, max_x).round() as i32,
        corners[3].clamp(0.0, max_y).round() as i32,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(corners: [f32; 4], class: usize, score: f32) -> Candidate {
        Candidate {
            corners,
            class,
            score,
        }
    }

    #[test]
    fn nms_drops_overlapping_boxes_of_same_class() {
        let kept = non_max_suppression(
            vec![
                candidate([0.0, 0.0, 10.0, 10.0], 0, 0.6),
                candidate([1.0, 1.0, 10.0, 10.0], 0, 0.9),
                candidate([1.0, 1.0, 10.0, 10.0], 1, 0.7),
                candidate([50.0, 50.0, 60.0, 60.0], 0, 0.3),
            ],
            NMS_IOU,
        );
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].score, 0.9);
        assert_eq!(kept[1].class, 1);
    }

    #[test]
    fn boxes_are_clamped_to_frame() {
        assert_eq!(
            clamp_box([-5.0, 2.4, 700.0, 479.6], 640, 480),
            [0, 2, 639, 479]
        );
    }
}
