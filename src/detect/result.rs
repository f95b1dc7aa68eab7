/// Bounding box in coordinates relative to the image (0..1).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RelativeBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl RelativeBox {
    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    /// Intersection over union with `other`.
    pub fn iou(&self, other: &RelativeBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);
        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// One detected face.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FaceDetection {
    pub bbox: RelativeBox,
    pub confidence: f32,
}

/// Order detections by descending confidence.
pub(crate) fn sort_by_confidence(detections: &mut [FaceDetection]) {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = RelativeBox {
            x: 0.1,
            y: 0.1,
            w: 0.2,
            h: 0.2,
        };
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = RelativeBox {
            x: 0.0,
            y: 0.0,
            w: 0.1,
            h: 0.1,
        };
        let b = RelativeBox { x: 0.5, ..a };
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn sort_puts_most_confident_first() {
        let bbox = RelativeBox {
            x: 0.0,
            y: 0.0,
            w: 0.1,
            h: 0.1,
        };
        let mut detections = vec![
            FaceDetection {
                bbox,
                confidence: 0.6,
            },
            FaceDetection {
                bbox,
                confidence: 0.9,
            },
        ];
        sort_by_confidence(&mut detections);
        assert_eq!(detections[0].confidence, 0.9);
    }
}
