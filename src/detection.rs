use serde::Serialize;

/// Axis-aligned box in pixel coordinates of the image that was passed to inference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn from_center(xc: f32, yc: f32, w: f32, h: f32) -> Self {
        Self {
            x1: xc - w / 2.,
            y1: yc - h / 2.,
            x2: xc + w / 2.,
            y2: yc + h / 2.,
        }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn clamp(self, width: f32, height: f32) -> Self {
        Self {
            x1: self.x1.clamp(0., width),
            y1: self.y1.clamp(0., height),
            x2: self.x2.clamp(0., width),
            y2: self.y2.clamp(0., height),
        }
    }

    pub fn intersection(&self, other: &BoundingBox) -> f32 {
        let w = self.x2.min(other.x2) - self.x1.max(other.x1);
        let h = self.y2.min(other.y2) - self.y1.max(other.y1);
        w.max(0.) * h.max(0.)
    }

    pub fn union(&self, other: &BoundingBox) -> f32 {
        self.area() + other.area() - self.intersection(other)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let union = self.union(other);
        if union <= 0. {
            return 0.;
        }
        self.intersection(other) / union
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_id: usize,
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

pub const DETECTION_HEADERS: [&str; 6] = ["Label", "Confidence", "X1", "Y1", "X2", "Y2"];

/// One table row, serialized as a JSON array in `DETECTION_HEADERS` order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRow(pub String, pub f64, pub f64, pub f64, pub f64, pub f64);

impl From<&Detection> for DetectionRow {
    fn from(detection: &Detection) -> Self {
        let bbox = &detection.bbox;
        DetectionRow(
            detection.label.clone(),
            round_to(detection.confidence, 3),
            round_to(bbox.x1, 2),
            round_to(bbox.y1, 2),
            round_to(bbox.x2, 2),
            round_to(bbox.y2, 2),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionTable {
    pub headers: [&'static str; 6],
    pub rows: Vec<DetectionRow>,
}

impl From<&[Detection]> for DetectionTable {
    fn from(detections: &[Detection]) -> Self {
        Self {
            headers: DETECTION_HEADERS,
            rows: detections.iter().map(DetectionRow::from).collect(),
        }
    }
}

fn round_to(value: f32, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value as f64 * factor).round() / factor
}
