//! YOLO object detector on OpenVINO
//!
//! Runs an Ultralytics YOLOv8-style export (ONNX or OpenVINO IR) and decodes
//! its single `[1, 4 + classes, anchors]` output into class detections.

use std::path::Path;

use anyhow::{Context, Result};
use ndarray::{s, ArrayView2};
use openvino::{CompiledModel, Core, DeviceType, ElementType, Shape, Tensor};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::model::{DetectParams, Detection, DetectionBackend};
use super::preprocess::{preprocess_for_detection, DecodedImage};

/// Box coordinates preceding the class scores in each output column
const BOX_ATTRS: usize = 4;

/// Candidate box before non-maximum suppression
#[derive(Debug, Clone)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    class_id: usize,
    confidence: f32,
}

/// OpenVINO handles. The bindings hold raw pointers and are neither `Send`
/// nor `Sync`.
struct OpenVinoHandles {
    _core: Core,
    compiled: CompiledModel,
}

// SAFETY: the handles are only reached through the detector's mutex, so at most
// one thread touches them at a time. OpenVINO's C API allows a compiled model
// to be used from any thread.
unsafe impl Send for OpenVinoHandles {}

/// YOLO detector backed by an OpenVINO compiled model
pub struct OpenVinoDetector {
    // Creating an infer request needs `&mut CompiledModel`; the request
    // itself runs outside the lock.
    handles: Mutex<OpenVinoHandles>,
    device: String,
}

impl OpenVinoDetector {
    /// Read and compile the model for `device` ("CPU", "GPU", "AUTO", ...)
    pub fn load(path: &Path, device: &str) -> Result<Self> {
        let model_path = path
            .to_str()
            .with_context(|| format!("Model path is not valid UTF-8: {}", path.display()))?;

        let mut core = Core::new().context("Failed to initialize OpenVINO runtime")?;
        let model = core
            .read_model_from_file(model_path, "")
            .with_context(|| format!("Failed to read model from {}", model_path))?;
        let compiled = core
            .compile_model(&model, DeviceType::from(device))
            .with_context(|| format!("Failed to compile model for device {}", device))?;

        info!("Compiled {} for device {}", model_path, device);

        Ok(Self {
            handles: Mutex::new(OpenVinoHandles {
                _core: core,
                compiled,
            }),
            device: device.to_string(),
        })
    }
}

impl DetectionBackend for OpenVinoDetector {
    fn detect(&self, image: &DecodedImage, params: &DetectParams) -> Result<Vec<Detection>> {
        let input_tensor = preprocess_for_detection(image, params.input_size);

        let mut request = self.handles.lock().compiled.create_infer_request()?;

        let side = i64::from(params.input_size);
        let input_shape = Shape::new(&[1, 3, side, side])?;
        let mut input = Tensor::new(ElementType::F32, &input_shape)?;
        write_tensor_f32(input.get_raw_data_mut()?, input_tensor.iter().copied())?;

        request.set_input_tensor(&input)?;
        request.infer()?;

        let output = request.get_output_tensor_by_index(0)?;
        let dims: Vec<i64> = output.get_shape()?.get_dimensions().to_vec();
        let data = read_tensor_f32(output.get_raw_data()?);
        debug!("Detector output shape {:?} on {}", dims, self.device);

        decode_yolo_output(&data, &dims, params)
    }

    fn name(&self) -> &str {
        "openvino"
    }
}

fn write_tensor_f32(raw: &mut [u8], values: impl ExactSizeIterator<Item = f32>) -> Result<()> {
    let expected = values.len() * std::mem::size_of::<f32>();
    if raw.len() != expected {
        anyhow::bail!("Input tensor holds {} bytes, expected {}", raw.len(), expected);
    }
    for (dst, value) in raw.chunks_exact_mut(4).zip(values) {
        dst.copy_from_slice(&value.to_ne_bytes());
    }
    Ok(())
}

fn read_tensor_f32(raw: &[u8]) -> Vec<f32> {
    raw.chunks_exact(4)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Decode a YOLOv8 detection head into thresholded, suppressed, capped
/// detections sorted by confidence.
///
/// Accepts `[1, attrs, anchors]`, `[attrs, anchors]`, or the transposed
/// layouts, where `attrs = 4 + classes` and boxes are `cx, cy, w, h`.
pub fn decode_yolo_output(data: &[f32], dims: &[i64], params: &DetectParams) -> Result<Vec<Detection>> {
    let (rows, cols) = match dims {
        [1, rows, cols] | [rows, cols] => (usize::try_from(*rows)?, usize::try_from(*cols)?),
        _ => anyhow::bail!("Unexpected detector output shape {:?}", dims),
    };
    if rows.checked_mul(cols) != Some(data.len()) {
        anyhow::bail!("Detector output has {} values, shape {:?} disagrees", data.len(), dims);
    }

    let view = ArrayView2::from_shape((rows, cols), data)?;
    // Anchors outnumber attributes in every YOLO export
    let view = if rows <= cols { view } else { view.reversed_axes() };
    if view.nrows() <= BOX_ATTRS {
        anyhow::bail!("Detector output has no class scores (shape {:?})", dims);
    }

    let mut candidates = Vec::new();
    for column in view.columns() {
        let scores = column.slice(s![BOX_ATTRS..]);
        let Some((class_id, &confidence)) = scores
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
        else {
            continue;
        };
        if confidence < params.confidence_threshold {
            continue;
        }

        let (cx, cy, w, h) = (column[0], column[1], column[2], column[3]);
        candidates.push(Candidate {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
            class_id,
            confidence,
        });
    }

    debug!("{} candidates above threshold {}", candidates.len(), params.confidence_threshold);

    let mut kept = nms(candidates, params.iou_threshold);
    kept.truncate(params.max_detections);

    Ok(kept
        .into_iter()
        .map(|c| Detection {
            class_id: c.class_id,
            confidence: c.confidence,
        })
        .collect())
}

/// Per-class non-maximum suppression
fn nms(mut boxes: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Candidate> = Vec::new();
    for candidate in boxes {
        let suppressed = keep
            .iter()
            .any(|k| k.class_id == candidate.class_id && compute_iou(k, &candidate) > iou_threshold);
        if !suppressed {
            keep.push(candidate);
        }
    }

    keep
}

/// Compute intersection over union
fn compute_iou(a: &Candidate, b: &Candidate) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);

    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);

    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLASSES: usize = 3;

    struct Anchor {
        bbox: [f32; 4],
        scores: [f32; CLASSES],
    }

    fn anchor(bbox: [f32; 4], class_id: usize, score: f32) -> Anchor {
        let mut scores = [0.0; CLASSES];
        scores[class_id] = score;
        Anchor { bbox, scores }
    }

    /// Lay anchors out as `[attrs, anchors]`, the YOLOv8 export layout
    fn head(anchors: &[Anchor]) -> (Vec<f32>, Vec<i64>) {
        let attrs = BOX_ATTRS + CLASSES;
        let n = anchors.len();
        let mut data = vec![0.0; attrs * n];
        for (i, a) in anchors.iter().enumerate() {
            for (j, v) in a.bbox.iter().chain(a.scores.iter()).enumerate() {
                data[j * n + i] = *v;
            }
        }
        (data, vec![1, attrs as i64, n as i64])
    }

    fn params() -> DetectParams {
        DetectParams {
            input_size: 640,
            confidence_threshold: 0.25,
            iou_threshold: 0.7,
            max_detections: 50,
        }
    }

    fn candidate(x1: f32, y1: f32, x2: f32, y2: f32) -> Candidate {
        Candidate { x1, y1, x2, y2, class_id: 0, confidence: 0.9 }
    }

    // Needs more anchors than attributes to look like a real head
    fn padded(mut anchors: Vec<Anchor>) -> Vec<Anchor> {
        while anchors.len() < 10 {
            anchors.push(anchor([0.0, 0.0, 1.0, 1.0], 0, 0.0));
        }
        anchors
    }

    #[test]
    fn test_iou_calculation() {
        let a = candidate(0.0, 0.0, 10.0, 10.0);
        let b = candidate(5.0, 5.0, 15.0, 15.0);

        // 25 / (100 + 100 - 25)
        let iou = compute_iou(&a, &b);
        assert!((iou - 0.143).abs() < 0.01);
    }

    #[test]
    fn test_low_confidence_is_dropped() {
        let (data, dims) = head(&padded(vec![
            anchor([100.0, 100.0, 50.0, 50.0], 1, 0.9),
            anchor([300.0, 300.0, 50.0, 50.0], 2, 0.1),
        ]));
        let detections = decode_yolo_output(&data, &dims, &params()).unwrap();
        assert_eq!(detections, vec![Detection { class_id: 1, confidence: 0.9 }]);
    }

    #[test]
    fn test_overlapping_same_class_is_suppressed() {
        let (data, dims) = head(&padded(vec![
            anchor([100.0, 100.0, 50.0, 50.0], 0, 0.8),
            anchor([101.0, 100.0, 50.0, 50.0], 0, 0.9),
        ]));
        let detections = decode_yolo_output(&data, &dims, &params()).unwrap();
        assert_eq!(detections, vec![Detection { class_id: 0, confidence: 0.9 }]);
    }

    #[test]
    fn test_overlapping_different_classes_are_kept() {
        let (data, dims) = head(&padded(vec![
            anchor([100.0, 100.0, 50.0, 50.0], 0, 0.8),
            anchor([100.0, 100.0, 50.0, 50.0], 1, 0.7),
        ]));
        let detections = decode_yolo_output(&data, &dims, &params()).unwrap();
        assert_eq!(detections.len(), 2);
    }

    #[test]
    fn test_separate_instances_of_one_class_are_kept() {
        let (data, dims) = head(&padded(vec![
            anchor([100.0, 100.0, 50.0, 50.0], 2, 0.8),
            anchor([400.0, 400.0, 50.0, 50.0], 2, 0.7),
        ]));
        let detections = decode_yolo_output(&data, &dims, &params()).unwrap();
        assert_eq!(detections.len(), 2);
        assert!(detections.iter().all(|d| d.class_id == 2));
        assert!(detections[0].confidence >= detections[1].confidence);
    }

    #[test]
    fn test_max_detections_caps_output() {
        let anchors: Vec<Anchor> = (0..10)
            .map(|i| anchor([i as f32 * 60.0 + 30.0, 30.0, 40.0, 40.0], 0, 0.5 + i as f32 * 0.01))
            .collect();
        let (data, dims) = head(&anchors);
        let mut p = params();
        p.max_detections = 3;

        let detections = decode_yolo_output(&data, &dims, &p).unwrap();
        assert_eq!(detections.len(), 3);
        assert!((detections[0].confidence - 0.59).abs() < 1e-6);
    }

    #[test]
    fn test_transposed_layout_matches() {
        let anchors = padded(vec![
            anchor([100.0, 100.0, 50.0, 50.0], 1, 0.9),
            anchor([400.0, 100.0, 50.0, 50.0], 0, 0.6),
        ]);
        let (data, dims) = head(&anchors);
        let expected = decode_yolo_output(&data, &dims, &params()).unwrap();

        let (attrs, n) = (dims[1] as usize, dims[2] as usize);
        let mut transposed = vec![0.0; data.len()];
        for j in 0..attrs {
            for i in 0..n {
                transposed[i * attrs + j] = data[j * n + i];
            }
        }
        let actual = decode_yolo_output(&transposed, &[1, n as i64, attrs as i64], &params()).unwrap();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_raising_threshold_never_increases_count() {
        let anchors: Vec<Anchor> = (0..12)
            .map(|i| anchor([i as f32 * 50.0 + 25.0, 25.0, 30.0, 30.0], i % CLASSES, i as f32 / 12.0))
            .collect();
        let (data, dims) = head(&anchors);

        let mut previous = usize::MAX;
        for threshold in [0.0, 0.1, 0.25, 0.5, 0.75, 0.95] {
            let mut p = params();
            p.confidence_threshold = threshold;
            let count = decode_yolo_output(&data, &dims, &p).unwrap().len();
            assert!(count <= previous);
            previous = count;
        }
    }

    #[test]
    fn test_rejects_bad_shapes() {
        assert!(decode_yolo_output(&[0.0; 6], &[1, 2, 3, 1], &params()).is_err());
        assert!(decode_yolo_output(&[0.0; 5], &[1, 2, 3], &params()).is_err());
        assert!(decode_yolo_output(&[0.0; 40], &[1, 4, 10], &params()).is_err());
    }

    #[test]
    fn test_tensor_byte_conversion() {
        let values = [0.5f32, -1.25, 3.0];
        let mut raw = vec![0u8; 12];
        write_tensor_f32(&mut raw, values.iter().copied()).unwrap();
        assert_eq!(read_tensor_f32(&raw), values.to_vec());

        let mut short = vec![0u8; 8];
        assert!(write_tensor_f32(&mut short, values.iter().copied()).is_err());
    }
}
