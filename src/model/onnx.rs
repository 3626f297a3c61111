//! ONNX Runtime による検出・キーポイント推論バックエンド
//!
//! グレースケール入力のモデルを想定する。検出モデルは全画面を正方形に
//! レターボックスした入力から手スロットごとの存在確率と中心・サイズを、
//! キーポイントモデルはクロップ済みパッチから21点のヒートマップを返す。

use anyhow::{anyhow, Context, Result};
use ndarray::{Array4, ArrayViewD};
use nalgebra::Vector2;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;
use std::sync::Mutex;

use crate::hand::KEYPOINT_COUNT;
use crate::image::{ImagePatch, ImageView};
use crate::model::detector::{DetectorOutput, HandDetector};
use crate::model::keypoint::{KeypointEstimator, KeypointPrediction, KeypointRequest};

/// 検出モデルの入力一辺
pub const DETECTION_INPUT_SIZE: u32 = 160;
/// 手スロット存在確率の閾値
const HAND_EXISTS_THRESHOLD: f32 = 0.3;
/// 検出サイズ出力に掛けるスケール
const DETECTION_SIZE_FAC: f32 = 2.0;

fn build_session<P: AsRef<Path>>(path: P) -> Result<Session> {
    Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .commit_from_file(path.as_ref())
        .with_context(|| format!("Failed to load ONNX model: {}", path.as_ref().display()))
}

/// 平均0.5・標準偏差0.25のグレースケール正規化
///
/// 露出変動に弱いモデルのための学習時と同じ前処理。
fn normalize_grayscale(values: &mut [f32]) {
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    let stddev = var.sqrt();
    if stddev == 0.0 {
        return;
    }
    let gain = 0.25 / stddev;
    for v in values.iter_mut() {
        *v = (*v - mean) * gain + 0.5;
    }
}

/// 全画面手検出のONNX実装
///
/// ビューごとに専用セッションを持ち、並行呼び出しでも互いをブロックしない。
pub struct OnnxHandDetector {
    sessions: [Mutex<Session>; 2],
}

impl OnnxHandDetector {
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        Ok(Self {
            sessions: [
                Mutex::new(build_session(model_path.as_ref())?),
                Mutex::new(build_session(model_path.as_ref())?),
            ],
        })
    }

    /// レターボックス縮小: (テンソル, スケール, オフセット)
    fn preprocess(&self, image: &ImageView) -> (Array4<f32>, f32, Vector2<f32>) {
        let size = DETECTION_INPUT_SIZE as usize;
        let scale = (size as f32 / image.width as f32).min(size as f32 / image.height as f32);
        let offset = Vector2::new(
            (size as f32 - image.width as f32 * scale) / 2.0,
            (size as f32 - image.height as f32 * scale) / 2.0,
        );

        let mut tensor = Array4::<f32>::zeros((1, 1, size, size));
        for y in 0..size {
            for x in 0..size {
                let src_x = (x as f32 - offset.x) / scale;
                let src_y = (y as f32 - offset.y) / scale;
                tensor[[0, 0, y, x]] = image.sample_bilinear(src_x, src_y) / 255.0;
            }
        }
        if let Some(slice) = tensor.as_slice_mut() {
            normalize_grayscale(slice);
        }
        (tensor, scale, offset)
    }
}

impl HandDetector for OnnxHandDetector {
    fn detect(&self, view_idx: usize, image: &ImageView) -> Result<[DetectorOutput; 2]> {
        let (input, scale, offset) = self.preprocess(image);

        let mut session = self.sessions[view_idx]
            .lock()
            .map_err(|_| anyhow!("Detection session lock poisoned"))?;
        let input_tensor = Tensor::from_array(input)?;
        let outputs = session
            .run(ort::inputs!["inputImg" => input_tensor])
            .context("Hand detection inference failed")?;

        let exists: ArrayViewD<f32> = outputs["hand_exists"].try_extract_array()?;
        let cx: ArrayViewD<f32> = outputs["cx"].try_extract_array()?;
        let cy: ArrayViewD<f32> = outputs["cy"].try_extract_array()?;
        let size: ArrayViewD<f32> = outputs["size"].try_extract_array()?;

        let mut result = [DetectorOutput::default(), DetectorOutput::default()];
        for hand_idx in 0..2 {
            let confidence = exists
                .iter()
                .nth(hand_idx)
                .copied()
                .context("Detection output too short")?;
            if confidence <= HAND_EXISTS_THRESHOLD {
                continue;
            }
            // モデル出力は [-1, 1] 正規化 → レターボックス座標 → フレーム座標
            let model_cx = cx.iter().nth(hand_idx).copied().unwrap_or(0.0);
            let model_cy = cy.iter().nth(hand_idx).copied().unwrap_or(0.0);
            let model_size = size.iter().nth(hand_idx).copied().unwrap_or(0.0);

            let letterbox = Vector2::new(
                (model_cx + 1.0) / 2.0 * DETECTION_INPUT_SIZE as f32,
                (model_cy + 1.0) / 2.0 * DETECTION_INPUT_SIZE as f32,
            );
            result[hand_idx] = DetectorOutput {
                found: true,
                center: (letterbox - offset) / scale,
                size_px: model_size * DETECTION_INPUT_SIZE as f32 * DETECTION_SIZE_FAC / scale,
                confidence,
            };
        }
        Ok(result)
    }
}

/// キーポイント推定のONNX実装
///
/// (view, hand) の4組それぞれに専用セッションを持つ。
pub struct OnnxKeypointEstimator {
    sessions: [[Mutex<Session>; 2]; 2],
    heatmap_size: u32,
}

impl OnnxKeypointEstimator {
    pub fn new<P: AsRef<Path>>(model_path: P, heatmap_size: u32) -> Result<Self> {
        let path = model_path.as_ref();
        Ok(Self {
            sessions: [
                [Mutex::new(build_session(path)?), Mutex::new(build_session(path)?)],
                [Mutex::new(build_session(path)?), Mutex::new(build_session(path)?)],
            ],
            heatmap_size,
        })
    }

    fn preprocess(&self, patch: &ImagePatch) -> Array4<f32> {
        let size = patch.size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 1, size, size));
        for y in 0..size {
            for x in 0..size {
                tensor[[0, 0, y, x]] = patch.get(x as u32, y as u32) as f32 / 255.0;
            }
        }
        if let Some(slice) = tensor.as_slice_mut() {
            normalize_grayscale(slice);
        }
        tensor
    }
}

impl KeypointEstimator for OnnxKeypointEstimator {
    fn estimate(&self, request: &KeypointRequest) -> Result<KeypointPrediction> {
        let input = self.preprocess(request.patch);

        let mut session = self.sessions[request.view_idx][request.hand_idx]
            .lock()
            .map_err(|_| anyhow!("Keypoint session lock poisoned"))?;
        let input_tensor = Tensor::from_array(input)?;
        let outputs = session
            .run(ort::inputs!["inputImg" => input_tensor])
            .context("Keypoint inference failed")?;

        let heatmap: ArrayViewD<f32> = outputs["heatmap"].try_extract_array()?;
        let heatmap = heatmap
            .as_slice()
            .context("Heatmap output not contiguous")?;

        let hm = self.heatmap_size as usize;
        let plane = hm * hm;
        anyhow::ensure!(
            heatmap.len() >= plane * KEYPOINT_COUNT,
            "Heatmap output too small: {}",
            heatmap.len()
        );

        let to_patch = request.patch.size as f32 / self.heatmap_size as f32;
        let mut prediction = KeypointPrediction::default();
        for i in 0..KEYPOINT_COUNT {
            let data = &heatmap[i * plane..(i + 1) * plane];
            let (peak_idx, peak_value) = argmax(data);
            let coarse_x = peak_idx % hm;
            let coarse_y = peak_idx / hm;
            let (rx, ry) = refine_peak(data, hm, coarse_x, coarse_y);
            prediction.points[i] = Vector2::new(rx * to_patch, ry * to_patch);
            prediction.confidences[i] = peak_value.clamp(0.0, 1.0);
        }
        Ok(prediction)
    }
}

fn argmax(data: &[f32]) -> (usize, f32) {
    let mut best_idx = 0;
    let mut best = data[0];
    for (i, v) in data.iter().enumerate().skip(1) {
        if *v > best {
            best = *v;
            best_idx = i;
        }
    }
    (best_idx, best)
}

/// ピーク近傍の重心でサブピクセル座標を求める
fn refine_peak(data: &[f32], width: usize, coarse_x: usize, coarse_y: usize) -> (f32, f32) {
    const KERNEL: usize = 3;
    let min_x = coarse_x.saturating_sub(KERNEL);
    let max_x = (coarse_x + KERNEL).min(width - 1);
    let min_y = coarse_y.saturating_sub(KERNEL);
    let max_y = (coarse_y + KERNEL).min(width - 1);

    let mut sum = 0.0f32;
    let mut sum_x = 0.0f32;
    let mut sum_y = 0.0f32;
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let v = data[y * width + x].max(0.0);
            sum += v;
            sum_x += v * (x as f32 + 0.5);
            sum_y += v * (y as f32 + 0.5);
        }
    }
    if sum <= 0.0 {
        return (coarse_x as f32 + 0.5, coarse_y as f32 + 0.5);
    }
    (sum_x / sum, sum_y / sum)
}
