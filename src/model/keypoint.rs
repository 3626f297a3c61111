use anyhow::Result;
use nalgebra::Vector2;

use crate::hand::KEYPOINT_COUNT;
use crate::image::ImagePatch;
use crate::model::crop::SimilarityWarp;

/// キーポイント推論への入力
///
/// パッチに加えて (view, hand) とワープを渡す。ビュー・手ごとに別セッションを
/// 持つ実装があるため文脈が要る。
pub struct KeypointRequest<'a> {
    pub patch: &'a ImagePatch,
    pub view_idx: usize,
    pub hand_idx: usize,
    pub warp: SimilarityWarp,
}

/// キーポイント推論の出力。座標はパッチのピクセル座標。
#[derive(Debug, Clone)]
pub struct KeypointPrediction {
    pub points: [Vector2<f32>; KEYPOINT_COUNT],
    pub confidences: [f32; KEYPOINT_COUNT],
}

impl Default for KeypointPrediction {
    fn default() -> Self {
        Self {
            points: [Vector2::zeros(); KEYPOINT_COUNT],
            confidences: [0.0; KEYPOINT_COUNT],
        }
    }
}

/// キーポイント推定モデル
///
/// (view, hand) ごとに独立して並行呼び出しされるため Send + Sync が必要。
pub trait KeypointEstimator: Send + Sync {
    fn estimate(&self, request: &KeypointRequest) -> Result<KeypointPrediction>;
}
