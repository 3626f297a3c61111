use nalgebra::Vector2;
use tracing::warn;

use crate::calibration::StereoCalibration;
use crate::config::KeypointConfig;
use crate::hand::KEYPOINT_COUNT;
use crate::image::ImageView;
use crate::model::{
    extract_patch, KeypointEstimator, KeypointPrediction, KeypointRequest, SimilarityWarp,
};
use crate::optimizer::OneFrameInput;
use crate::tracker::roi::HandRoi;

/// キーポイント推論の1タスク（(view, hand) ごと）
#[derive(Debug, Clone, Copy)]
pub struct KeypointTask {
    pub view_idx: usize,
    pub hand_idx: usize,
    pub roi: HandRoi,
    /// クロップ回転角（前フレームの手首→中指方向から）
    pub angle: f32,
}

/// (view, hand) タスクを並列ディスパッチし、全タスク完了まで待つ
///
/// 各タスクは自分専用の出力スロットにだけ書くため、ワーカ間に共有可変状態は
/// ない。スコープ終端がバリアになり、部分結果が次段へ漏れることはない。
/// 失敗したタスクのビューは非アクティブのままになる（単眼劣化モード）。
///
/// 結果はワープ逆変換でフル画像座標へ戻し、カメラモデルでレイへ変換して
/// OneFrameInput（手ごと）に詰める。ピクセル座標はここから先へ出ない。
pub fn dispatch_keypoints(
    estimator: &dyn KeypointEstimator,
    views: &[ImageView; 2],
    tasks: &[KeypointTask],
    calib: &StereoCalibration,
    px_scale: f32,
    config: &KeypointConfig,
) -> [OneFrameInput; 2] {
    let input_size = config.input_size;
    let mut slots: Vec<Option<(KeypointTask, SimilarityWarp, KeypointPrediction)>> =
        (0..tasks.len()).map(|_| None).collect();

    rayon::scope(|scope| {
        for (task, slot) in tasks.iter().zip(slots.iter_mut()) {
            scope.spawn(move |_| {
                let view = &views[task.view_idx];
                let mirror = task.hand_idx == 1;
                let Some(warp) = SimilarityWarp::from_roi(
                    task.roi.center,
                    task.roi.size_px,
                    task.angle,
                    mirror,
                    input_size,
                ) else {
                    return; // 縮退ROI
                };
                let patch = extract_patch(view, &warp, input_size);
                let request = KeypointRequest {
                    patch: &patch,
                    view_idx: task.view_idx,
                    hand_idx: task.hand_idx,
                    warp,
                };
                match estimator.estimate(&request) {
                    Ok(prediction) => *slot = Some((*task, warp, prediction)),
                    Err(e) => {
                        warn!(
                            view = task.view_idx,
                            hand = task.hand_idx,
                            error = %e,
                            "keypoint inference failed, view inactive this frame"
                        );
                    }
                }
            });
        }
    });

    let mut inputs = [OneFrameInput::default(), OneFrameInput::default()];
    for entry in slots.into_iter().flatten() {
        let (task, warp, prediction) = entry;
        let camera = &calib.views[task.view_idx];
        let view_input = &mut inputs[task.hand_idx].views[task.view_idx];
        for i in 0..KEYPOINT_COUNT {
            let full_px = warp.apply_inv(prediction.points[i]);
            let cal_px: Vector2<f32> = full_px * px_scale;
            view_input.rays[i] = camera.unproject(&cal_px);
            view_input.confidences[i] = prediction.confidences[i];
        }
        view_input.active = true;
    }
    inputs
}
