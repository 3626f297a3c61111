use nalgebra::Vector2;
use tracing::trace;

use crate::calibration::StereoCalibration;
use crate::config::DetectionConfig;
use crate::model::DetectorOutput;
use crate::optimizer::triangulate::closest_approach;
use crate::tracker::roi::HandRoi;

/// 全画面検出を今フレーム走らせるか
///
/// 両手とも追跡中なら高価な全画面検出はスキップする。どちらかが未捕捉なら
/// 周期ごとに走らせる。デバッグ用に毎フレーム強制も可能。
pub fn should_run_detection(
    config: &DetectionConfig,
    frame_counter: u64,
    tracked: [bool; 2],
) -> bool {
    if config.always_run {
        return true;
    }
    if tracked[0] && tracked[1] {
        return false;
    }
    frame_counter % config.interval.max(1) == 0
}

/// 両ビューの検出結果を手スロットごとに照合する
///
/// 受理条件: 両ビューで検出され、信頼度の合計が閾値以上であること。
/// 片ビューだけの検出は裏付けがないため棄却する。有効なら左右ビュー間の
/// 中心レイ角度整合も確認し、片カメラの誤検出を弾く。
///
/// 既に追跡中の手は検出結果を無視する（予測ROI優先 — 検出器は捕捉専用）。
/// 戻り値は手スロットごとの [view0, view1] ROI。
pub fn reconcile_detections(
    outputs: &[[DetectorOutput; 2]; 2], // [view][hand]
    tracked: [bool; 2],
    calib: &StereoCalibration,
    px_scale: f32,
    config: &DetectionConfig,
) -> [Option<[HandRoi; 2]>; 2] {
    let mut result = [None, None];

    for hand_idx in 0..2 {
        if tracked[hand_idx] {
            continue;
        }
        let left = outputs[0][hand_idx];
        let right = outputs[1][hand_idx];
        if !(left.found && right.found) {
            continue;
        }
        if left.confidence + right.confidence < config.accept_sum_threshold {
            trace!(
                hand = hand_idx,
                sum = left.confidence + right.confidence,
                "detection rejected: confidence sum below threshold"
            );
            continue;
        }
        if config.check_cross_view_angle
            && !centers_agree(&left.center, &right.center, calib, px_scale, config)
        {
            trace!(hand = hand_idx, "detection rejected: cross-view rays diverge");
            continue;
        }

        result[hand_idx] = Some([roi_from_detection(&left), roi_from_detection(&right)]);
    }
    result
}

/// 左右ビューの検出中心が同じ対象を指しているか（レイ整合）
///
/// 中心レイ同士を三角測量し、最接近距離を深度に対する角度として評価する。
/// 素朴なレイ角度比較は基線の収束角（近距離で10度超）を誤検出として
/// 数えてしまうため、基線込みの交差判定にする。
fn centers_agree(
    left_center: &Vector2<f32>,
    right_center: &Vector2<f32>,
    calib: &StereoCalibration,
    px_scale: f32,
    config: &DetectionConfig,
) -> bool {
    let ray_left = calib.views[0].unproject(&(left_center * px_scale));
    let ray_right_local = calib.views[1].unproject(&(right_center * px_scale));
    let ray_right = calib.right_in_left.rotation * ray_right_local;
    let right_origin = nalgebra::Point3::from(calib.right_in_left.translation.vector);

    let Some((midpoint, miss)) = closest_approach(&ray_left, &right_origin, &ray_right) else {
        return false; // 交差しないレイ対は別対象
    };
    let depth = midpoint.coords.norm();
    if depth < 1e-6 {
        return false;
    }
    miss / depth <= config.max_cross_view_angle_deg.to_radians().tan()
}

fn roi_from_detection(output: &DetectorOutput) -> HandRoi {
    HandRoi {
        center: output.center,
        size_px: output.size_px,
        found: true,
        confidence: output.confidence,
    }
}
