use nalgebra::{Point3, Vector2, Vector3};

use crate::calibration::StereoCalibration;
use crate::camera::{boundary, ImageBoundary};
use crate::config::RoiConfig;
use crate::hand::HandJointIndex;
use crate::tracker::history::HandHistory;
use crate::tracker::roi::HandRoi;

/// 定速度外挿による次フレームのROI予測
///
/// 直近2サンプルから関節ごとの速度を有限差分で求め、lerp_factor で減衰させた
/// 外挿位置を各ビューへ再投影する。戻り値は [view0, view1]。
///
/// 履歴2サンプル未満とタイムスタンプ重複（ゼロ除算）は予測不能として
/// found=false を返す。ROIの使い回しは呼び出し側の仕事。
pub fn predict_rois(
    history: &HandHistory,
    now_ns: u64,
    calib: &StereoCalibration,
    px_scale: f32,
    frame_width: f32,
    frame_height: f32,
    config: &RoiConfig,
) -> [HandRoi; 2] {
    let none = [HandRoi::none(), HandRoi::none()];

    let Some((t_prev, prev)) = history.get_at_age(0) else {
        return none;
    };
    let Some((t_prev2, prev2)) = history.get_at_age(1) else {
        return none;
    };

    let dt_past = (t_prev.saturating_sub(t_prev2)) as f64 / 1e9;
    if dt_past <= 0.0 {
        return none; // タイムスタンプ重複
    }
    let dt_now = (now_ns.saturating_sub(t_prev)) as f64 / 1e9;
    let advance = (dt_now / dt_past) as f32 * config.lerp_factor;

    // 関節ごとの定速度外挿（左カメラ座標系）
    let mut predicted = [Point3::origin(); HandJointIndex::COUNT];
    for i in 0..HandJointIndex::COUNT {
        let p1 = prev.joints[i].position;
        let p2 = prev2.joints[i].position;
        predicted[i] = p1 + (p1 - p2) * advance;
    }

    let mut rois = [HandRoi::none(), HandRoi::none()];
    for view_idx in 0..2 {
        rois[view_idx] = roi_for_view(
            &predicted,
            calib,
            view_idx,
            px_scale,
            frame_width,
            frame_height,
            config,
        );
    }
    rois
}

fn roi_for_view(
    predicted: &[Point3<f32>; HandJointIndex::COUNT],
    calib: &StereoCalibration,
    view_idx: usize,
    px_scale: f32,
    frame_width: f32,
    frame_height: f32,
    config: &RoiConfig,
) -> HandRoi {
    let view = &calib.views[view_idx];

    let mut points = [None::<Vector2<f32>>; HandJointIndex::COUNT];
    let mut num_outside = 0u32;
    for i in 0..HandJointIndex::COUNT {
        let in_view: Vector3<f32> = if view_idx == 0 {
            predicted[i].coords
        } else {
            calib.right_in_left.inverse_transform_point(&predicted[i]).coords
        };
        match view.project(&in_view) {
            Some(px_cal) => {
                let px = px_cal / px_scale;
                points[i] = Some(px);
                if is_outside_view(&view.boundary, px, frame_width, frame_height) {
                    num_outside += 1;
                }
            }
            None => {
                num_outside += 1; // 投影不能（カメラ背後）も視野外扱い
            }
        }
    }

    // 視野外の関節が多すぎる → 手がフレームを出たと判定
    if num_outside > config.max_num_outside_view {
        return HandRoi::none();
    }

    let Some(center) = points[HandJointIndex::MiddleProximal as usize] else {
        return HandRoi::none();
    };
    let mut max_dist = 0.0f32;
    for p in points.iter().flatten() {
        max_dist = max_dist.max((p - center).norm());
    }

    HandRoi {
        center,
        size_px: max_dist * config.radius_inflation,
        found: true,
        confidence: 1.0,
    }
}

fn is_outside_view(
    shape: &ImageBoundary,
    px: Vector2<f32>,
    frame_width: f32,
    frame_height: f32,
) -> bool {
    boundary::is_outside(shape, px, frame_width, frame_height)
}
