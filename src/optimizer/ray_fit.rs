use anyhow::Result;
use nalgebra::{Isometry3, Point3, UnitQuaternion, Vector3};

use crate::hand::KEYPOINT_COUNT;
use crate::optimizer::skeleton::{
    self, canonical_dir, forward_kinematics, metacarpal_offset, segment_count, segment_length,
    HandPoseParams,
};
use crate::optimizer::triangulate::{joint_targets, wrist_frame_from_targets};
use crate::optimizer::{KinematicSolver, OneFrameInput, SolverOutput};

/// レイ融合ソルバー（主バックエンド）
///
/// 1. 各キーポイントを両ビューのレイから三角測量する
///    （片ビューはウォームスタート深度で補完）
/// 2. 掌のキーポイントから手首フレームを構築する
/// 3. 骨長を固定したままセグメント回転を観測方向へ合わせる
///
/// 骨長が骨格定数で拘束されるため、出力は常に解剖学的に整合する。
pub struct RayFitSolver;

impl RayFitSolver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RayFitSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl KinematicSolver for RayFitSolver {
    fn optimize(
        &mut self,
        input: &OneFrameInput,
        right_in_left: &Isometry3<f32>,
        warm_start: Option<&HandPoseParams>,
        target_hand_size: f32,
    ) -> Result<SolverOutput> {
        let targets = joint_targets(input, right_in_left, warm_start)?;
        let wrist = wrist_frame_from_targets(&targets)?;

        // 手サイズの実測値: 手首→中指付け根（キーポイント9）
        let measured = (targets[9] - targets[0]).norm();

        let mut params = HandPoseParams::t_pose(wrist, target_hand_size);
        for finger in 0..skeleton::FINGER_COUNT {
            fit_finger(&mut params, finger, &targets);
        }

        let joints = forward_kinematics(&params);
        Ok(SolverOutput {
            params,
            joints,
            measured_hand_size: Some(measured),
        })
    }
}

/// キーポイント配列中の、指チェーンのセグメント目標のインデックス
///
/// 親指はキーポイント1がCMCそのものなので2から、他の指は付け根から。
pub(crate) fn segment_target_index(finger: usize, segment: usize) -> usize {
    if finger == 0 {
        2 + segment
    } else {
        1 + finger * 4 + segment
    }
}

/// 1本の指のセグメント回転を観測目標へ合わせる
///
/// CMCから順に、各セグメントの向きを目標方向へ回す。骨長は変えない。
fn fit_finger(params: &mut HandPoseParams, finger: usize, targets: &[Point3<f32>; KEYPOINT_COUNT]) {
    let base_dir = canonical_dir(finger);
    let size = params.hand_size;
    let mut pos = params.wrist * Point3::from(metacarpal_offset(finger) * size);
    let mut orient = params.wrist.rotation;

    for segment in 0..segment_count(finger) {
        let target = targets[segment_target_index(finger, segment)];
        let desired = target - pos;

        let rel = if desired.norm() < 1e-6 {
            UnitQuaternion::identity()
        } else {
            let desired_dir = desired.normalize();
            let current_dir = orient * base_dir;
            let delta = rotation_between_robust(&current_dir, &desired_dir);
            // 親相対に変換: orient_new = orient * rel = delta * orient
            orient.inverse() * delta * orient
        };

        params.segment_rots[finger][segment] = rel;
        orient = orient * rel;
        pos += (orient * base_dir) * (segment_length(finger, segment) * size);
    }
}

/// 反平行でも破綻しない rotation_between
pub(crate) fn rotation_between_robust(from: &Vector3<f32>, to: &Vector3<f32>) -> UnitQuaternion<f32> {
    match UnitQuaternion::rotation_between(from, to) {
        Some(q) => q,
        None => {
            // 反平行: from に直交する任意軸まわりの180度回転
            let axis = if from.x.abs() < 0.9 {
                from.cross(&Vector3::x())
            } else {
                from.cross(&Vector3::y())
            };
            UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(axis),
                std::f32::consts::PI,
            )
        }
    }
}
