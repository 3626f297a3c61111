use anyhow::Result;
use nalgebra::{Isometry3, Point3, UnitQuaternion};

use crate::optimizer::ray_fit::{rotation_between_robust, segment_target_index};
use crate::optimizer::skeleton::{
    canonical_dir, forward_kinematics, metacarpal_offset, segment_count, segment_length,
    FINGER_COUNT, HandPoseParams,
};
use crate::optimizer::triangulate::{joint_targets, wrist_frame_from_targets};
use crate::optimizer::{KinematicSolver, OneFrameInput, SolverOutput};

/// CCD-IK ソルバー（代替バックエンド）
///
/// 指ごとに末端から順へ、チェーン先端が目標へ向くようセグメントを回す
/// 古典的な cyclic coordinate descent。手サイズ推定は行わない簡易経路で、
/// 棄却ゲートは融合ステージ側の共通処理に任せる。
pub struct CcdIkSolver {
    iterations: usize,
}

impl CcdIkSolver {
    pub fn new(iterations: usize) -> Self {
        Self {
            iterations: iterations.max(1),
        }
    }
}

impl KinematicSolver for CcdIkSolver {
    fn optimize(
        &mut self,
        input: &OneFrameInput,
        right_in_left: &Isometry3<f32>,
        warm_start: Option<&HandPoseParams>,
        target_hand_size: f32,
    ) -> Result<SolverOutput> {
        let targets = joint_targets(input, right_in_left, warm_start)?;
        let wrist = wrist_frame_from_targets(&targets)?;

        let mut params = match warm_start {
            Some(prev) => {
                let mut p = prev.clone();
                p.wrist = wrist;
                p.hand_size = target_hand_size;
                p
            }
            None => HandPoseParams::t_pose(wrist, target_hand_size),
        };

        for _ in 0..self.iterations {
            for finger in 0..FINGER_COUNT {
                let n = segment_count(finger);
                let tip_target = targets[segment_target_index(finger, n - 1)];

                for segment in (0..n).rev() {
                    let (positions, orients) = finger_chain(&params, finger);
                    let joint_pos = positions[segment];
                    let tip_pos = positions[n];

                    let v1 = tip_pos - joint_pos;
                    let v2 = tip_target - joint_pos;
                    if v1.norm() < 1e-6 || v2.norm() < 1e-6 {
                        continue;
                    }
                    let delta = rotation_between_robust(&v1.normalize(), &v2.normalize());

                    let parent_orient = if segment == 0 {
                        params.wrist.rotation
                    } else {
                        orients[segment - 1]
                    };
                    let rel = params.segment_rots[finger][segment];
                    params.segment_rots[finger][segment] =
                        parent_orient.inverse() * delta * parent_orient * rel;
                }
            }
        }

        let joints = forward_kinematics(&params);
        Ok(SolverOutput {
            params,
            joints,
            measured_hand_size: None,
        })
    }
}

/// 1本の指のチェーン状態を前進計算する
///
/// positions[0] = CMC、positions[i+1] = セグメントiの終端。
/// orients[i] = セグメントiのワールド姿勢。親指は末尾要素を使わない。
fn finger_chain(
    params: &HandPoseParams,
    finger: usize,
) -> ([Point3<f32>; 5], [UnitQuaternion<f32>; 4]) {
    let size = params.hand_size;
    let base_dir = canonical_dir(finger);

    let mut positions = [Point3::origin(); 5];
    let mut orients = [UnitQuaternion::identity(); 4];

    let mut pos = params.wrist * Point3::from(metacarpal_offset(finger) * size);
    let mut orient = params.wrist.rotation;
    positions[0] = pos;

    for segment in 0..segment_count(finger) {
        orient = orient * params.segment_rots[finger][segment];
        pos += (orient * base_dir) * (segment_length(finger, segment) * size);
        positions[segment + 1] = pos;
        orients[segment] = orient;
    }

    (positions, orients)
}
