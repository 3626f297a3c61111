use anyhow::{bail, Result};
use nalgebra::{Isometry3, Point3, UnitQuaternion, Vector3};

use crate::hand::KEYPOINT_COUNT;
use crate::optimizer::skeleton::{forward_kinematics, HandPoseParams};
use crate::optimizer::OneFrameInput;

/// 2本のレイの最接近点の中点と最接近距離
///
/// 左カメラを原点とし、d0は左レイ、o1/d1は右カメラ原点と右レイ
/// （すべて左カメラ座標系）。ほぼ平行なレイとカメラ背後の交点は None。
pub fn closest_approach(
    d0: &Vector3<f32>,
    o1: &Point3<f32>,
    d1: &Vector3<f32>,
) -> Option<(Point3<f32>, f32)> {
    // |t0*d0 - (o1 + t1*d1)| を最小化する t0, t1 を解く
    let w0 = -o1.coords; // 左カメラ原点 - 右カメラ原点
    let a = d0.dot(d0);
    let b = d0.dot(d1);
    let c = d1.dot(d1);
    let d = d0.dot(&w0);
    let e = d1.dot(&w0);

    let denom = a * c - b * b;
    if denom.abs() < 1e-9 {
        return None; // 平行レイ
    }
    let t0 = (b * e - c * d) / denom;
    let t1 = (a * e - b * d) / denom;
    if t0 <= 0.0 || t1 <= 0.0 {
        return None; // どちらかのカメラの背後
    }

    let p0 = d0 * t0;
    let p1 = o1.coords + d1 * t1;
    Some((Point3::from((p0 + p1) * 0.5), (p0 - p1).norm()))
}

/// 2本のレイの最接近点の中点による三角測量
pub fn triangulate_midpoint(
    d0: &Vector3<f32>,
    o1: &Point3<f32>,
    d1: &Vector3<f32>,
) -> Option<Point3<f32>> {
    closest_approach(d0, o1, d1).map(|(midpoint, _)| midpoint)
}

/// 観測レイから21キーポイントの3D目標点を作る
///
/// 両ビューあれば三角測量。片ビューのみの場合はウォームスタートの
/// 前フレーム深度をレイに沿って再利用する（単眼劣化モード）。
/// ウォームスタートなしの単眼は観測不足として失敗する。
pub fn joint_targets(
    input: &OneFrameInput,
    right_in_left: &Isometry3<f32>,
    warm_start: Option<&HandPoseParams>,
) -> Result<[Point3<f32>; KEYPOINT_COUNT]> {
    let left = &input.views[0];
    let right = &input.views[1];
    let right_origin = Point3::from(right_in_left.translation.vector);

    let mut targets = [Point3::origin(); KEYPOINT_COUNT];

    if left.active && right.active {
        // ウォームスタートがあれば三角測量の縮退時のフォールバックに使う
        let prev = warm_start.map(forward_kinematics);
        for i in 0..KEYPOINT_COUNT {
            let d1 = right_in_left.rotation * right.rays[i];
            match triangulate_midpoint(&left.rays[i], &right_origin, &d1) {
                Some(p) => targets[i] = p,
                None => match &prev {
                    Some(prev_set) => {
                        let depth = prev_set.joints[crate::hand::KEYPOINT_TO_JOINT[i] as usize]
                            .position
                            .coords
                            .norm();
                        targets[i] = Point3::from(left.rays[i] * depth);
                    }
                    None => bail!("Degenerate stereo observation for keypoint {}", i),
                },
            }
        }
        return Ok(targets);
    }

    // 単眼: 前フレームの深度を引き継ぐ
    let (view_idx, view) = if left.active {
        (0, left)
    } else if right.active {
        (1, right)
    } else {
        bail!("No active views");
    };
    let Some(warm) = warm_start else {
        bail!("Monocular observation without warm start");
    };
    let prev_set = forward_kinematics(warm);

    for i in 0..KEYPOINT_COUNT {
        let prev_pos = prev_set.joints[crate::hand::KEYPOINT_TO_JOINT[i] as usize].position;
        if view_idx == 0 {
            let depth = prev_pos.coords.norm();
            targets[i] = Point3::from(view.rays[i] * depth);
        } else {
            let depth = right_in_left.inverse_transform_point(&prev_pos).coords.norm();
            let d = right_in_left.rotation * view.rays[i];
            targets[i] = right_origin + d * depth;
        }
    }
    Ok(targets)
}

/// 掌のキーポイントから手首フレームを構築する
///
/// 前方 = 手首→中指付け根、側方 = 人差し指付け根→薬指付け根の直交化。
/// 正準フレーム（指先-Z・親指側+X）に合わせた回転を返す。
pub fn wrist_frame_from_targets(
    targets: &[Point3<f32>; KEYPOINT_COUNT],
) -> Result<Isometry3<f32>> {
    // キーポイント番号: 0=手首, 5=人差し指付け根, 9=中指付け根, 13=薬指付け根
    let wrist = targets[0];
    let forward = targets[9] - wrist;
    let side = targets[5] - targets[13];
    if forward.norm() < 1e-6 || side.norm() < 1e-6 {
        bail!("Degenerate palm observation");
    }

    let z_axis = (-forward).normalize();
    let side_n = side.normalize();
    let x_raw = side_n - z_axis * side_n.dot(&z_axis);
    if x_raw.norm() < 1e-6 {
        bail!("Palm axes are collinear");
    }
    let x_axis = x_raw.normalize();
    let y_axis = z_axis.cross(&x_axis);

    let rot = nalgebra::Rotation3::from_matrix_unchecked(nalgebra::Matrix3::from_columns(&[
        x_axis, y_axis, z_axis,
    ]));
    let quat = UnitQuaternion::from_rotation_matrix(&rot);
    Ok(Isometry3::from_parts(wrist.coords.into(), quat))
}
