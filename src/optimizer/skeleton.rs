use nalgebra::{Isometry3, Point3, UnitQuaternion, Vector3};

use crate::hand::{HandJointIndex, HandJointSet};

/// 正規化骨格の実測比率
///
/// 手首→中指付け根の直線距離が約1.0になるよう正規化してあり、hand_size を
/// 掛けてメートルにする。正準フレームは手首原点・指先方向が-Z・親指側が+X。

/// 指ごとのCMC（手根中手関節）の手首相対オフセット
const METACARPAL_OFFSETS: [[f32; 3]; 5] = [
    [0.33097, 0.0, -0.25968],   // thumb
    [0.16926, 0.0, -0.34437],   // index
    [0.034639, 0.0, -0.35573],  // middle
    [-0.063625, 0.0, -0.34164], // ring
    [-0.1509, 0.0, -0.30373],   // little
];

/// セグメント長。親指は3セグメント（CMC→MCP→IP→先端）、他は4。
const SEGMENT_LENGTHS: [[f32; 4]; 5] = [
    [0.389626, 0.311176, 0.232195, 0.0],  // thumb
    [0.66, 0.365719, 0.231581, 0.20179],  // index
    [0.645, 0.404486, 0.247749, 0.210121], // middle
    [0.58, 0.365639, 0.225666, 0.187089], // ring
    [0.52, 0.278197, 0.176178, 0.157566], // little
];

/// チェーン上の関節（CMCから先端へ）。親指は4要素目を使わない。
const CHAIN_JOINTS: [[HandJointIndex; 5]; 5] = {
    use HandJointIndex::*;
    [
        [
            ThumbMetacarpal,
            ThumbProximal,
            ThumbDistal,
            ThumbTip,
            ThumbTip,
        ],
        [
            IndexMetacarpal,
            IndexProximal,
            IndexIntermediate,
            IndexDistal,
            IndexTip,
        ],
        [
            MiddleMetacarpal,
            MiddleProximal,
            MiddleIntermediate,
            MiddleDistal,
            MiddleTip,
        ],
        [
            RingMetacarpal,
            RingProximal,
            RingIntermediate,
            RingDistal,
            RingTip,
        ],
        [
            LittleMetacarpal,
            LittleProximal,
            LittleIntermediate,
            LittleDistal,
            LittleTip,
        ],
    ]
};

pub const FINGER_COUNT: usize = 5;

/// 指のセグメント数。親指だけ3。
pub fn segment_count(finger: usize) -> usize {
    if finger == 0 {
        3
    } else {
        4
    }
}

pub fn segment_length(finger: usize, segment: usize) -> f32 {
    SEGMENT_LENGTHS[finger][segment]
}

pub fn chain_joint(finger: usize, index: usize) -> HandJointIndex {
    CHAIN_JOINTS[finger][index]
}

pub fn metacarpal_offset(finger: usize) -> Vector3<f32> {
    Vector3::from(METACARPAL_OFFSETS[finger])
}

/// セグメントの正準方向（正準フレーム内）
///
/// 指は真っ直ぐ-Z、親指はCMCオフセット方向に伸び続ける。
pub fn canonical_dir(finger: usize) -> Vector3<f32> {
    if finger == 0 {
        Vector3::from(METACARPAL_OFFSETS[0]).normalize()
    } else {
        Vector3::new(0.0, 0.0, -1.0)
    }
}

/// 手姿勢パラメータ
///
/// フレーム間でウォームスタートとして持ち回る唯一の姿勢表現。
/// セグメント回転は親相対で、恒等回転 = 正準方向（Tポーズ相当）。
#[derive(Debug, Clone)]
pub struct HandPoseParams {
    pub wrist: Isometry3<f32>,
    pub hand_size: f32,
    pub segment_rots: [[UnitQuaternion<f32>; 4]; 5],
}

impl HandPoseParams {
    /// Tポーズ（全セグメント正準方向）
    pub fn t_pose(wrist: Isometry3<f32>, hand_size: f32) -> Self {
        Self {
            wrist,
            hand_size,
            segment_rots: [[UnitQuaternion::identity(); 4]; 5],
        }
    }
}

/// 前進運動学: パラメータから26関節の位置と絶対姿勢を得る
///
/// 骨長は骨格定数 x hand_size で固定なので、出力は常に解剖学的に整合する。
/// 掌は中指の中手骨の中点に合成する。関節半径はここでは埋めない。
pub fn forward_kinematics(params: &HandPoseParams) -> HandJointSet {
    let mut set = HandJointSet::default();
    let size = params.hand_size;

    {
        let wrist = set.get_mut(HandJointIndex::Wrist);
        wrist.position = Point3::from(params.wrist.translation.vector);
        wrist.orientation = params.wrist.rotation;
    }

    for finger in 0..FINGER_COUNT {
        let base_dir = canonical_dir(finger);
        let mut pos = params.wrist * Point3::from(metacarpal_offset(finger) * size);
        let mut orient = params.wrist.rotation;

        {
            let cmc = set.get_mut(chain_joint(finger, 0));
            cmc.position = pos;
            cmc.orientation = orient;
        }

        for segment in 0..segment_count(finger) {
            orient = orient * params.segment_rots[finger][segment];
            pos += (orient * base_dir) * (segment_length(finger, segment) * size);
            let joint = set.get_mut(chain_joint(finger, segment + 1));
            joint.position = pos;
            joint.orientation = orient;
        }
    }

    // 掌: 中指の中手骨中点
    let mc = set.get(HandJointIndex::MiddleMetacarpal).position;
    let pxm = set.get(HandJointIndex::MiddleProximal).position;
    let palm = set.get_mut(HandJointIndex::Palm);
    palm.position = Point3::from((mc.coords + pxm.coords) * 0.5);
    palm.orientation = params.wrist.rotation;

    set
}
