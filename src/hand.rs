use nalgebra::{Isometry3, Point3, UnitQuaternion};

/// 26関節の手スケルトンのインデックス（OpenXR準拠の並び）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum HandJointIndex {
    Palm = 0,
    Wrist = 1,
    ThumbMetacarpal = 2,
    ThumbProximal = 3,
    ThumbDistal = 4,
    ThumbTip = 5,
    IndexMetacarpal = 6,
    IndexProximal = 7,
    IndexIntermediate = 8,
    IndexDistal = 9,
    IndexTip = 10,
    MiddleMetacarpal = 11,
    MiddleProximal = 12,
    MiddleIntermediate = 13,
    MiddleDistal = 14,
    MiddleTip = 15,
    RingMetacarpal = 16,
    RingProximal = 17,
    RingIntermediate = 18,
    RingDistal = 19,
    RingTip = 20,
    LittleMetacarpal = 21,
    LittleProximal = 22,
    LittleIntermediate = 23,
    LittleDistal = 24,
    LittleTip = 25,
}

impl HandJointIndex {
    pub const COUNT: usize = 26;

    pub fn from_index(index: usize) -> Option<Self> {
        use HandJointIndex::*;
        const ALL: [HandJointIndex; 26] = [
            Palm,
            Wrist,
            ThumbMetacarpal,
            ThumbProximal,
            ThumbDistal,
            ThumbTip,
            IndexMetacarpal,
            IndexProximal,
            IndexIntermediate,
            IndexDistal,
            IndexTip,
            MiddleMetacarpal,
            MiddleProximal,
            MiddleIntermediate,
            MiddleDistal,
            MiddleTip,
            RingMetacarpal,
            RingProximal,
            RingIntermediate,
            RingDistal,
            RingTip,
            LittleMetacarpal,
            LittleProximal,
            LittleIntermediate,
            LittleDistal,
            LittleTip,
        ];
        ALL.get(index).copied()
    }

    /// 運動学チェーン上の親関節。手首がルート。
    pub fn parent(self) -> Option<Self> {
        use HandJointIndex::*;
        match self {
            Wrist => None,
            Palm | ThumbMetacarpal | IndexMetacarpal | MiddleMetacarpal | RingMetacarpal
            | LittleMetacarpal => Some(Wrist),
            other => Self::from_index(other as usize - 1),
        }
    }
}

/// ニューラルネットが出力するキーポイント数（手首 + 5指 x 4関節）
pub const KEYPOINT_COUNT: usize = 21;

/// モデルの21キーポイント → 26関節の対応
///
/// 指の中手骨関節（付け根）と掌はモデル出力に含まれず、骨格側で合成する。
/// 親指はキーポイント0番目がCMC（中手骨関節）に当たる。
pub const KEYPOINT_TO_JOINT: [HandJointIndex; KEYPOINT_COUNT] = {
    use HandJointIndex::*;
    [
        Wrist,
        ThumbMetacarpal,
        ThumbProximal,
        ThumbDistal,
        ThumbTip,
        IndexProximal,
        IndexIntermediate,
        IndexDistal,
        IndexTip,
        MiddleProximal,
        MiddleIntermediate,
        MiddleDistal,
        MiddleTip,
        RingProximal,
        RingIntermediate,
        RingDistal,
        RingTip,
        LittleProximal,
        LittleIntermediate,
        LittleDistal,
        LittleTip,
    ]
};

/// 単一関節の姿勢
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointPose {
    pub position: Point3<f32>,
    pub orientation: UnitQuaternion<f32>,
    /// 関節から皮膚までの距離（メートル、表示用）
    pub radius: f32,
}

impl Default for JointPose {
    fn default() -> Self {
        Self {
            position: Point3::origin(),
            orientation: UnitQuaternion::identity(),
            radius: 0.0,
        }
    }
}

/// 26関節の手姿勢。毎フレーム新規生成され、呼び出し側に所有権ごと渡る。
///
/// 関節位置は root 相対。root が恒等なら左カメラ座標系そのもの。
#[derive(Debug, Clone)]
pub struct HandJointSet {
    pub root: Isometry3<f32>,
    pub joints: [JointPose; HandJointIndex::COUNT],
}

impl Default for HandJointSet {
    fn default() -> Self {
        Self {
            root: Isometry3::identity(),
            joints: [JointPose::default(); HandJointIndex::COUNT],
        }
    }
}

impl HandJointSet {
    pub fn get(&self, index: HandJointIndex) -> &JointPose {
        &self.joints[index as usize]
    }

    pub fn get_mut(&mut self, index: HandJointIndex) -> &mut JointPose {
        &mut self.joints[index as usize]
    }
}

/// 実測ベースの関節半径を適用する
///
/// hand_size は手首→中指付け根の距離（メートル）。基準0.09mに対して比例させる。
pub fn apply_joint_radii(set: &mut HandJointSet, hand_size: f32) {
    const THUMB: [f32; 4] = [0.016, 0.014, 0.012, 0.012];
    const FINGER_JOINT: [f32; 5] = [0.022, 0.021, 0.022, 0.021, 0.02];
    const FINGER_SCALE: [f32; 4] = [1.0, 1.0, 0.83, 0.75];
    let mul = hand_size / 0.09;

    for (i, r) in THUMB.iter().enumerate() {
        set.joints[HandJointIndex::ThumbMetacarpal as usize + i].radius = r * mul;
    }
    for finger in 0..4 {
        for joint in 0..5 {
            let idx = HandJointIndex::IndexMetacarpal as usize + finger * 5 + joint;
            set.joints[idx].radius = FINGER_JOINT[joint] * FINGER_SCALE[finger] * 0.5 * mul;
        }
    }
    // ノギス実測値
    set.get_mut(HandJointIndex::Palm).radius = 0.032 * 0.5 * mul;
    set.get_mut(HandJointIndex::Wrist).radius = 0.040 * 0.5 * mul;
}

/// 親指と人差し指の先端が近いとき互いに引き寄せる
///
/// XRクライアントのピンチ判定は先端同士の接触を見るものが多く、
/// モデル出力のわずかな隙間で取りこぼす。近接時のみ比例ドラッグで補助する。
pub fn apply_pinch_assist(set: &mut HandJointSet) {
    const MAX_RADIUS: f32 = 0.05;
    const MAX_DRAG: f32 = 0.85;

    let thumb = set.get(HandJointIndex::ThumbTip).position;
    let index = set.get(HandJointIndex::IndexTip).position;
    let between = index - thumb;
    let length = between.norm();
    if length > MAX_RADIUS || length < 1e-6 {
        return;
    }

    let amount = (1.0 - length / MAX_RADIUS) * MAX_DRAG;
    set.get_mut(HandJointIndex::ThumbTip).position = thumb + between * (amount * 0.5);
    set.get_mut(HandJointIndex::IndexTip).position = index - between * (amount * 0.5);
}
