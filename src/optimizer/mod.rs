pub mod ccdik;
pub mod ray_fit;
pub mod skeleton;
pub mod triangulate;

use anyhow::Result;
use nalgebra::{Isometry3, Vector3};
use tracing::{debug, trace, warn};

use crate::config::{FusionConfig, SolverBackend};
use crate::hand::{HandJointSet, KEYPOINT_COUNT, KEYPOINT_TO_JOINT};
use self::skeleton::HandPoseParams;

/// 1ビュー分の観測: キーポイントごとの単位方向レイと信頼度
///
/// レイはそのビューのカメラ座標系。ピクセル座標はこの境界を越えない。
#[derive(Debug, Clone)]
pub struct OneViewInput {
    pub active: bool,
    pub rays: [Vector3<f32>; KEYPOINT_COUNT],
    pub confidences: [f32; KEYPOINT_COUNT],
}

impl Default for OneViewInput {
    fn default() -> Self {
        Self {
            active: false,
            rays: [Vector3::new(0.0, 0.0, 1.0); KEYPOINT_COUNT],
            confidences: [0.0; KEYPOINT_COUNT],
        }
    }
}

/// オプティマイザへ渡す1フレーム分の観測
/// （キーポイントディスパッチャとの唯一の受け渡し契約）
#[derive(Debug, Clone, Default)]
pub struct OneFrameInput {
    pub views: [OneViewInput; 2],
}

impl OneFrameInput {
    pub fn num_active_views(&self) -> usize {
        self.views.iter().filter(|v| v.active).count()
    }
}

/// ソルバーバックエンドの出力
///
/// 再投影誤差はバックエンドではなく融合ステージ側で共通計算する。
/// バックエンドを差し替えても受理契約が変わらないようにするため。
pub struct SolverOutput {
    pub params: HandPoseParams,
    pub joints: HandJointSet,
    /// 観測から測った手サイズ。推定しないバックエンドは None。
    pub measured_hand_size: Option<f32>,
}

/// 運動学ソルバーバックエンド（ブラックボックス）
pub trait KinematicSolver: Send {
    fn optimize(
        &mut self,
        input: &OneFrameInput,
        right_in_left: &Isometry3<f32>,
        warm_start: Option<&HandPoseParams>,
        target_hand_size: f32,
    ) -> Result<SolverOutput>;
}

/// 手サイズ校正の進行スケジュール
///
/// 良質な観測を受理するたびに進み、飽和すると校正をロックする。
#[derive(Debug, Clone)]
pub struct RefinementSchedule {
    progress: f32,
    frame_max: f32,
}

impl RefinementSchedule {
    pub fn new(frame_max: f32) -> Self {
        Self {
            progress: 0.0,
            frame_max,
        }
    }

    /// 校正済み度合い: (progress / frame_max)^2 を [0,1] にクランプ
    ///
    /// 0 = 測定値を全面的に信じる、1 = 現在の推定に固定。
    pub fn weight(&self) -> f32 {
        let x = self.progress / self.frame_max;
        (x * x).clamp(0.0, 1.0)
    }

    pub fn saturated(&self) -> bool {
        self.progress >= self.frame_max
    }

    /// 受理フレームの信頼度分だけ前進（単調非減少）
    pub fn advance(&mut self, confidence: f32) {
        self.progress += confidence.max(0.0);
    }

    pub fn reset(&mut self) {
        self.progress = 0.0;
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }
}

/// 手ごとの持続状態。フレーム間で生き残る唯一の可変オブジェクト。
#[derive(Debug, Clone)]
pub struct KinematicHandState {
    /// 前フレームの解（ウォームスタート用）
    pub prev_params: Option<HandPoseParams>,
    pub target_hand_size: f32,
    pub refinement: RefinementSchedule,
    /// この手を一度でも見たことがあるか（新規ユーザー判定用）
    pub seen_before: bool,
}

impl KinematicHandState {
    fn new(config: &FusionConfig) -> Self {
        Self {
            prev_params: None,
            target_hand_size: config.initial_hand_size,
            refinement: RefinementSchedule::new(config.refinement_frame_max),
            seen_before: false,
        }
    }

    /// 捕捉喪失・新規ユーザー時のリセット
    ///
    /// 手サイズは次の捕捉の初期推定として残し、スケジュールだけ0に戻す。
    fn reset(&mut self) {
        self.prev_params = None;
        self.refinement.reset();
    }
}

/// 融合結果
pub struct FusionResult {
    pub joints: HandJointSet,
    pub reprojection_error: f32,
    pub confidence: f32,
}

/// 運動学融合ステージ
///
/// バックエンドを包み、棄却ゲート・手サイズ校正・ウォームスタート状態を
/// 一元管理する。棄却された結果は履歴にも状態にも反映させない。
pub struct FusionStage {
    config: FusionConfig,
    states: [KinematicHandState; 2],
    solvers: [Box<dyn KinematicSolver>; 2],
}

impl FusionStage {
    pub fn new(config: &FusionConfig) -> Self {
        let make_solver = || -> Box<dyn KinematicSolver> {
            match config.backend {
                SolverBackend::RayFit => Box::new(ray_fit::RayFitSolver::new()),
                SolverBackend::CcdIk => {
                    Box::new(ccdik::CcdIkSolver::new(config.ccdik_iterations))
                }
            }
        };
        Self {
            config: config.clone(),
            states: [
                KinematicHandState::new(config),
                KinematicHandState::new(config),
            ],
            solvers: [make_solver(), make_solver()],
        }
    }

    pub fn state(&self, hand_idx: usize) -> &KinematicHandState {
        &self.states[hand_idx]
    }

    /// 捕捉喪失時のリセット（状態機械の ACQUIRING 遷移から呼ばれる）
    pub fn reset_hand(&mut self, hand_idx: usize) {
        self.states[hand_idx].reset();
    }

    /// 新規ユーザー: 両手の履歴的状態を全て初期化
    pub fn reset_all(&mut self) {
        for state in &mut self.states {
            state.reset();
            state.seen_before = false;
            state.target_hand_size = self.config.initial_hand_size;
        }
    }

    #[cfg(test)]
    pub(crate) fn set_max_reprojection_error(&mut self, value: f32) {
        self.config.max_reprojection_error = value;
    }

    /// 1つの手を融合する
    ///
    /// 棄却（誤差超過・観測不足・ソルバー失敗）は None。呼び出し側は
    /// None を受けたら ACQUIRING 遷移として履歴を消す契約。
    pub fn process_hand(
        &mut self,
        hand_idx: usize,
        input: &OneFrameInput,
        right_in_left: &Isometry3<f32>,
        tracked_last_frame: bool,
    ) -> Option<FusionResult> {
        if input.num_active_views() == 0 {
            return None;
        }

        let warm_params = if tracked_last_frame {
            self.states[hand_idx].prev_params.clone()
        } else {
            None
        };

        let output = match self.solvers[hand_idx].optimize(
            input,
            right_in_left,
            warm_params.as_ref(),
            self.states[hand_idx].target_hand_size,
        ) {
            Ok(output) => output,
            Err(e) => {
                trace!(hand = hand_idx, error = %e, "solver failed");
                return None;
            }
        };

        let error = reprojection_error(&output.joints, input, right_in_left);
        if !error.is_finite() || error > self.config.max_reprojection_error {
            debug!(
                hand = hand_idx,
                error, "fusion rejected: reprojection error over threshold"
            );
            return None;
        }

        let confidence = hand_confidence_value(input, error);
        let state = &mut self.states[hand_idx];

        // 手サイズ校正: 両ビュー観測時のみ（単眼ではサイズが不定）、飽和前のみ
        if input.num_active_views() == 2 && !state.refinement.saturated() {
            if let Some(measured) = output.measured_hand_size {
                let weight = state.refinement.weight();
                let blended = measured * (1.0 - weight) + state.target_hand_size * weight;
                let clamped = blended.clamp(self.config.min_hand_size, self.config.max_hand_size);
                if clamped != blended {
                    warn!(
                        hand = hand_idx,
                        measured, "hand size estimate clamped to configured range"
                    );
                }
                state.target_hand_size = clamped;
                state.refinement.advance(confidence);
            }
        }

        state.prev_params = Some(output.params);
        state.seen_before = true;

        Some(FusionResult {
            joints: output.joints,
            reprojection_error: error,
            confidence,
        })
    }
}

/// 共通の再投影誤差
///
/// モデル関節をカメラに向け直した方向と観測レイの角度差の信頼度加重平均
/// （ラジアン）。どのバックエンドの出力にも同じ尺度を適用する。
pub fn reprojection_error(
    joints: &HandJointSet,
    input: &OneFrameInput,
    right_in_left: &Isometry3<f32>,
) -> f32 {
    let mut weighted_sum = 0.0f32;
    let mut weight_total = 0.0f32;

    for (view_idx, view) in input.views.iter().enumerate() {
        if !view.active {
            continue;
        }
        for i in 0..KEYPOINT_COUNT {
            let p = joints.joints[KEYPOINT_TO_JOINT[i] as usize].position;
            let in_view = if view_idx == 0 {
                p.coords
            } else {
                right_in_left.inverse_transform_point(&p).coords
            };
            if in_view.norm() < 1e-6 {
                continue;
            }
            let model_dir = in_view.normalize();
            let angle = model_dir
                .dot(&view.rays[i])
                .clamp(-1.0, 1.0)
                .acos();
            let w = view.confidences[i].max(0.0);
            weighted_sum += angle * w;
            weight_total += w;
        }
    }

    if weight_total <= 0.0 {
        return f32::INFINITY;
    }
    weighted_sum / weight_total
}

/// 合成信頼度: 全アクティブビューの平均キーポイント信頼度を
/// 再投影誤差で減衰させた値
pub fn hand_confidence_value(input: &OneFrameInput, reprojection_error: f32) -> f32 {
    let mut sum = 0.0f32;
    let mut count = 0usize;
    for view in &input.views {
        if !view.active {
            continue;
        }
        sum += view.confidences.iter().sum::<f32>();
        count += KEYPOINT_COUNT;
    }
    if count == 0 {
        return 0.0;
    }
    (sum / count as f32) / (1.0 + reprojection_error.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FusionConfig;
    use nalgebra::{Point3, Translation3, UnitQuaternion};

    fn stereo_pose() -> Isometry3<f32> {
        Isometry3::from_parts(
            Translation3::new(0.064, 0.0, 0.0),
            UnitQuaternion::identity(),
        )
    }

    /// 骨格Tポーズから整合した両眼観測を合成する
    fn synthetic_input(wrist_pos: Point3<f32>, hand_size: f32) -> OneFrameInput {
        let params = HandPoseParams::t_pose(
            Isometry3::from_parts(wrist_pos.coords.into(), UnitQuaternion::identity()),
            hand_size,
        );
        let set = skeleton::forward_kinematics(&params);
        let stereo = stereo_pose();

        let mut input = OneFrameInput::default();
        for view_idx in 0..2 {
            input.views[view_idx].active = true;
            for i in 0..KEYPOINT_COUNT {
                let p = set.joints[KEYPOINT_TO_JOINT[i] as usize].position;
                let ray = if view_idx == 0 {
                    p.coords.normalize()
                } else {
                    stereo.inverse_transform_point(&p).coords.normalize()
                };
                input.views[view_idx].rays[i] = ray;
                input.views[view_idx].confidences[i] = 0.9;
            }
        }
        input
    }

    #[test]
    fn test_schedule_monotonic_and_clamped() {
        let mut schedule = RefinementSchedule::new(100.0);
        assert_eq!(schedule.weight(), 0.0);

        let mut last = 0.0;
        for _ in 0..150 {
            schedule.advance(1.0);
            let w = schedule.weight();
            assert!(w >= last, "weight must be non-decreasing");
            assert!((0.0..=1.0).contains(&w), "weight must stay in [0,1]");
            last = w;
        }
        // frame_max超過後もクランプされる
        assert_eq!(schedule.weight(), 1.0);
        assert!(schedule.saturated());

        schedule.reset();
        assert_eq!(schedule.weight(), 0.0);
        assert!(!schedule.saturated());
    }

    #[test]
    fn test_schedule_ignores_negative_confidence() {
        let mut schedule = RefinementSchedule::new(100.0);
        schedule.advance(-5.0);
        assert_eq!(schedule.progress(), 0.0);
    }

    #[test]
    fn test_confidence_value() {
        let mut input = OneFrameInput::default();
        for view in &mut input.views {
            view.active = true;
            view.confidences = [0.8; KEYPOINT_COUNT];
        }
        assert!((hand_confidence_value(&input, 0.0) - 0.8).abs() < 1e-6);
        assert!((hand_confidence_value(&input, 1.0) - 0.4).abs() < 1e-6);

        // 単眼でも平均は同じ
        input.views[1].active = false;
        assert!((hand_confidence_value(&input, 0.0) - 0.8).abs() < 1e-6);

        // 観測なしは0
        input.views[0].active = false;
        assert_eq!(hand_confidence_value(&input, 0.0), 0.0);
    }

    #[test]
    fn test_fusion_accepts_consistent_observation() {
        let config = FusionConfig::default();
        let mut fusion = FusionStage::new(&config);
        let input = synthetic_input(Point3::new(0.0, 0.0, 0.4), config.initial_hand_size);
        let result = fusion.process_hand(0, &input, &stereo_pose(), false);
        assert!(result.is_some());
        let result = result.unwrap();
        assert!(
            result.reprojection_error < 0.05,
            "consistent input should have near-zero error, got {}",
            result.reprojection_error
        );
        assert!(fusion.state(0).prev_params.is_some());
        assert!(fusion.state(0).seen_before);
    }

    #[test]
    fn test_rejection_leaves_state_untouched() {
        let config = FusionConfig::default();
        let mut fusion = FusionStage::new(&config);
        // 閾値を不可能な値にして必ず棄却させる
        fusion.set_max_reprojection_error(-1.0);
        let input = synthetic_input(Point3::new(0.0, 0.0, 0.4), config.initial_hand_size);
        let size_before = fusion.state(0).target_hand_size;

        let result = fusion.process_hand(0, &input, &stereo_pose(), false);
        assert!(result.is_none());
        // 棄却は何も残さない: ウォームスタートも手サイズもスケジュールも不変
        assert!(fusion.state(0).prev_params.is_none());
        assert_eq!(fusion.state(0).target_hand_size, size_before);
        assert_eq!(fusion.state(0).refinement.progress(), 0.0);
    }

    #[test]
    fn test_no_observation_returns_none() {
        let config = FusionConfig::default();
        let mut fusion = FusionStage::new(&config);
        let input = OneFrameInput::default();
        assert!(fusion
            .process_hand(0, &input, &stereo_pose(), false)
            .is_none());
    }

    #[test]
    fn test_monocular_does_not_advance_refinement() {
        let config = FusionConfig::default();
        let mut fusion = FusionStage::new(&config);
        // まず両眼で捕捉してウォームスタートを作る
        let input = synthetic_input(Point3::new(0.0, 0.0, 0.4), config.initial_hand_size);
        assert!(fusion
            .process_hand(0, &input, &stereo_pose(), false)
            .is_some());
        let progress_after_stereo = fusion.state(0).refinement.progress();
        assert!(progress_after_stereo > 0.0);

        // 単眼フレームではスケジュールが進まない
        let mut mono = input.clone();
        mono.views[1].active = false;
        assert!(fusion
            .process_hand(0, &mono, &stereo_pose(), true)
            .is_some());
        assert_eq!(fusion.state(0).refinement.progress(), progress_after_stereo);
    }

    #[test]
    fn test_hand_size_converges_toward_measured() {
        let config = FusionConfig::default();
        let mut fusion = FusionStage::new(&config);
        // 実際の手はデフォルトより大きい
        let true_size = 0.11;
        let input = synthetic_input(Point3::new(0.0, 0.0, 0.4), true_size);
        let mut tracked = false;
        for _ in 0..5 {
            let result = fusion.process_hand(0, &input, &stereo_pose(), tracked);
            assert!(result.is_some());
            tracked = true;
        }
        let estimated = fusion.state(0).target_hand_size;
        assert!(
            (estimated - true_size).abs() < 0.01,
            "hand size should move toward measured {}, got {}",
            true_size,
            estimated
        );
    }

    #[test]
    fn test_reset_all_restores_defaults() {
        let config = FusionConfig::default();
        let mut fusion = FusionStage::new(&config);
        let input = synthetic_input(Point3::new(0.0, 0.0, 0.4), 0.12);
        assert!(fusion
            .process_hand(0, &input, &stereo_pose(), false)
            .is_some());
        assert!(fusion.state(0).seen_before);

        fusion.reset_all();
        assert!(fusion.state(0).prev_params.is_none());
        assert!(!fusion.state(0).seen_before);
        assert_eq!(
            fusion.state(0).target_hand_size,
            config.initial_hand_size
        );
        assert_eq!(fusion.state(0).refinement.progress(), 0.0);
    }
}
