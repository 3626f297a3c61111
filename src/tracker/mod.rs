pub mod detect;
pub mod history;
pub mod keypoint;
pub mod predict;
pub mod roi;

use anyhow::{bail, Result};
use nalgebra::Vector3;
use tracing::{debug, warn};

use crate::calibration::StereoCalibration;
use crate::config::TrackerConfig;
use crate::hand::{apply_joint_radii, apply_pinch_assist, HandJointIndex, HandJointSet};
use crate::image::ImageView;
use crate::model::{roi_rotation_angle, DetectorOutput, HandDetector, KeypointEstimator};
use crate::optimizer::FusionStage;
use self::detect::{reconcile_detections, should_run_detection};
use self::history::HandHistory;
use self::keypoint::{dispatch_keypoints, KeypointTask};
use self::predict::predict_rois;
use self::roi::HandRoi;

/// 1フレーム分のステレオ入力
///
/// 左右は同期済みで同一サイズ。タイムスタンプは単調なキャプチャ時刻。
pub struct StereoFrame<'a> {
    pub left: ImageView<'a>,
    pub right: ImageView<'a>,
    pub timestamp_ns: u64,
}

/// 1つの手の出力
#[derive(Debug, Clone, Default)]
pub struct HandOutput {
    pub is_active: bool,
    pub joints: Option<HandJointSet>,
}

/// フレーム出力。タイムスタンプは入力のパススルー（時刻フィルタなし）。
#[derive(Debug, Clone)]
pub struct FrameOutput {
    pub hands: [HandOutput; 2],
    pub timestamp_ns: u64,
}

/// ステレオカメラ手トラッカー本体
///
/// フレームごとに ROI予測 → 検出 → キーポイント → 融合 → 履歴更新 を
/// 1本のパイプラインとして回す。推論のファンアウトだけワーカープールに出し、
/// 段の間はバリアで完全に同期する。フレーム間のオーバーラップはない
/// （融合が書く手ごとの状態を次フレームの予測が読むため）。
pub struct HandTracker {
    config: TrackerConfig,
    calib: StereoCalibration,
    detector: Box<dyn HandDetector>,
    keypoint: Box<dyn KeypointEstimator>,
    fusion: FusionStage,
    histories: [HandHistory; 2],
    /// 前フレームで使ったROI（履歴1サンプル時の使い回し用）
    prev_rois: [[HandRoi; 2]; 2],
    last_frame_hand_detected: [bool; 2],
    frame_counter: u64,
    new_user_event: bool,
}

impl HandTracker {
    pub fn new(
        calib: StereoCalibration,
        config: TrackerConfig,
        detector: Box<dyn HandDetector>,
        keypoint: Box<dyn KeypointEstimator>,
    ) -> Result<Self> {
        calib.validate()?;
        let fusion = FusionStage::new(&config.fusion);
        Ok(Self {
            config,
            calib,
            detector,
            keypoint,
            fusion,
            histories: [HandHistory::new(), HandHistory::new()],
            prev_rois: [[HandRoi::none(); 2], [HandRoi::none(); 2]],
            last_frame_hand_detected: [false, false],
            frame_counter: 0,
            new_user_event: false,
        })
    }

    /// 新規ユーザー通知
    ///
    /// 次フレームの頭で履歴と手サイズ校正を両手ともリセットする。
    pub fn notify_new_user(&mut self) {
        self.new_user_event = true;
    }

    /// 1フレーム処理する
    ///
    /// アスペクト比がキャリブレーションと合わないフレームは処理せずエラーで
    /// 返す（フレーム単位の回復可能エラー）。それ以外の失敗は手ごとの
    /// is_active=false に畳み込まれ、パイプラインは止まらない。
    pub fn process(&mut self, frame: &StereoFrame) -> Result<FrameOutput> {
        if frame.left.width != frame.right.width || frame.left.height != frame.right.height {
            bail!(
                "Stereo frames differ in size: {}x{} vs {}x{}",
                frame.left.width,
                frame.left.height,
                frame.right.width,
                frame.right.height
            );
        }
        if !self.calib.aspect_matches(frame.left.width, frame.left.height) {
            warn!(
                width = frame.left.width,
                height = frame.left.height,
                "frame aspect ratio does not match calibration, skipping frame"
            );
            bail!(
                "Frame aspect ratio {}x{} does not match calibration",
                frame.left.width,
                frame.left.height
            );
        }
        // キャリブレーション解像度とフレーム解像度の換算係数
        let px_scale = self.calib.views[0].height as f32 / frame.left.height as f32;
        let frame_w = frame.left.width as f32;
        let frame_h = frame.left.height as f32;

        if self.new_user_event {
            self.new_user_event = false;
            for history in &mut self.histories {
                history.clear();
            }
            self.fusion.reset_all();
            self.prev_rois = [[HandRoi::none(); 2], [HandRoi::none(); 2]];
            self.last_frame_hand_detected = [false, false];
            debug!("new user event: tracking state reset");
        }

        // 1. ROI予測（履歴2サンプル以上）/ 使い回し（1サンプル）
        let mut rois = [[HandRoi::none(); 2], [HandRoi::none(); 2]]; // [view][hand]
        for hand_idx in 0..2 {
            match self.histories[hand_idx].len() {
                0 => {}
                1 => {
                    // 1サンプルでは速度が出せない。前フレームのROIを使い回して
                    // 手が大きく動いていないことに賭ける。
                    for view_idx in 0..2 {
                        rois[view_idx][hand_idx] = self.prev_rois[view_idx][hand_idx];
                    }
                }
                _ => {
                    let predicted = predict_rois(
                        &self.histories[hand_idx],
                        frame.timestamp_ns,
                        &self.calib,
                        px_scale,
                        frame_w,
                        frame_h,
                        &self.config.roi,
                    );
                    for view_idx in 0..2 {
                        rois[view_idx][hand_idx] = predicted[view_idx];
                    }
                }
            }
        }

        // 2. 全画面検出（周期 or 捕捉待ちのときのみ、ビューごと並列）
        if should_run_detection(
            &self.config.detection,
            self.frame_counter,
            self.last_frame_hand_detected,
        ) {
            let detections = self.run_detection(frame);
            let accepted = reconcile_detections(
                &detections,
                self.last_frame_hand_detected,
                &self.calib,
                px_scale,
                &self.config.detection,
            );
            for (hand_idx, per_view) in accepted.iter().enumerate() {
                if let Some(per_view) = per_view {
                    debug!(hand = hand_idx, "hand detected");
                    rois[0][hand_idx] = per_view[0];
                    rois[1][hand_idx] = per_view[1];
                }
            }
        }

        // 3. キーポイント推論（(view, hand) ごと並列、バリア同期）
        let mut tasks = Vec::with_capacity(4);
        for hand_idx in 0..2 {
            for view_idx in 0..2 {
                let roi = rois[view_idx][hand_idx];
                if roi.is_degenerate(self.config.roi.min_size_px, frame_w, frame_h) {
                    continue;
                }
                tasks.push(KeypointTask {
                    view_idx,
                    hand_idx,
                    roi,
                    angle: self.crop_angle(hand_idx, view_idx, px_scale),
                });
            }
        }
        let views = [frame.left, frame.right];
        let inputs = dispatch_keypoints(
            self.keypoint.as_ref(),
            &views,
            &tasks,
            &self.calib,
            px_scale,
            &self.config.keypoint,
        );

        // 4. 融合 → 履歴更新 → 状態遷移
        let mut output = FrameOutput {
            hands: [HandOutput::default(), HandOutput::default()],
            timestamp_ns: frame.timestamp_ns,
        };
        let mut this_frame_detected = [false, false];

        for hand_idx in 0..2 {
            let result = self.fusion.process_hand(
                hand_idx,
                &inputs[hand_idx],
                &self.calib.right_in_left,
                self.last_frame_hand_detected[hand_idx],
            );
            match result {
                Some(mut result) => {
                    let hand_size = self.fusion.state(hand_idx).target_hand_size;
                    apply_joint_radii(&mut result.joints, hand_size);
                    if self.config.fusion.pinch_assist {
                        apply_pinch_assist(&mut result.joints);
                    }
                    if !self.last_frame_hand_detected[hand_idx] {
                        debug!(hand = hand_idx, "hand acquired");
                    }
                    self.histories[hand_idx].push(frame.timestamp_ns, result.joints.clone());
                    output.hands[hand_idx] = HandOutput {
                        is_active: true,
                        joints: Some(result.joints),
                    };
                    this_frame_detected[hand_idx] = true;
                }
                None => {
                    // 棄却・観測なし → 捕捉状態へ戻す。
                    // 汚れた速度推定が次の捕捉を壊さないよう履歴は必ず消す。
                    if self.last_frame_hand_detected[hand_idx] {
                        debug!(hand = hand_idx, "hand lost");
                    }
                    self.histories[hand_idx].clear();
                    self.fusion.reset_hand(hand_idx);
                }
            }
        }

        self.prev_rois = rois;
        self.last_frame_hand_detected = this_frame_detected;
        self.frame_counter += 1;
        Ok(output)
    }

    /// ビューごとの全画面検出をワーカープールへ出し、完了まで待つ
    fn run_detection(&self, frame: &StereoFrame) -> [[DetectorOutput; 2]; 2] {
        let views = [frame.left, frame.right];
        let detector = self.detector.as_ref();
        let mut outputs = [[DetectorOutput::default(); 2], [DetectorOutput::default(); 2]];

        rayon::scope(|scope| {
            for (view_idx, (slot, view)) in outputs.iter_mut().zip(views.iter()).enumerate() {
                scope.spawn(move |_| match detector.detect(view_idx, view) {
                    Ok(result) => *slot = result,
                    Err(e) => {
                        warn!(view = view_idx, error = %e, "hand detection failed");
                    }
                });
            }
        });
        outputs
    }

    /// クロップ回転角: 前フレームの手首→中指付け根方向をビューへ投影して求める
    fn crop_angle(&self, hand_idx: usize, view_idx: usize, _px_scale: f32) -> f32 {
        let Some((_, set)) = self.histories[hand_idx].get_at_age(0) else {
            return 0.0;
        };
        let wrist = set.get(HandJointIndex::Wrist).position;
        let middle = set.get(HandJointIndex::MiddleProximal).position;
        let camera = &self.calib.views[view_idx];

        let to_view = |p: &nalgebra::Point3<f32>| -> Vector3<f32> {
            if view_idx == 0 {
                p.coords
            } else {
                self.calib.right_in_left.inverse_transform_point(p).coords
            }
        };

        match (camera.project(&to_view(&wrist)), camera.project(&to_view(&middle))) {
            (Some(w), Some(m)) => roi_rotation_angle(w, m),
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CameraCalibration, LensModel};
    use crate::camera::ImageBoundary;
    use crate::hand::{KEYPOINT_COUNT, KEYPOINT_TO_JOINT};
    use crate::model::{KeypointPrediction, KeypointRequest};
    use crate::optimizer::skeleton::{forward_kinematics, HandPoseParams};
    use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector2};
    use std::sync::{Arc, Mutex};

    fn make_calib() -> StereoCalibration {
        let view = CameraCalibration {
            width: 640,
            height: 480,
            fx: 400.0,
            fy: 400.0,
            cx: 320.0,
            cy: 240.0,
            lens: LensModel::Kb4 {
                k1: 0.0,
                k2: 0.0,
                k3: 0.0,
                k4: 0.0,
            },
            boundary: ImageBoundary::None,
        };
        StereoCalibration {
            views: [view.clone(), view],
            right_in_left: Isometry3::from_parts(
                Translation3::new(0.064, 0.0, 0.0),
                UnitQuaternion::identity(),
            ),
        }
    }

    /// テスト用の合成シーン: 手スロット0の真値キーポイント（左カメラ座標系）
    #[derive(Default)]
    struct Scene {
        keypoints: Option<[Point3<f32>; KEYPOINT_COUNT]>,
    }

    fn scene_hand_at(wrist: Point3<f32>, hand_size: f32) -> [Point3<f32>; KEYPOINT_COUNT] {
        let params = HandPoseParams::t_pose(
            Isometry3::from_parts(wrist.coords.into(), UnitQuaternion::identity()),
            hand_size,
        );
        let set = forward_kinematics(&params);
        let mut keypoints = [Point3::origin(); KEYPOINT_COUNT];
        for i in 0..KEYPOINT_COUNT {
            keypoints[i] = set.joints[KEYPOINT_TO_JOINT[i] as usize].position;
        }
        keypoints
    }

    struct SceneDetector {
        scene: Arc<Mutex<Scene>>,
        calib: StereoCalibration,
    }

    impl HandDetector for SceneDetector {
        fn detect(&self, view_idx: usize, _image: &ImageView) -> Result<[DetectorOutput; 2]> {
            let scene = self.scene.lock().unwrap();
            let mut outputs = [DetectorOutput::default(), DetectorOutput::default()];
            if let Some(keypoints) = &scene.keypoints {
                let camera = &self.calib.views[view_idx];
                let mut min = Vector2::new(f32::MAX, f32::MAX);
                let mut max = Vector2::new(f32::MIN, f32::MIN);
                let mut center_sum = Vector2::zeros();
                for p in keypoints {
                    let local = if view_idx == 0 {
                        p.coords
                    } else {
                        self.calib.right_in_left.inverse_transform_point(p).coords
                    };
                    let px = camera.project(&local).unwrap();
                    min = min.inf(&px);
                    max = max.sup(&px);
                    center_sum += px;
                }
                let size = (max - min).norm().max(40.0) * 1.5;
                outputs[0] = DetectorOutput {
                    found: true,
                    center: center_sum / KEYPOINT_COUNT as f32,
                    size_px: size,
                    confidence: 0.8,
                };
            }
            Ok(outputs)
        }
    }

    struct SceneEstimator {
        scene: Arc<Mutex<Scene>>,
        calib: StereoCalibration,
    }

    impl KeypointEstimator for SceneEstimator {
        fn estimate(&self, request: &KeypointRequest) -> Result<KeypointPrediction> {
            let scene = self.scene.lock().unwrap();
            let Some(keypoints) = &scene.keypoints else {
                anyhow::bail!("no hand in scene");
            };
            if request.hand_idx != 0 {
                anyhow::bail!("no second hand in scene");
            }
            let camera = &self.calib.views[request.view_idx];
            let mut prediction = KeypointPrediction::default();
            for i in 0..KEYPOINT_COUNT {
                let local = if request.view_idx == 0 {
                    keypoints[i].coords
                } else {
                    self.calib
                        .right_in_left
                        .inverse_transform_point(&keypoints[i])
                        .coords
                };
                let px = camera.project(&local).unwrap();
                prediction.points[i] = request.warp.apply(px);
                prediction.confidences[i] = 0.9;
            }
            Ok(prediction)
        }
    }

    fn make_tracker(scene: Arc<Mutex<Scene>>, config: TrackerConfig) -> HandTracker {
        let calib = make_calib();
        let detector = Box::new(SceneDetector {
            scene: scene.clone(),
            calib: calib.clone(),
        });
        let estimator = Box::new(SceneEstimator {
            scene,
            calib: calib.clone(),
        });
        HandTracker::new(calib, config, detector, estimator).unwrap()
    }

    fn fast_detection_config() -> TrackerConfig {
        let mut config = TrackerConfig::default();
        config.detection.interval = 1;
        config
    }

    fn process_at(tracker: &mut HandTracker, buffer: &[u8], t_ns: u64) -> FrameOutput {
        let left = ImageView::from_packed(buffer, 640, 480).unwrap();
        let right = ImageView::from_packed(buffer, 640, 480).unwrap();
        tracker
            .process(&StereoFrame {
                left,
                right,
                timestamp_ns: t_ns,
            })
            .unwrap()
    }

    const SEC: u64 = 1_000_000_000;

    #[test]
    fn test_aspect_mismatch_rejects_frame() {
        let scene = Arc::new(Mutex::new(Scene::default()));
        let mut tracker = make_tracker(scene, TrackerConfig::default());
        let buffer = vec![0u8; 640 * 640];
        let left = ImageView::from_packed(&buffer, 640, 640).unwrap();
        let right = ImageView::from_packed(&buffer, 640, 640).unwrap();
        let result = tracker.process(&StereoFrame {
            left,
            right,
            timestamp_ns: 0,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_half_resolution_frames_accepted() {
        let scene = Arc::new(Mutex::new(Scene::default()));
        let mut tracker = make_tracker(scene, TrackerConfig::default());
        let buffer = vec![0u8; 320 * 240];
        let left = ImageView::from_packed(&buffer, 320, 240).unwrap();
        let right = ImageView::from_packed(&buffer, 320, 240).unwrap();
        assert!(tracker
            .process(&StereoFrame {
                left,
                right,
                timestamp_ns: 0,
            })
            .is_ok());
    }

    #[test]
    fn test_empty_scene_reports_inactive() {
        let scene = Arc::new(Mutex::new(Scene::default()));
        let mut tracker = make_tracker(scene, fast_detection_config());
        let buffer = vec![0u8; 640 * 480];
        let output = process_at(&mut tracker, &buffer, SEC);
        assert!(!output.hands[0].is_active);
        assert!(!output.hands[1].is_active);
        assert_eq!(tracker.histories[0].len(), 0);
    }

    /// E2Eシナリオ: 等速移動する手の追跡と予測ROIの検証
    #[test]
    fn test_tracking_and_prediction_follow_motion() {
        let scene = Arc::new(Mutex::new(Scene::default()));
        let mut config = fast_detection_config();
        config.roi.lerp_factor = 1.0; // 解析値と比較するため完全外挿
        let mut tracker = make_tracker(scene.clone(), config);
        let buffer = vec![128u8; 640 * 480];

        let hand_size = 0.09;
        let p0 = Point3::new(0.0, 0.0, 0.4);
        let v = nalgebra::Vector3::new(0.03, 0.01, 0.0); // m/s

        // フレーム1, 2: 等速で移動する手
        for i in 0..2u64 {
            let wrist = p0 + v * i as f32;
            scene.lock().unwrap().keypoints = Some(scene_hand_at(wrist, hand_size));
            let output = process_at(&mut tracker, &buffer, (i + 1) * SEC);
            assert!(output.hands[0].is_active, "frame {} should be active", i + 1);
        }
        assert_eq!(tracker.histories[0].len(), 2);

        // フレーム3の時刻での予測ROIを解析値と比較する
        let predicted = predict_rois(
            &tracker.histories[0],
            3 * SEC,
            &tracker.calib,
            1.0,
            640.0,
            480.0,
            &tracker.config.roi,
        );
        assert!(predicted[0].found);

        // 期待値: 中指付け根の等速外挿を再投影した位置
        let tracked = tracker.histories[0].get_at_age(0).unwrap().1;
        let older = tracker.histories[0].get_at_age(1).unwrap().1;
        let newest = tracked.get(HandJointIndex::MiddleProximal).position;
        let previous = older.get(HandJointIndex::MiddleProximal).position;
        let extrapolated = newest + (newest - previous);
        let expected_px = tracker.calib.views[0].project(&extrapolated.coords).unwrap();
        assert!(
            (predicted[0].center - expected_px).norm() < 2.0,
            "predicted {:?}, expected {:?}",
            predicted[0].center,
            expected_px
        );

        // フレーム3も追跡が続く
        scene.lock().unwrap().keypoints = Some(scene_hand_at(p0 + v * 2.0, hand_size));
        let output = process_at(&mut tracker, &buffer, 3 * SEC);
        assert!(output.hands[0].is_active);
        assert_eq!(tracker.histories[0].len(), 3);
    }

    /// E2Eシナリオ: 捕捉 → 喪失 → 履歴全消去
    #[test]
    fn test_acquisition_loss_clears_history() {
        let scene = Arc::new(Mutex::new(Scene::default()));
        let mut tracker = make_tracker(scene.clone(), fast_detection_config());
        let buffer = vec![128u8; 640 * 480];

        // フレーム1: 手なし
        let output = process_at(&mut tracker, &buffer, SEC);
        assert!(!output.hands[0].is_active);
        assert_eq!(tracker.histories[0].len(), 0);

        // フレーム2: 手が現れて捕捉
        scene.lock().unwrap().keypoints =
            Some(scene_hand_at(Point3::new(0.0, 0.0, 0.4), 0.09));
        let output = process_at(&mut tracker, &buffer, 2 * SEC);
        assert!(output.hands[0].is_active);
        assert_eq!(tracker.histories[0].len(), 1);

        // フレーム3: 融合を強制的に棄却させる → 履歴は2ではなく0に戻る
        tracker.fusion.set_max_reprojection_error(-1.0);
        let output = process_at(&mut tracker, &buffer, 3 * SEC);
        assert!(!output.hands[0].is_active);
        assert_eq!(tracker.histories[0].len(), 0);
    }

    #[test]
    fn test_new_user_resets_state() {
        let scene = Arc::new(Mutex::new(Scene::default()));
        let mut tracker = make_tracker(scene.clone(), fast_detection_config());
        let buffer = vec![128u8; 640 * 480];

        scene.lock().unwrap().keypoints =
            Some(scene_hand_at(Point3::new(0.0, 0.0, 0.4), 0.11));
        for i in 1..=3u64 {
            let output = process_at(&mut tracker, &buffer, i * SEC);
            assert!(output.hands[0].is_active);
        }
        assert!(tracker.fusion.state(0).refinement.progress() > 0.0);
        assert!(tracker.histories[0].len() > 0);

        tracker.notify_new_user();
        let output = process_at(&mut tracker, &buffer, 4 * SEC);
        // リセット後の最初のフレームで再捕捉はできるが、校正は0から
        assert!(output.hands[0].is_active);
        assert_eq!(tracker.histories[0].len(), 1);
        // 再捕捉1フレーム分の前進しかしていない（1フレームの上限は信頼度1.0）
        let progress = tracker.fusion.state(0).refinement.progress();
        assert!(
            progress <= 1.0,
            "schedule should restart near zero, got {}",
            progress
        );
    }

    #[test]
    fn test_detection_cadence_limits_acquisition() {
        let scene = Arc::new(Mutex::new(Scene::default()));
        let mut config = TrackerConfig::default();
        config.detection.interval = 30;
        let mut tracker = make_tracker(scene.clone(), config);
        let buffer = vec![128u8; 640 * 480];

        // フレームカウンタを進める（手なしのフレームを1枚処理）
        let _ = process_at(&mut tracker, &buffer, SEC);

        // 手が現れても周期外では検出されない
        scene.lock().unwrap().keypoints =
            Some(scene_hand_at(Point3::new(0.0, 0.0, 0.4), 0.09));
        let output = process_at(&mut tracker, &buffer, 2 * SEC);
        assert!(
            !output.hands[0].is_active,
            "hand must wait for the detection cadence"
        );

        // 周期が来たフレームで捕捉される
        for i in 3..=31u64 {
            let output = process_at(&mut tracker, &buffer, i * SEC);
            if i == 31 {
                assert!(output.hands[0].is_active, "cadence frame should acquire");
            }
        }
    }

    #[test]
    fn test_output_timestamp_passthrough() {
        let scene = Arc::new(Mutex::new(Scene::default()));
        let mut tracker = make_tracker(scene, TrackerConfig::default());
        let buffer = vec![0u8; 640 * 480];
        let output = process_at(&mut tracker, &buffer, 123_456_789);
        assert_eq!(output.timestamp_ns, 123_456_789);
    }
}
