//! 合成シーンでトラッカー全体を回すスモークテスト
//!
//! 円軌道で動く手を合成バックエンドで観測させ、捕捉・追跡・予測の
//! 一連の動作をモデルファイルなしで確認する。

use anyhow::Result;
use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector2};
use std::sync::{Arc, Mutex};

use talava_hand::calibration::{CameraCalibration, LensModel, StereoCalibration};
use talava_hand::camera::ImageBoundary;
use talava_hand::config::TrackerConfig;
use talava_hand::hand::{HandJointIndex, KEYPOINT_COUNT, KEYPOINT_TO_JOINT};
use talava_hand::image::ImageView;
use talava_hand::model::{
    DetectorOutput, HandDetector, KeypointEstimator, KeypointPrediction, KeypointRequest,
};
use talava_hand::optimizer::skeleton::{forward_kinematics, HandPoseParams};
use talava_hand::tracker::{HandTracker, StereoFrame};

const SEC: u64 = 1_000_000_000;

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

/// 合成シーン: 手スロット0の真値キーポイント（左カメラ座標系）
#[derive(Default)]
struct Scene {
    keypoints: Option<[Point3<f32>; KEYPOINT_COUNT]>,
}

impl Scene {
    fn place_hand(&mut self, wrist: Point3<f32>, hand_size: f32) {
        let params = HandPoseParams::t_pose(
            Isometry3::from_parts(wrist.coords.into(), UnitQuaternion::identity()),
            hand_size,
        );
        let set = forward_kinematics(&params);
        let mut keypoints = [Point3::origin(); KEYPOINT_COUNT];
        for i in 0..KEYPOINT_COUNT {
            keypoints[i] = set.joints[KEYPOINT_TO_JOINT[i] as usize].position;
        }
        self.keypoints = Some(keypoints);
    }
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
            let mut sum = Vector2::zeros();
            for p in keypoints {
                let local = if view_idx == 0 {
                    p.coords
                } else {
                    self.calib.right_in_left.inverse_transform_point(p).coords
                };
                let Some(px) = camera.project(&local) else {
                    return Ok(outputs);
                };
                min = min.inf(&px);
                max = max.sup(&px);
                sum += px;
            }
            outputs[0] = DetectorOutput {
                found: true,
                center: sum / KEYPOINT_COUNT as f32,
                size_px: (max - min).norm().max(40.0) * 1.5,
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
            let Some(px) = camera.project(&local) else {
                anyhow::bail!("keypoint behind camera");
            };
            prediction.points[i] = request.warp.apply(px);
            prediction.confidences[i] = 0.9;
        }
        Ok(prediction)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,talava_hand=debug".into()),
        )
        .init();

    let calib = make_calib();
    let scene = Arc::new(Mutex::new(Scene::default()));
    let mut config = TrackerConfig::default();
    config.detection.interval = 5;

    let detector = Box::new(SceneDetector {
        scene: scene.clone(),
        calib: calib.clone(),
    });
    let estimator = Box::new(SceneEstimator {
        scene: scene.clone(),
        calib: calib.clone(),
    });
    let mut tracker = HandTracker::new(calib, config, detector, estimator)?;

    let buffer = vec![128u8; 640 * 480];
    let frames = 120u64;
    let mut active_frames = 0u64;

    for i in 0..frames {
        let t = i as f32 / 30.0;
        // 円軌道 + 一定区間だけ手を消してロストと再捕捉を見る
        if (60..70).contains(&i) {
            scene.lock().unwrap().keypoints = None;
        } else {
            let wrist = Point3::new(0.06 * (t * 1.5).cos(), 0.04 * (t * 1.5).sin(), 0.4);
            scene.lock().unwrap().place_hand(wrist, 0.09);
        }

        let left = ImageView::from_packed(&buffer, 640, 480)?;
        let right = ImageView::from_packed(&buffer, 640, 480)?;
        let output = tracker.process(&StereoFrame {
            left,
            right,
            timestamp_ns: (i + 1) * SEC / 30,
        })?;

        if output.hands[0].is_active {
            active_frames += 1;
            if i % 30 == 0 {
                let joints = output.hands[0].joints.as_ref().unwrap();
                let wrist = joints.get(HandJointIndex::Wrist).position;
                println!(
                    "frame {:3}: wrist at [{:+.3} {:+.3} {:+.3}]",
                    i, wrist.x, wrist.y, wrist.z
                );
            }
        }
    }

    println!("tracked {} / {} frames", active_frames, frames);
    Ok(())
}
