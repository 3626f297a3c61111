use anyhow::{bail, Context, Result};
use nalgebra::Isometry3;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::camera::ImageBoundary;

/// レンズ歪みモデル
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum LensModel {
    /// Kannala-Brandt 4係数魚眼モデル
    Kb4 { k1: f32, k2: f32, k3: f32, k4: f32 },
    /// OpenCV 8係数 radial-tangential モデル
    RadTan8 {
        k1: f32,
        k2: f32,
        p1: f32,
        p2: f32,
        k3: f32,
        k4: f32,
        k5: f32,
        k6: f32,
    },
}

/// 単一カメラのキャリブレーション
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraCalibration {
    pub width: u32,
    pub height: u32,
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    pub lens: LensModel,
    /// 有効画像領域（魚眼は円形になる）
    #[serde(default = "default_boundary")]
    pub boundary: ImageBoundary,
}

fn default_boundary() -> ImageBoundary {
    ImageBoundary::None
}

/// ステレオカメラのキャリブレーション
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StereoCalibration {
    /// view 0 = 左カメラ、view 1 = 右カメラ
    pub views: [CameraCalibration; 2],
    /// 右カメラの姿勢（左カメラ座標系）
    pub right_in_left: Isometry3<f32>,
}

impl StereoCalibration {
    /// ステレオ基線長（メートル）
    pub fn baseline(&self) -> f32 {
        self.right_in_left.translation.vector.norm()
    }

    /// フレーム解像度がキャリブレーションとアスペクト比一致するか
    ///
    /// GCDで約分した整数比の厳密一致で判定する。キャリブレーション1280x800に
    /// 対して640x400のフレームは許容、640x480は拒否。
    pub fn aspect_matches(&self, width: u32, height: u32) -> bool {
        if width == 0 || height == 0 {
            return false;
        }
        let cal = &self.views[0];
        let g_cal = gcd(cal.width, cal.height);
        let g_new = gcd(width, height);
        cal.width / g_cal == width / g_new && cal.height / g_cal == height / g_new
    }

    pub fn validate(&self) -> Result<()> {
        for (i, view) in self.views.iter().enumerate() {
            if view.width == 0 || view.height == 0 {
                bail!("View {} has zero image size", i);
            }
            if view.fx <= 0.0 || view.fy <= 0.0 {
                bail!("View {} has non-positive focal length", i);
            }
        }
        if self.baseline() <= 0.0 {
            bail!("Stereo baseline is zero");
        }
        Ok(())
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

pub fn save_calibration<P: AsRef<Path>>(path: P, cal: &StereoCalibration) -> Result<()> {
    let json = serde_json::to_string_pretty(cal)?;
    fs::write(path, json).context("Failed to write calibration file")?;
    Ok(())
}

pub fn load_calibration<P: AsRef<Path>>(path: P) -> Result<StereoCalibration> {
    let content = fs::read_to_string(path).context("Failed to read calibration file")?;
    let cal: StereoCalibration = serde_json::from_str(&content)?;
    cal.validate()?;
    Ok(cal)
}
