use nalgebra::{Matrix2, Vector2};

use crate::image::{ImagePatch, ImageView};

/// ROIをモデル入力の正方形パッチへ写す相似変換とその逆変換
///
/// 回転 + 等方スケール + 平行移動（右手は左右反転を含む）。
/// モデル出力をフル画像座標へ戻すため逆変換を保持する。
#[derive(Debug, Clone, Copy)]
pub struct SimilarityWarp {
    fwd_m: Matrix2<f32>,
    fwd_t: Vector2<f32>,
    inv_m: Matrix2<f32>,
    inv_t: Vector2<f32>,
}

impl SimilarityWarp {
    /// ROI（中心 + 一辺サイズ + 回転角）からワープを構築する
    ///
    /// angle はフル画像座標での手首→中指方向の傾き。-angle 回転でパッチ内の
    /// 手が直立する。mirror は右手用（モデルは左手で学習されている）。
    /// サイズが縮退している場合は None。
    pub fn from_roi(
        center: Vector2<f32>,
        size_px: f32,
        angle: f32,
        mirror: bool,
        out_size: u32,
    ) -> Option<Self> {
        if size_px < 1.0 || !size_px.is_finite() {
            return None;
        }
        let scale = out_size as f32 / size_px;
        let (sin_a, cos_a) = (-angle).sin_cos();
        let rot = Matrix2::new(cos_a, -sin_a, sin_a, cos_a);
        let mirror_m = if mirror {
            Matrix2::new(-1.0, 0.0, 0.0, 1.0)
        } else {
            Matrix2::identity()
        };

        let fwd_m = mirror_m * rot * scale;
        let half = out_size as f32 / 2.0;
        let fwd_t = Vector2::new(half, half) - fwd_m * center;

        let inv_m = fwd_m.try_inverse()?;
        let inv_t = -(inv_m * fwd_t);

        Some(Self {
            fwd_m,
            fwd_t,
            inv_m,
            inv_t,
        })
    }

    /// フル画像座標 → パッチ座標
    pub fn apply(&self, p: Vector2<f32>) -> Vector2<f32> {
        self.fwd_m * p + self.fwd_t
    }

    /// パッチ座標 → フル画像座標
    pub fn apply_inv(&self, p: Vector2<f32>) -> Vector2<f32> {
        self.inv_m * p + self.inv_t
    }
}

/// 手首→中指付け根方向からクロップ回転角を求める
///
/// この角度で -回転 すると指先が画像上方（-Y）を向く。
pub fn roi_rotation_angle(wrist: Vector2<f32>, middle_proximal: Vector2<f32>) -> f32 {
    let dir = middle_proximal - wrist;
    if dir.norm() < 1e-6 {
        return 0.0;
    }
    dir.x.atan2(-dir.y)
}

/// ワープに従ってビューからパッチを切り出す
///
/// バイリニアサンプリング。ROIが画像外にはみ出した分は0埋めになる。
pub fn extract_patch(view: &ImageView, warp: &SimilarityWarp, out_size: u32) -> ImagePatch {
    let mut patch = ImagePatch::new(out_size);
    for y in 0..out_size {
        for x in 0..out_size {
            let full = warp.apply_inv(Vector2::new(x as f32 + 0.5, y as f32 + 0.5));
            let value = view.sample_bilinear(full.x, full.y);
            patch.set(x, y, value.round().clamp(0.0, 255.0) as u8);
        }
    }
    patch
}

/// OpenCVのwarpAffineによる切り出し（デスクトップビルド向け）
#[cfg(feature = "desktop")]
pub fn extract_patch_cv(
    view: &ImageView,
    warp: &SimilarityWarp,
    out_size: u32,
) -> anyhow::Result<ImagePatch> {
    use opencv::{
        core::{Mat, Size, CV_8UC1},
        imgproc,
        prelude::*,
    };

    let src = unsafe {
        Mat::new_rows_cols_with_data_unsafe(
            view.height as i32,
            view.width as i32,
            CV_8UC1,
            view.data.as_ptr() as *mut std::ffi::c_void,
            view.stride,
        )?
    };

    let m = Mat::from_slice_2d(&[
        [
            warp.fwd_m[(0, 0)] as f64,
            warp.fwd_m[(0, 1)] as f64,
            warp.fwd_t[0] as f64,
        ],
        [
            warp.fwd_m[(1, 0)] as f64,
            warp.fwd_m[(1, 1)] as f64,
            warp.fwd_t[1] as f64,
        ],
    ])?;

    let mut dst = Mat::default();
    imgproc::warp_affine(
        &src,
        &mut dst,
        &m,
        Size::new(out_size as i32, out_size as i32),
        imgproc::INTER_LINEAR,
        opencv::core::BORDER_CONSTANT,
        opencv::core::Scalar::all(0.0),
    )?;

    let mut patch = ImagePatch::new(out_size);
    for y in 0..out_size {
        for x in 0..out_size {
            patch.set(x, y, *dst.at_2d::<u8>(y as i32, x as i32)?);
        }
    }
    Ok(patch)
}
