use anyhow::Result;
use nalgebra::Vector2;

use crate::image::ImageView;

/// 全画面検出が1つの手スロットについて返す結果
///
/// 座標はフレームのピクセル座標。
#[derive(Debug, Clone, Copy)]
pub struct DetectorOutput {
    pub found: bool,
    pub center: Vector2<f32>,
    pub size_px: f32,
    pub confidence: f32,
}

impl Default for DetectorOutput {
    fn default() -> Self {
        Self {
            found: false,
            center: Vector2::zeros(),
            size_px: 0.0,
            confidence: 0.0,
        }
    }
}

/// 全画面の手検出モデル
///
/// 1ビューの画像から左手・右手スロットそれぞれの検出結果を返す。
/// ビューごとに独立して並行呼び出しされるため Send + Sync が必要。
pub trait HandDetector: Send + Sync {
    fn detect(&self, view_idx: usize, image: &ImageView) -> Result<[DetectorOutput; 2]>;
}
