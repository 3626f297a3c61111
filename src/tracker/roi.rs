use nalgebra::Vector2;

/// 1ビュー・1手スロットの注目領域
///
/// 検出器または予測器が毎フレーム作り直す。フレームをまたいで生存しない。
/// 座標はフレームのピクセル座標、size_px は正方形の一辺。
#[derive(Debug, Clone, Copy)]
pub struct HandRoi {
    pub center: Vector2<f32>,
    pub size_px: f32,
    pub found: bool,
    pub confidence: f32,
}

impl HandRoi {
    pub fn none() -> Self {
        Self {
            center: Vector2::zeros(),
            size_px: 0.0,
            found: false,
            confidence: 0.0,
        }
    }

    /// 推論に使えない縮退ROIか
    ///
    /// 小さすぎる・非有限・完全に画像外のいずれかで真。
    pub fn is_degenerate(&self, min_size_px: f32, width: f32, height: f32) -> bool {
        if !self.found {
            return true;
        }
        if !self.size_px.is_finite() || self.size_px < min_size_px {
            return true;
        }
        if !self.center.x.is_finite() || !self.center.y.is_finite() {
            return true;
        }
        let half = self.size_px / 2.0;
        self.center.x + half < 0.0
            || self.center.y + half < 0.0
            || self.center.x - half >= width
            || self.center.y - half >= height
    }
}

impl Default for HandRoi {
    fn default() -> Self {
        Self::none()
    }
}
