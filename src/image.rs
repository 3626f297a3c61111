use anyhow::{bail, Result};

/// グレースケール画像への参照ビュー
///
/// ストライドは行のバイト幅。USB転送フレームはパディングを持つことがあるため
/// width と等しいとは限らない。
#[derive(Debug, Clone, Copy)]
pub struct ImageView<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub stride: usize,
}

impl<'a> ImageView<'a> {
    pub fn new(data: &'a [u8], width: u32, height: u32, stride: usize) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("Image dimensions must be non-zero: {}x{}", width, height);
        }
        if stride < width as usize {
            bail!("Stride {} smaller than width {}", stride, width);
        }
        let needed = stride * (height as usize - 1) + width as usize;
        if data.len() < needed {
            bail!("Image buffer too small: {} < {}", data.len(), needed);
        }
        Ok(Self { data, width, height, stride })
    }

    /// パディングなしバッファからのビュー
    pub fn from_packed(data: &'a [u8], width: u32, height: u32) -> Result<Self> {
        Self::new(data, width, height, width as usize)
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.data[y as usize * self.stride + x as usize]
    }

    /// バイリニア補間サンプリング。画像範囲外は0。
    pub fn sample_bilinear(&self, x: f32, y: f32) -> f32 {
        if x < 0.0 || y < 0.0 || x > (self.width - 1) as f32 || y > (self.height - 1) as f32 {
            return 0.0;
        }
        let x0 = x.floor() as u32;
        let y0 = y.floor() as u32;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;

        let p00 = self.get(x0, y0) as f32;
        let p10 = self.get(x1, y0) as f32;
        let p01 = self.get(x0, y1) as f32;
        let p11 = self.get(x1, y1) as f32;

        let top = p00 * (1.0 - fx) + p10 * fx;
        let bottom = p01 * (1.0 - fx) + p11 * fx;
        top * (1.0 - fy) + bottom * fy
    }
}

/// 推論入力用の正方形パッチ（所有バッファ）
#[derive(Debug, Clone)]
pub struct ImagePatch {
    pub data: Vec<u8>,
    pub size: u32,
}

impl ImagePatch {
    pub fn new(size: u32) -> Self {
        Self {
            data: vec![0; (size * size) as usize],
            size,
        }
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.data[(y * self.size + x) as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, value: u8) {
        self.data[(y * self.size + x) as usize] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_rejects_small_buffer() {
        let data = vec![0u8; 10];
        assert!(ImageView::from_packed(&data, 4, 4).is_err());
        assert!(ImageView::from_packed(&data, 0, 4).is_err());
    }

    #[test]
    fn test_view_with_stride() {
        // 4x2画像、ストライド6
        let data = vec![
            1, 2, 3, 4, 0, 0, //
            5, 6, 7, 8, 0, 0,
        ];
        let view = ImageView::new(&data, 4, 2, 6).unwrap();
        assert_eq!(view.get(0, 0), 1);
        assert_eq!(view.get(3, 1), 8);
    }

    #[test]
    fn test_bilinear_center() {
        let data = vec![0u8, 100, 100, 200];
        let view = ImageView::from_packed(&data, 2, 2).unwrap();
        // 中心 (0.5, 0.5) は4画素の平均
        let v = view.sample_bilinear(0.5, 0.5);
        assert!((v - 100.0).abs() < 1e-3, "got {}", v);
        // 格子点上は元の値
        assert!((view.sample_bilinear(0.0, 0.0) - 0.0).abs() < 1e-3);
        assert!((view.sample_bilinear(1.0, 1.0) - 200.0).abs() < 1e-3);
    }

    #[test]
    fn test_bilinear_out_of_range() {
        let data = vec![255u8; 4];
        let view = ImageView::from_packed(&data, 2, 2).unwrap();
        assert_eq!(view.sample_bilinear(-0.1, 0.0), 0.0);
        assert_eq!(view.sample_bilinear(0.0, 5.0), 0.0);
    }
}
