use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

/// カメラの有効画像領域の形状
///
/// 魚眼レンズでは像が円形にしか結ばないため、有効領域は画像矩形ではなく
/// 内接円になる。レンズごとに設定できるよう判別付きバリアントで持つ。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum ImageBoundary {
    /// 画像矩形のみを境界とする
    None,
    /// 正規化座標での円（中心 + 半径）
    Circle { center: [f32; 2], radius: f32 },
}

/// 点が有効画像領域の外にあるか
///
/// point はピクセル座標。矩形外は境界形状に関わらず常に外。
pub fn is_outside(boundary: &ImageBoundary, point: Vector2<f32>, width: f32, height: f32) -> bool {
    if point.x < 0.0 || point.y < 0.0 || point.x >= width || point.y >= height {
        return true;
    }
    match boundary {
        ImageBoundary::None => false,
        ImageBoundary::Circle { center, radius } => {
            let dx = point.x / width - center[0];
            let dy = point.y / height - center[1];
            (dx * dx + dy * dy).sqrt() > *radius
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corner_outside_circle_inside_rect() {
        // 画像の角(0,0)は矩形内だが内接円の外
        let circle = ImageBoundary::Circle {
            center: [0.5, 0.5],
            radius: 0.5,
        };
        let corner = Vector2::new(0.0, 0.0);
        assert!(is_outside(&circle, corner, 640.0, 480.0));

        let none = ImageBoundary::None;
        assert!(!is_outside(&none, corner, 640.0, 480.0));
    }

    #[test]
    fn test_center_inside_both() {
        let circle = ImageBoundary::Circle {
            center: [0.5, 0.5],
            radius: 0.5,
        };
        let center = Vector2::new(320.0, 240.0);
        assert!(!is_outside(&circle, center, 640.0, 480.0));
        assert!(!is_outside(&ImageBoundary::None, center, 640.0, 480.0));
    }

    #[test]
    fn test_rect_bounds_apply_to_all_shapes() {
        let circle = ImageBoundary::Circle {
            center: [0.5, 0.5],
            radius: 10.0, // 巨大な円でも矩形外は外
        };
        assert!(is_outside(&circle, Vector2::new(-1.0, 240.0), 640.0, 480.0));
        assert!(is_outside(&circle, Vector2::new(640.0, 240.0), 640.0, 480.0));
        assert!(is_outside(&ImageBoundary::None, Vector2::new(320.0, 480.0), 640.0, 480.0));
    }

    #[test]
    fn test_circle_edge() {
        let circle = ImageBoundary::Circle {
            center: [0.5, 0.5],
            radius: 0.5,
        };
        // 円周ぎりぎり内側（正規化x = 0.999）
        assert!(!is_outside(&circle, Vector2::new(639.0, 240.0), 640.0, 480.0));
        // 上端中央は円周上（距離0.5）なので内側扱い
        assert!(!is_outside(&circle, Vector2::new(320.0, 0.0), 640.0, 480.0));
    }
}
