use nalgebra::{Vector2, Vector3};

use crate::calibration::{CameraCalibration, LensModel};

const EPS: f32 = 1e-8;

impl CameraCalibration {
    /// カメラ座標系の3D点をピクセル座標に投影する
    ///
    /// 投影できない方向（ピンホールで z <= 0 など）は None。
    pub fn project(&self, p: &Vector3<f32>) -> Option<Vector2<f32>> {
        match self.lens {
            LensModel::Kb4 { k1, k2, k3, k4 } => self.project_kb4(p, [k1, k2, k3, k4]),
            LensModel::RadTan8 {
                k1,
                k2,
                p1,
                p2,
                k3,
                k4,
                k5,
                k6,
            } => self.project_radtan8(p, [k1, k2, k3, k4, k5, k6], [p1, p2]),
        }
    }

    /// ピクセル座標を単位方向ベクトルに逆投影する
    pub fn unproject(&self, px: &Vector2<f32>) -> Vector3<f32> {
        match self.lens {
            LensModel::Kb4 { k1, k2, k3, k4 } => self.unproject_kb4(px, [k1, k2, k3, k4]),
            LensModel::RadTan8 {
                k1,
                k2,
                p1,
                p2,
                k3,
                k4,
                k5,
                k6,
            } => self.unproject_radtan8(px, [k1, k2, k3, k4, k5, k6], [p1, p2]),
        }
    }

    // --- KB4 (魚眼) ---

    fn project_kb4(&self, p: &Vector3<f32>, k: [f32; 4]) -> Option<Vector2<f32>> {
        let r = (p.x * p.x + p.y * p.y).sqrt();
        if r < EPS {
            // 光軸上
            if p.z <= 0.0 {
                return None;
            }
            return Some(Vector2::new(self.cx, self.cy));
        }
        let theta = r.atan2(p.z);
        let theta_d = kb4_forward(theta, &k);
        let scale = theta_d / r;
        Some(Vector2::new(
            self.fx * scale * p.x + self.cx,
            self.fy * scale * p.y + self.cy,
        ))
    }

    fn unproject_kb4(&self, px: &Vector2<f32>, k: [f32; 4]) -> Vector3<f32> {
        let mx = (px.x - self.cx) / self.fx;
        let my = (px.y - self.cy) / self.fy;
        let theta_d = (mx * mx + my * my).sqrt();
        if theta_d < EPS {
            return Vector3::new(0.0, 0.0, 1.0);
        }

        // θ(1 + k1θ² + k2θ⁴ + k3θ⁶ + k4θ⁸) = θ_d をニュートン法で解く
        let mut theta = theta_d;
        for _ in 0..10 {
            let f = kb4_forward(theta, &k) - theta_d;
            let t2 = theta * theta;
            let df = 1.0
                + 3.0 * k[0] * t2
                + 5.0 * k[1] * t2 * t2
                + 7.0 * k[2] * t2 * t2 * t2
                + 9.0 * k[3] * t2 * t2 * t2 * t2;
            if df.abs() < EPS {
                break;
            }
            let step = f / df;
            theta -= step;
            if step.abs() < 1e-9 {
                break;
            }
        }

        let (sin_t, cos_t) = theta.sin_cos();
        Vector3::new(sin_t * mx / theta_d, sin_t * my / theta_d, cos_t).normalize()
    }

    // --- RadTan8 ---

    fn project_radtan8(
        &self,
        p: &Vector3<f32>,
        k: [f32; 6],
        tangential: [f32; 2],
    ) -> Option<Vector2<f32>> {
        if p.z <= EPS {
            return None;
        }
        let x = p.x / p.z;
        let y = p.y / p.z;
        let (xd, yd) = radtan8_distort(x, y, &k, &tangential);
        Some(Vector2::new(
            self.fx * xd + self.cx,
            self.fy * yd + self.cy,
        ))
    }

    fn unproject_radtan8(
        &self,
        px: &Vector2<f32>,
        k: [f32; 6],
        tangential: [f32; 2],
    ) -> Vector3<f32> {
        let xd = (px.x - self.cx) / self.fx;
        let yd = (px.y - self.cy) / self.fy;

        // 不動点反復で歪みを除去: x = (xd - tangential(x,y)) / radial(r)
        let [p1, p2] = tangential;
        let mut x = xd;
        let mut y = yd;
        for _ in 0..10 {
            let r2 = x * x + y * y;
            let radial = radtan8_radial(r2, &k);
            if radial.abs() < EPS {
                break;
            }
            let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }

        Vector3::new(x, y, 1.0).normalize()
    }
}

fn kb4_forward(theta: f32, k: &[f32; 4]) -> f32 {
    let t2 = theta * theta;
    theta * (1.0 + t2 * (k[0] + t2 * (k[1] + t2 * (k[2] + t2 * k[3]))))
}

fn radtan8_radial(r2: f32, k: &[f32; 6]) -> f32 {
    let num = 1.0 + r2 * (k[0] + r2 * (k[1] + r2 * k[2]));
    let den = 1.0 + r2 * (k[3] + r2 * (k[4] + r2 * k[5]));
    num / den
}

fn radtan8_distort(x: f32, y: f32, k: &[f32; 6], tangential: &[f32; 2]) -> (f32, f32) {
    let [p1, p2] = *tangential;
    let r2 = x * x + y * y;
    let radial = radtan8_radial(r2, k);
    let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
    let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
    (xd, yd)
}
