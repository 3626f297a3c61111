use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// トラッカー全体の設定
///
/// 実行中は不変。元実装ではデバッグ用のグローバル可変変数だったものを
/// 構築時に渡す設定構造体として固定する。
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub roi: RoiConfig,
    #[serde(default)]
    pub keypoint: KeypointConfig,
    #[serde(default)]
    pub fusion: FusionConfig,
}

/// 全画面検出ディスパッチの設定
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// 検出モデルを走らせるフレーム間隔
    #[serde(default = "default_detection_interval")]
    pub interval: u64,
    /// 毎フレーム検出を強制するデバッグ用フラグ
    #[serde(default)]
    pub always_run: bool,
    /// 左右ビューの信頼度合計の受理閾値
    #[serde(default = "default_accept_sum_threshold")]
    pub accept_sum_threshold: f32,
    /// 検出中心レイの左右ビュー間角度整合チェックを行うか
    #[serde(default = "default_check_cross_view_angle")]
    pub check_cross_view_angle: bool,
    /// 角度整合チェックの許容乖離（度）
    #[serde(default = "default_max_cross_view_angle_deg")]
    pub max_cross_view_angle_deg: f32,
}

/// ROI予測の設定
#[derive(Debug, Clone, Deserialize)]
pub struct RoiConfig {
    /// 定速度外挿の減衰係数。1.0で完全外挿、小さいほどジッタに強い。
    #[serde(default = "default_lerp_factor")]
    pub lerp_factor: f32,
    /// 予測キーポイント群からROI半径を決める際の拡大率
    #[serde(default = "default_radius_inflation")]
    pub radius_inflation: f32,
    /// 視野外と判定するキーポイント数の閾値（これを超えたらROI喪失）
    #[serde(default = "default_max_num_outside_view")]
    pub max_num_outside_view: u32,
    /// これ未満のROIは縮退として推論をスキップする（ピクセル）
    #[serde(default = "default_min_roi_size_px")]
    pub min_size_px: f32,
}

/// キーポイント推論の設定
#[derive(Debug, Clone, Deserialize)]
pub struct KeypointConfig {
    /// モデル入力パッチの一辺（ピクセル）
    #[serde(default = "default_keypoint_input_size")]
    pub input_size: u32,
}

/// 運動学融合ステージの設定
#[derive(Debug, Clone, Deserialize)]
pub struct FusionConfig {
    /// 再投影誤差の棄却閾値
    #[serde(default = "default_max_reprojection_error")]
    pub max_reprojection_error: f32,
    /// 手サイズ校正スケジュールの飽和フレーム数
    #[serde(default = "default_refinement_frame_max")]
    pub refinement_frame_max: f32,
    /// 手サイズの初期値（手首→中指付け根、メートル）
    #[serde(default = "default_initial_hand_size")]
    pub initial_hand_size: f32,
    /// 校正で許す手サイズの下限
    #[serde(default = "default_min_hand_size")]
    pub min_hand_size: f32,
    /// 校正で許す手サイズの上限
    #[serde(default = "default_max_hand_size")]
    pub max_hand_size: f32,
    /// 使用するソルバーバックエンド
    #[serde(default = "default_backend")]
    pub backend: SolverBackend,
    /// CCD-IKバックエンドの反復回数
    #[serde(default = "default_ccdik_iterations")]
    pub ccdik_iterations: usize,
    /// 親指-人差し指のピンチ補助ドラッグを有効にするか
    #[serde(default = "default_pinch_assist")]
    pub pinch_assist: bool,
}

/// ソルバーバックエンドの選択
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverBackend {
    /// レイ融合 + 骨格フィット（主経路）
    RayFit,
    /// CCD-IK（デバッグ/フォールバック経路、手サイズ推定なし）
    CcdIk,
}

fn default_detection_interval() -> u64 { 30 }
fn default_accept_sum_threshold() -> f32 { 0.90 }
fn default_check_cross_view_angle() -> bool { true }
fn default_max_cross_view_angle_deg() -> f32 { 10.0 }
fn default_lerp_factor() -> f32 { 0.4 }
fn default_radius_inflation() -> f32 { 3.0 }
fn default_max_num_outside_view() -> u32 { 6 }
fn default_min_roi_size_px() -> f32 { 12.0 }
fn default_keypoint_input_size() -> u32 { 128 }
fn default_max_reprojection_error() -> f32 { 0.35 }
fn default_refinement_frame_max() -> f32 { 100.0 }
fn default_initial_hand_size() -> f32 { 0.09 }
fn default_min_hand_size() -> f32 { 0.045 }
fn default_max_hand_size() -> f32 { 0.135 }
fn default_backend() -> SolverBackend { SolverBackend::RayFit }
fn default_ccdik_iterations() -> usize { 10 }
fn default_pinch_assist() -> bool { true }

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            detection: DetectionConfig::default(),
            roi: RoiConfig::default(),
            keypoint: KeypointConfig::default(),
            fusion: FusionConfig::default(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            interval: default_detection_interval(),
            always_run: false,
            accept_sum_threshold: default_accept_sum_threshold(),
            check_cross_view_angle: default_check_cross_view_angle(),
            max_cross_view_angle_deg: default_max_cross_view_angle_deg(),
        }
    }
}

impl Default for RoiConfig {
    fn default() -> Self {
        Self {
            lerp_factor: default_lerp_factor(),
            radius_inflation: default_radius_inflation(),
            max_num_outside_view: default_max_num_outside_view(),
            min_size_px: default_min_roi_size_px(),
        }
    }
}

impl Default for KeypointConfig {
    fn default() -> Self {
        Self {
            input_size: default_keypoint_input_size(),
        }
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            max_reprojection_error: default_max_reprojection_error(),
            refinement_frame_max: default_refinement_frame_max(),
            initial_hand_size: default_initial_hand_size(),
            min_hand_size: default_min_hand_size(),
            max_hand_size: default_max_hand_size(),
            backend: default_backend(),
            ccdik_iterations: default_ccdik_iterations(),
            pinch_assist: default_pinch_assist(),
        }
    }
}

impl TrackerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config: {}", path.as_ref().display()))?;
        let config: TrackerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// 設定ファイルが無い/壊れている場合はデフォルトを返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::load(path).unwrap_or_default()
    }
}
