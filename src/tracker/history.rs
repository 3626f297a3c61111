use std::collections::VecDeque;

use crate::hand::HandJointSet;

/// 履歴リングバッファの容量
///
/// 速度の有限差分には直近2サンプルで足りるが、少し余裕を持たせる。
pub const HISTORY_CAPACITY: usize = 5;

/// 手ごとの時系列履歴
///
/// タイムスタンプと関節セットの平行リングバッファ。
/// 不変条件: timestamps.len() == hands.len()。
/// タイムスタンプは単調非減少前提（順序の乱れは呼び出し側のバグ）。
#[derive(Debug, Default)]
pub struct HandHistory {
    timestamps: VecDeque<u64>,
    hands: VecDeque<HandJointSet>,
}

impl HandHistory {
    pub fn new() -> Self {
        Self {
            timestamps: VecDeque::with_capacity(HISTORY_CAPACITY),
            hands: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    pub fn len(&self) -> usize {
        debug_assert_eq!(self.timestamps.len(), self.hands.len());
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 追記。満杯なら最古を捨てる。
    pub fn push(&mut self, timestamp_ns: u64, hand: HandJointSet) {
        if self.timestamps.len() == HISTORY_CAPACITY {
            self.timestamps.pop_front();
            self.hands.pop_front();
        }
        self.timestamps.push_back(timestamp_ns);
        self.hands.push_back(hand);
    }

    /// n回前のサンプル（0 = 最新）。範囲外は None。
    pub fn get_at_age(&self, age: usize) -> Option<(u64, &HandJointSet)> {
        let len = self.len();
        if age >= len {
            return None;
        }
        let idx = len - 1 - age;
        Some((self.timestamps[idx], &self.hands[idx]))
    }

    /// 全消去。追跡喪失時に呼び、古い速度推定が次の捕捉を汚さないようにする。
    pub fn clear(&mut self) {
        self.timestamps.clear();
        self.hands.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hand::HandJointIndex;
    use nalgebra::Point3;

    fn hand_at(z: f32) -> HandJointSet {
        let mut set = HandJointSet::default();
        set.get_mut(HandJointIndex::Wrist).position = Point3::new(0.0, 0.0, z);
        set
    }

    #[test]
    fn test_lengths_stay_equal() {
        let mut history = HandHistory::new();
        assert_eq!(history.len(), 0);

        for i in 0..10u64 {
            history.push(i, hand_at(i as f32));
            assert!(history.len() <= HISTORY_CAPACITY);
        }
        history.clear();
        assert_eq!(history.len(), 0);
        history.push(100, hand_at(1.0));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_get_at_age_returns_most_recent_first() {
        let mut history = HandHistory::new();
        history.push(10, hand_at(0.1));
        history.push(20, hand_at(0.2));
        history.push(30, hand_at(0.3));

        let (t0, h0) = history.get_at_age(0).unwrap();
        assert_eq!(t0, 30);
        assert!((h0.get(HandJointIndex::Wrist).position.z - 0.3).abs() < 1e-6);

        let (t1, _) = history.get_at_age(1).unwrap();
        assert_eq!(t1, 20);

        assert!(history.get_at_age(3).is_none());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut history = HandHistory::new();
        for i in 0..(HISTORY_CAPACITY as u64 + 3) {
            history.push(i, hand_at(i as f32));
        }
        assert_eq!(history.len(), HISTORY_CAPACITY);
        // 最古はキャパシティ分だけ後ろにずれている
        let (oldest, _) = history.get_at_age(HISTORY_CAPACITY - 1).unwrap();
        assert_eq!(oldest, 3);
    }

    #[test]
    fn test_clear_on_any_state() {
        let mut history = HandHistory::new();
        history.clear(); // 空でも安全
        history.push(1, hand_at(0.0));
        history.push(2, hand_at(0.0));
        history.clear();
        assert!(history.is_empty());
        assert!(history.get_at_age(0).is_none());
    }
}
