//! BEMFゼロクロス検出
//!
//! 相ごとに直前サンプルとの差分でトレンド（上昇/下降）を追跡し、
//! サンプルが中性点電圧の反対側に移った時点をゼロクロスとします。

/// BEMF検出相
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    U,
    V,
    W,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::U, Phase::V, Phase::W];

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// 相電圧のトレンド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Trend {
    Unknown,
    Rising,
    Falling,
}

/// 回転方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    Unknown,
    Forward,
    Reverse,
}

/// ゼロクロス時の電気角 [度]（60度刻み）
pub fn phase_angle(phase: Phase, trend: Trend) -> u16 {
    match (phase, trend) {
        (Phase::U, Trend::Rising) => 0,
        (Phase::U, Trend::Falling) => 180,
        (Phase::V, Trend::Rising) => 120,
        (Phase::V, Trend::Falling) => 300,
        (Phase::W, Trend::Rising) => 240,
        (Phase::W, Trend::Falling) => 60,
        (_, Trend::Unknown) => 0,
    }
}

#[derive(Debug, Clone, Copy)]
struct PhaseTracker {
    trend: Trend,
    last_mv: u32,
}

impl PhaseTracker {
    const fn new() -> Self {
        Self {
            trend: Trend::Unknown,
            last_mv: 0,
        }
    }
}

/// 3相ゼロクロス検出器
#[derive(Debug, Clone)]
pub struct ZeroCrossDetector {
    phases: [PhaseTracker; 3],
}

impl ZeroCrossDetector {
    pub const fn new() -> Self {
        Self {
            phases: [PhaseTracker::new(); 3],
        }
    }

    /// 1相分のサンプルを処理し、ゼロクロスが発生したらその時のトレンドを返す
    ///
    /// リセット後の最初のサンプルは中性点との比較でトレンドを初期化するだけ。
    pub fn update(&mut self, phase: Phase, mv: u32, neutral_mv: u32) -> Option<Trend> {
        let tracker = &mut self.phases[phase.index()];

        if tracker.trend == Trend::Unknown {
            tracker.trend = if mv > neutral_mv {
                Trend::Rising
            } else {
                Trend::Falling
            };
            tracker.last_mv = mv;
            return None;
        }

        let prev = tracker.last_mv;
        if mv > prev {
            tracker.trend = Trend::Rising;
        } else if mv < prev {
            tracker.trend = Trend::Falling;
        }
        // 変化なしならトレンド維持
        tracker.last_mv = mv;

        if (prev > neutral_mv) != (mv > neutral_mv) {
            Some(tracker.trend)
        } else {
            None
        }
    }

    pub fn trend(&self, phase: Phase) -> Trend {
        self.phases[phase.index()].trend
    }

    pub fn last_mv(&self, phase: Phase) -> u32 {
        self.phases[phase.index()].last_mv
    }

    /// 3相のトレンドパターンから回転方向を判定（一致しなければ `None`）
    pub fn direction(&self) -> Option<Direction> {
        use Trend::{Falling, Rising};
        match [
            self.trend(Phase::U),
            self.trend(Phase::V),
            self.trend(Phase::W),
        ] {
            [Rising, Falling, Falling] => Some(Direction::Forward),
            [Falling, Rising, Rising] => Some(Direction::Reverse),
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        self.phases = [PhaseTracker::new(); 3];
    }
}

impl Default for ZeroCrossDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEUTRAL: u32 = 700;

    #[test]
    fn test_first_sample_only_seeds_trend() {
        let mut det = ZeroCrossDetector::new();
        assert_eq!(det.update(Phase::U, 900, NEUTRAL), None);
        assert_eq!(det.trend(Phase::U), Trend::Rising);
        assert_eq!(det.update(Phase::V, 100, NEUTRAL), None);
        assert_eq!(det.trend(Phase::V), Trend::Falling);
    }

    #[test]
    fn test_crossing_fires_on_side_change() {
        let mut det = ZeroCrossDetector::new();
        det.update(Phase::U, 500, NEUTRAL);
        assert_eq!(det.update(Phase::U, 600, NEUTRAL), None);
        assert_eq!(det.update(Phase::U, 800, NEUTRAL), Some(Trend::Rising));
        assert_eq!(det.update(Phase::U, 900, NEUTRAL), None);
        // 中性点より上のまま下降してもクロスしない
        assert_eq!(det.update(Phase::U, 750, NEUTRAL), None);
        assert_eq!(det.trend(Phase::U), Trend::Falling);
        assert_eq!(det.update(Phase::U, 650, NEUTRAL), Some(Trend::Falling));
    }

    #[test]
    fn test_flat_signal_keeps_trend() {
        let mut det = ZeroCrossDetector::new();
        det.update(Phase::W, 500, NEUTRAL);
        det.update(Phase::W, 400, NEUTRAL);
        assert_eq!(det.update(Phase::W, 400, NEUTRAL), None);
        assert_eq!(det.trend(Phase::W), Trend::Falling);
    }

    #[test]
    fn test_phase_angle_map() {
        assert_eq!(phase_angle(Phase::U, Trend::Rising), 0);
        assert_eq!(phase_angle(Phase::U, Trend::Falling), 180);
        assert_eq!(phase_angle(Phase::V, Trend::Rising), 120);
        assert_eq!(phase_angle(Phase::V, Trend::Falling), 300);
        assert_eq!(phase_angle(Phase::W, Trend::Rising), 240);
        assert_eq!(phase_angle(Phase::W, Trend::Falling), 60);
    }

    #[test]
    fn test_direction_patterns() {
        let mut det = ZeroCrossDetector::new();
        assert_eq!(det.direction(), None);

        det.update(Phase::U, 900, NEUTRAL);
        det.update(Phase::V, 100, NEUTRAL);
        det.update(Phase::W, 100, NEUTRAL);
        assert_eq!(det.direction(), Some(Direction::Forward));

        det.reset();
        det.update(Phase::U, 100, NEUTRAL);
        det.update(Phase::V, 900, NEUTRAL);
        det.update(Phase::W, 900, NEUTRAL);
        assert_eq!(det.direction(), Some(Direction::Reverse));

        det.update(Phase::W, 100, NEUTRAL);
        assert_eq!(det.direction(), None);
    }
}
