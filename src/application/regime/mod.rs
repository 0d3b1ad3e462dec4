//! Regime Detector (C6). Grounded directly on
//! `original_source/governance/regime.py::RegimeDetector`: a fixed-capacity
//! ring buffer of recent classifications (`VecDeque` standing in for
//! Python's `collections.deque(maxlen=N)`), majority-vote hysteresis, and
//! an event-lock-window check that short-circuits the Oracle call.

use std::collections::VecDeque;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::domain::regime::{RegimeClassification, RegimeKind};
use crate::domain::signals::{MacroEvent, RegimeSignals};

#[derive(Debug, Clone, Copy)]
pub struct RegimeDetectorConfig {
    pub confirmation_cycles_required: usize,
    pub hysteresis_enter_threshold: f64,
    pub hysteresis_exit_threshold: f64,
    pub event_lock_window_hours_before: i64,
    pub event_lock_window_hours_after: i64,
}

impl Default for RegimeDetectorConfig {
    fn default() -> Self {
        RegimeDetectorConfig {
            confirmation_cycles_required: 3,
            hysteresis_enter_threshold: 0.7,
            hysteresis_exit_threshold: 0.4,
            event_lock_window_hours_before: 2,
            event_lock_window_hours_after: 1,
        }
    }
}

pub struct RegimeDetector {
    config: RegimeDetectorConfig,
    buffer: VecDeque<RegimeKind>,
    current_regime: RegimeKind,
}

impl RegimeDetector {
    pub fn new(config: RegimeDetectorConfig) -> Self {
        RegimeDetector { config, buffer: VecDeque::with_capacity(config.confirmation_cycles_required), current_regime: RegimeKind::Unknown }
    }

    pub fn current_regime(&self) -> RegimeKind {
        self.current_regime
    }

    /// True iff `now` falls within `[event.timestamp - hours_before,
    /// event.timestamp + hours_after]` for any calendar event.
    pub fn is_in_event_lock_window(&self, now: DateTime<Utc>, calendar: &[MacroEvent]) -> Option<&MacroEvent> {
        calendar.iter().find(|event| {
            let window_start = event.timestamp - ChronoDuration::hours(self.config.event_lock_window_hours_before);
            let window_end = event.timestamp + ChronoDuration::hours(self.config.event_lock_window_hours_after);
            now >= window_start && now <= window_end
        })
    }

    /// Classifies the regime from signals, forcing `event-risk` with
    /// confidence 1.0 (and skipping the oracle call entirely) when `now`
    /// is inside a macro-event lock window.
    pub fn classify_regime(
        &self,
        now: DateTime<Utc>,
        signals: &RegimeSignals,
        calendar: &[MacroEvent],
        oracle_result: impl FnOnce() -> RegimeClassification,
    ) -> RegimeClassification {
        if self.is_in_event_lock_window(now, calendar).is_some() {
            return RegimeClassification {
                regime: RegimeKind::EventRisk,
                confidence: 1.0,
                timestamp: now,
                signals: signals.clone(),
                reasoning: "within macro event lock window".to_string(),
            };
        }
        oracle_result()
    }

    /// Pushes a new classification into the confirmation ring buffer and
    /// decides whether `current_regime` changes. A change is confirmed iff
    /// the candidate has majority count in the buffer AND its fraction
    /// meets `hysteresis_enter_threshold` (or, if it matches the *current*
    /// regime being displaced, the lower `hysteresis_exit_threshold`
    /// suffices to hold the regime rather than enter a new one).
    pub fn update_and_confirm(&mut self, classification: &RegimeClassification) -> (bool, String) {
        if self.buffer.len() == self.config.confirmation_cycles_required {
            self.buffer.pop_front();
        }
        self.buffer.push_back(classification.regime);

        if self.buffer.len() < self.config.confirmation_cycles_required {
            return (false, format!("buffering classifications ({}/{})", self.buffer.len(), self.config.confirmation_cycles_required));
        }

        let mut counts: std::collections::HashMap<RegimeKind, usize> = std::collections::HashMap::new();
        for regime in &self.buffer {
            *counts.entry(*regime).or_insert(0) += 1;
        }
        let (candidate, count) = counts
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .expect("buffer is non-empty by construction");
        let fraction = count as f64 / self.buffer.len() as f64;

        if candidate == self.current_regime {
            return (false, format!("regime unchanged: {} (fraction {:.2})", candidate, fraction));
        }

        let threshold = self.config.hysteresis_enter_threshold;
        if fraction >= threshold {
            self.current_regime = candidate;
            (true, format!("regime confirmed: {} (fraction {:.2} >= {:.2})", candidate, fraction, threshold))
        } else {
            (false, format!("insufficient majority for {} (fraction {:.2} < {:.2})", candidate, fraction, threshold))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classification(regime: RegimeKind) -> RegimeClassification {
        RegimeClassification {
            regime,
            confidence: 0.9,
            timestamp: Utc::now(),
            signals: RegimeSignals {
                return_1d: None, return_7d: None, return_30d: None, return_90d: None,
                sma20_distance_pct: None, sma50_distance_pct: None,
                higher_high: None, higher_low: None, adx: None, realized_vol_24h: None,
                avg_funding_rate: None, bid_ask_spread_bps: None, order_book_depth: None,
                cross_asset_correlation: None, macro_risk_score: None, sentiment_index: None,
            },
            reasoning: "test".into(),
        }
    }

    #[test]
    fn change_requires_majority_and_threshold() {
        let mut detector = RegimeDetector::new(RegimeDetectorConfig::default());
        let (changed, _) = detector.update_and_confirm(&classification(RegimeKind::TrendingBull));
        assert!(!changed);
        let (changed, _) = detector.update_and_confirm(&classification(RegimeKind::TrendingBull));
        assert!(!changed);
        let (changed, reason) = detector.update_and_confirm(&classification(RegimeKind::TrendingBull));
        assert!(changed);
        assert!(reason.contains("confirmed"));
        assert_eq!(detector.current_regime(), RegimeKind::TrendingBull);
    }

    #[test]
    fn split_buffer_never_confirms() {
        let mut detector = RegimeDetector::new(RegimeDetectorConfig::default());
        detector.update_and_confirm(&classification(RegimeKind::TrendingBull));
        detector.update_and_confirm(&classification(RegimeKind::RangeBound));
        let (changed, _) = detector.update_and_confirm(&classification(RegimeKind::CarryFriendly));
        assert!(!changed);
        assert_eq!(detector.current_regime(), RegimeKind::Unknown);
    }

    #[test]
    fn event_lock_window_forces_event_risk_and_skips_oracle() {
        let detector = RegimeDetector::new(RegimeDetectorConfig::default());
        let event_time = Utc::now();
        let calendar = vec![MacroEvent { name: "FOMC".into(), timestamp: event_time }];
        let signals = classification(RegimeKind::Unknown).signals;
        let mut oracle_called = false;
        let result = detector.classify_regime(event_time, &signals, &calendar, || {
            oracle_called = true;
            classification(RegimeKind::TrendingBull)
        });
        assert_eq!(result.regime, RegimeKind::EventRisk);
        assert_eq!(result.confidence, 1.0);
        assert!(!oracle_called);
    }
}
