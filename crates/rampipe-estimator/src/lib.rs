//! RamPipe Workload Estimator
//!
//! Tracks a decayed write-rate per watched path and turns it into
//! hysteresis-gated promote/demote requests. The estimator never executes
//! a pin itself: decisions are queued to the daemon over a channel, and
//! the authoritative pin state flows back through [`WorkloadEstimator::mark_pinned`].

use dashmap::DashMap;
use parking_lot::Mutex;
use rampipe_common::config::ThresholdConfig;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::debug;

/// A promote or demote request derived from observed write activity
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeatAction {
    /// The path is hot; pin it (snapshot backend, automatic mode)
    Promote(PathBuf),
    /// The path has cooled; sync and unpin it
    Demote(PathBuf),
}

/// Per-path estimator state
///
/// `pinned` and `loop_device` cache what the control plane last told us;
/// the state store stays authoritative.
#[derive(Clone, Debug, Default)]
pub struct WorkloadSample {
    /// Decayed write-activity accumulator, unitless, never negative
    pub r: f64,
    /// Timestamp of the previous observation, seconds
    pub last_event: Option<f64>,
    /// Cached pin state fed back by the control plane
    pub pinned: bool,
    /// Cached loop-device handle (snapshot backend)
    pub loop_device: Option<String>,
}

/// Exponential-moving-average write-rate tracker with hysteresis
pub struct WorkloadEstimator {
    samples: DashMap<PathBuf, Mutex<WorkloadSample>>,
    thresholds: ThresholdConfig,
    actions: mpsc::UnboundedSender<HeatAction>,
}

impl WorkloadEstimator {
    /// Create an estimator and the receiving end of its action queue
    #[must_use]
    pub fn new(thresholds: ThresholdConfig) -> (Self, mpsc::UnboundedReceiver<HeatAction>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                samples: DashMap::new(),
                thresholds,
                actions: tx,
            },
            rx,
        )
    }

    /// Fold one filesystem event into the path's write-rate estimate and
    /// queue a promote/demote request if a threshold was crossed
    ///
    /// Never blocks on or propagates failures of the triggered action; a
    /// filesystem-event callback must survive any single bad decision.
    pub fn observe(&self, path: &Path, timestamp: f64, is_write: bool) {
        let entry = self
            .samples
            .entry(path.to_path_buf())
            .or_insert_with(|| Mutex::new(WorkloadSample::default()));
        let mut sample = entry.lock();

        // Decay is always relative to the immediately preceding update
        let decay = match sample.last_event {
            Some(last) => (-((timestamp - last).max(0.0)) / self.thresholds.tau_secs).exp(),
            None => 1.0,
        };
        sample.r = decay * sample.r + f64::from(u8::from(is_write));
        sample.last_event = Some(timestamp);

        let rate = sample.r * (60.0 / self.thresholds.tau_secs);
        let action = if rate > self.thresholds.pin_writes && !sample.pinned {
            Some(HeatAction::Promote(path.to_path_buf()))
        } else if rate < self.thresholds.unpin_writes && sample.pinned {
            Some(HeatAction::Demote(path.to_path_buf()))
        } else {
            None
        };
        drop(sample);

        if let Some(action) = action {
            debug!("estimator: rate {rate:.1}/min for {} -> {action:?}", path.display());
            if self.actions.send(action).is_err() {
                debug!("no action consumer running; decision dropped");
            }
        }
    }

    /// Feed back the authoritative pin state after a pin or unpin
    pub fn mark_pinned(&self, path: &Path, pinned: bool, loop_device: Option<String>) {
        let entry = self
            .samples
            .entry(path.to_path_buf())
            .or_insert_with(|| Mutex::new(WorkloadSample::default()));
        let mut sample = entry.lock();
        sample.pinned = pinned;
        sample.loop_device = if pinned { loop_device } else { None };
    }

    /// Current estimated write rate in writes/minute, without re-anchoring
    #[must_use]
    pub fn rate(&self, path: &Path) -> Option<f64> {
        self.samples
            .get(path)
            .map(|e| e.lock().r * (60.0 / self.thresholds.tau_secs))
    }

    /// Cloned sample for inspection
    #[must_use]
    pub fn sample(&self, path: &Path) -> Option<WorkloadSample> {
        self.samples.get(path).map(|e| e.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn thresholds() -> ThresholdConfig {
        ThresholdConfig {
            pin_writes: 10.0,
            unpin_writes: 2.0,
            tau_secs: 30.0,
        }
    }

    #[test]
    fn test_first_observation_has_no_decay() {
        let (est, _rx) = WorkloadEstimator::new(thresholds());
        est.observe(Path::new("/f"), 1000.0, true);
        let sample = est.sample(Path::new("/f")).unwrap();
        assert_eq!(sample.r, 1.0);
        assert_eq!(sample.last_event, Some(1000.0));
    }

    #[test]
    fn test_read_events_only_decay() {
        let (est, _rx) = WorkloadEstimator::new(thresholds());
        est.observe(Path::new("/f"), 0.0, true);
        est.observe(Path::new("/f"), 30.0, false);
        let r = est.sample(Path::new("/f")).unwrap().r;
        assert!((r - (-1.0f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let mut rng = StdRng::seed_from_u64(7);
        let sequence: Vec<(f64, bool)> = {
            let mut t = 0.0;
            (0..200)
                .map(|_| {
                    t += rng.gen_range(0.01..20.0);
                    (t, rng.gen_bool(0.7))
                })
                .collect()
        };

        let run = |seq: &[(f64, bool)]| {
            let (est, _rx) = WorkloadEstimator::new(thresholds());
            for (t, w) in seq {
                est.observe(Path::new("/f"), *t, *w);
            }
            est.sample(Path::new("/f")).unwrap().r
        };

        assert_eq!(run(&sequence).to_bits(), run(&sequence).to_bits());
    }

    #[test]
    fn test_r_stays_in_bounds() {
        let tau = thresholds().tau_secs;
        let dt_min = 0.5;
        let bound = 1.0 / (1.0 - (-dt_min / tau).exp());
        let mut rng = StdRng::seed_from_u64(42);
        let (est, _rx) = WorkloadEstimator::new(thresholds());
        let mut t = 0.0;
        for _ in 0..5000 {
            t += rng.gen_range(dt_min..dt_min * 10.0);
            est.observe(Path::new("/f"), t, rng.gen_bool(0.9));
            let r = est.sample(Path::new("/f")).unwrap().r;
            assert!(r >= 0.0);
            assert!(r <= bound);
        }
    }

    #[test]
    fn test_promotion_then_demotion_with_hysteresis() {
        let (est, mut rx) = WorkloadEstimator::new(thresholds());
        let path = Path::new("/srv/hot.db");

        // A burst of writes pushes the rate over the pin threshold
        let mut t = 0.0;
        for _ in 0..8 {
            t += 0.1;
            est.observe(path, t, true);
        }
        assert_eq!(rx.try_recv().unwrap(), HeatAction::Promote(path.into()));
        while rx.try_recv().is_ok() {}

        // Until the control plane confirms, repeat observations re-request
        t += 0.1;
        est.observe(path, t, true);
        assert_eq!(rx.try_recv().unwrap(), HeatAction::Promote(path.into()));

        est.mark_pinned(path, true, Some("/dev/loop0".to_string()));

        // Still hot: pinned, so no further promote
        t += 0.1;
        est.observe(path, t, true);
        assert!(rx.try_recv().is_err());

        // Long idle gap decays the rate below the unpin threshold
        t += 600.0;
        est.observe(path, t, false);
        assert_eq!(rx.try_recv().unwrap(), HeatAction::Demote(path.into()));
    }

    #[test]
    fn test_no_action_inside_hysteresis_band() {
        let (est, mut rx) = WorkloadEstimator::new(thresholds());
        let path = Path::new("/f");
        // Two writes in quick succession: rate ~ 4/min, between 2 and 10
        est.observe(path, 0.0, true);
        est.observe(path, 0.1, true);
        let rate = est.rate(path).unwrap();
        assert!(rate > 2.0 && rate < 10.0);
        assert!(rx.try_recv().is_err());

        // Same band while pinned: no demote either
        est.mark_pinned(path, true, None);
        est.observe(path, 0.2, true);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_actions_respect_gating_under_random_load() {
        let thresholds = thresholds();
        let (est, mut rx) = WorkloadEstimator::new(thresholds.clone());
        let path = Path::new("/f");
        let mut rng = StdRng::seed_from_u64(99);
        let mut t = 0.0;
        let mut pinned = false;

        for _ in 0..2000 {
            t += rng.gen_range(0.01..60.0);
            est.observe(path, t, rng.gen_bool(0.5));
            let rate = est.rate(path).unwrap();
            match rx.try_recv() {
                Ok(HeatAction::Promote(_)) => {
                    assert!(rate > thresholds.pin_writes);
                    assert!(!pinned);
                    pinned = true;
                    est.mark_pinned(path, true, None);
                }
                Ok(HeatAction::Demote(_)) => {
                    assert!(rate < thresholds.unpin_writes);
                    assert!(pinned);
                    pinned = false;
                    est.mark_pinned(path, false, None);
                }
                Err(_) => {}
            }
        }
    }

    #[test]
    fn test_paths_tracked_independently() {
        let (est, mut rx) = WorkloadEstimator::new(thresholds());
        let mut t = 0.0;
        for _ in 0..8 {
            t += 0.1;
            est.observe(Path::new("/hot"), t, true);
            est.observe(Path::new("/cold"), t, false);
        }
        let mut actions = Vec::new();
        while let Ok(action) = rx.try_recv() {
            actions.push(action);
        }
        assert!(!actions.is_empty());
        assert!(
            actions
                .iter()
                .all(|a| *a == HeatAction::Promote(PathBuf::from("/hot")))
        );
        assert_eq!(est.sample(Path::new("/cold")).unwrap().r, 0.0);
    }

    #[test]
    fn test_mark_unpinned_clears_loop_device() {
        let (est, _rx) = WorkloadEstimator::new(thresholds());
        let path = Path::new("/f");
        est.mark_pinned(path, true, Some("/dev/loop3".to_string()));
        assert_eq!(
            est.sample(path).unwrap().loop_device.as_deref(),
            Some("/dev/loop3")
        );
        est.mark_pinned(path, false, None);
        assert!(est.sample(path).unwrap().loop_device.is_none());
    }
}
