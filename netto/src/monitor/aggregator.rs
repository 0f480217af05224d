// Aggregation of raw samples into smoothed per-program bandwidth

use crate::process::{MonitorSnapshot, ProcessBandwidth, RawSample};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};

/// Number of flushes averaged per program
pub const DEFAULT_SMOOTHING_WINDOW: usize = 3;

/// Folds each debounce flush into per-name moving averages.
///
/// History is keyed by program name so several instances of the same
/// program show up as one row. A name missing from a flush loses its
/// history immediately.
#[derive(Debug)]
pub struct Aggregator {
    window: usize,
    history: HashMap<String, VecDeque<(u64, u64)>>,
}

impl Aggregator {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            history: HashMap::new(),
        }
    }

    /// Names currently holding history
    pub fn tracked(&self) -> usize {
        self.history.len()
    }

    /// Aggregate one flush worth of samples into a snapshot
    pub fn flush(&mut self, samples: Vec<RawSample>) -> MonitorSnapshot {
        let now = Utc::now();

        // name -> (first pid, summed in, summed out), in first-seen order
        let mut order: Vec<String> = Vec::new();
        let mut summed: HashMap<String, (i32, u64, u64)> = HashMap::new();
        for sample in samples {
            match summed.get_mut(&sample.name) {
                Some((_, bytes_in, bytes_out)) => {
                    *bytes_in = bytes_in.saturating_add(sample.bytes_in);
                    *bytes_out = bytes_out.saturating_add(sample.bytes_out);
                }
                None => {
                    order.push(sample.name.clone());
                    summed.insert(sample.name, (sample.pid, sample.bytes_in, sample.bytes_out));
                }
            }
        }

        self.history.retain(|name, _| summed.contains_key(name));

        let window = self.window;
        let mut processes = Vec::new();
        for name in order {
            let Some(&(pid, bytes_in, bytes_out)) = summed.get(&name) else {
                continue;
            };

            let history = self
                .history
                .entry(name.clone())
                .or_insert_with(|| VecDeque::with_capacity(window));
            history.push_back((bytes_in, bytes_out));
            while history.len() > window {
                history.pop_front();
            }

            let len = history.len() as f64;
            let download_speed = history.iter().map(|&(i, _)| i as f64).sum::<f64>() / len;
            let upload_speed = history.iter().map(|&(_, o)| o as f64).sum::<f64>() / len;

            if download_speed > 0.0 || upload_speed > 0.0 {
                processes.push(ProcessBandwidth {
                    name,
                    pid,
                    download_speed,
                    upload_speed,
                    history: history.iter().copied().collect(),
                    last_seen: now,
                });
            }
        }

        processes.sort_by(|a, b| {
            b.total_speed()
                .total_cmp(&a.total_speed())
                .then_with(|| a.name.cmp(&b.name))
        });

        if !processes.is_empty() {
            log::debug!("Aggregated {} active process(es)", processes.len());
        }

        MonitorSnapshot {
            captured_at: now,
            processes,
        }
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(DEFAULT_SMOOTHING_WINDOW)
    }
}
