//! Loss bookkeeping: moving average, per-epoch history, throughput.

use std::collections::VecDeque;
use std::fmt;

use anyhow::bail;

/// Mean of the last `capacity` values.
#[derive(Debug, Clone)]
pub struct Average {
    capacity: usize,
    values: VecDeque<f64>,
    sum: f64,
}

impl Average {
    /// A zero capacity is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
            sum: 0.0,
        }
    }

    pub fn add_value(&mut self, x: f64) {
        self.values.push_back(x);
        self.sum += x;
        if self.values.len() > self.capacity {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
            }
        }
    }

    /// 0.0 when empty.
    pub fn avg(&self) -> f64 {
        if self.values.is_empty() {
            0.0
        } else {
            self.sum / self.values.len() as f64
        }
    }

    pub fn reset(&mut self) {
        self.values.clear();
        self.sum = 0.0;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Named, epoch-ordered series of values (e.g. validation loss).
#[derive(Debug, Clone)]
pub struct ValueHistory {
    name: String,
    points: Vec<(usize, f64)>,
}

impl ValueHistory {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            points: Vec::new(),
        }
    }

    /// Append a point; epochs must strictly increase.
    pub fn add_value(&mut self, epoch: usize, value: f64) -> anyhow::Result<()> {
        if let Some(&(last, _)) = self.points.last() {
            if epoch <= last {
                bail!("{}: epoch {epoch} recorded after epoch {last}", self.name);
            }
        }
        self.points.push((epoch, value));
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[(usize, f64)] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last(&self) -> Option<(usize, f64)> {
        self.points.last().copied()
    }

    /// Lowest value and its epoch.
    pub fn best(&self) -> Option<(usize, f64)> {
        self.points
            .iter()
            .copied()
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    pub fn format(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ValueHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.name)?;
        let best = self.best().map(|(epoch, _)| epoch);
        for &(epoch, value) in &self.points {
            write!(f, "\n  epoch {epoch:>3}: {value:.4}")?;
            if Some(epoch) == best {
                write!(f, " *")?;
            }
        }
        Ok(())
    }
}

/// `batch_size × seq_length / seconds`; 0 when no time has been measured.
pub fn tokens_per_second(batch_size: usize, seq_length: usize, seconds: f64) -> f64 {
    if seconds > 0.0 {
        (batch_size * seq_length) as f64 / seconds
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_evicts_oldest() {
        let mut avg = Average::new(3);
        assert_eq!(avg.avg(), 0.0);
        for x in [1.0, 2.0, 3.0, 4.0] {
            avg.add_value(x);
        }
        assert_eq!(avg.len(), 3);
        assert!((avg.avg() - 3.0).abs() < 1e-12);
        avg.reset();
        assert!(avg.is_empty());
        assert_eq!(avg.avg(), 0.0);
        avg.add_value(7.0);
        assert_eq!(avg.avg(), 7.0);
    }

    #[test]
    fn zero_capacity_keeps_latest() {
        let mut avg = Average::new(0);
        avg.add_value(1.0);
        avg.add_value(5.0);
        assert_eq!(avg.avg(), 5.0);
    }

    #[test]
    fn history_requires_increasing_epochs() {
        let mut h = ValueHistory::new("val loss");
        h.add_value(0, 2.5).unwrap();
        h.add_value(1, 2.0).unwrap();
        assert!(h.add_value(1, 1.9).is_err());
        assert!(h.add_value(0, 1.9).is_err());
        assert_eq!(h.len(), 2);
        assert_eq!(h.best(), Some((1, 2.0)));
    }

    #[test]
    fn history_format_marks_best() {
        let mut h = ValueHistory::new("val loss");
        h.add_value(0, 2.5).unwrap();
        h.add_value(1, 2.0).unwrap();
        h.add_value(2, 2.25).unwrap();
        assert_eq!(
            h.format(),
            "val loss:\n  epoch   0: 2.5000\n  epoch   1: 2.0000 *\n  epoch   2: 2.2500"
        );
    }

    #[test]
    fn throughput() {
        assert_eq!(tokens_per_second(2, 4, 0.5), 16.0);
        assert_eq!(tokens_per_second(2, 4, 0.0), 0.0);
    }
}
