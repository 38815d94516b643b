// * Series Smoothing
// * Noise reduction applied once to a historical series before it is cached

/// Transform applied to a raw historical series
pub trait Smoother: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns a series of the same length
    fn smooth(&self, values: &[f64]) -> Vec<f64>;
}

/// Trailing simple moving average
///
/// Point `i` is the mean of the `window` points ending at `i`; the first
/// points average over what is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovingAverage {
    window: usize,
}

impl MovingAverage {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }
}

impl Smoother for MovingAverage {
    fn name(&self) -> &'static str {
        "moving_average"
    }

    fn smooth(&self, values: &[f64]) -> Vec<f64> {
        let mut out = Vec::with_capacity(values.len());
        let mut sum = 0.0;

        for (i, value) in values.iter().enumerate() {
            sum += value;
            if i >= self.window {
                sum -= values[i - self.window];
            }
            let n = (i + 1).min(self.window);
            out.push(sum / n as f64);
        }

        out
    }
}
