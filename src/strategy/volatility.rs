//! Rolling volatility estimate shared by the quoting strategies.

use std::collections::VecDeque;

/// Standard deviation of recent one-step returns over a bounded price
/// window, clamped to a configured band.
///
/// Works in `f64`; callers convert back to `Decimal` at the quoting
/// boundary.
#[derive(Debug, Clone)]
pub struct VolatilityEstimator {
    prices: VecDeque<f64>,
    capacity: usize,
    min: f64,
    max: f64,
}

impl Default for VolatilityEstimator {
    fn default() -> Self {
        Self::new(100, 0.001, 0.1)
    }
}

impl VolatilityEstimator {
    /// An estimator over the last `capacity` prices, clamped to
    /// `[min, max]`.
    #[must_use]
    pub fn new(capacity: usize, min: f64, max: f64) -> Self {
        Self {
            prices: VecDeque::with_capacity(capacity),
            capacity,
            min,
            max,
        }
    }

    /// Record one price, evicting the oldest when full. Non-positive
    /// prices are ignored so a bad tick cannot poison the return series.
    pub fn record(&mut self, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        if self.prices.len() == self.capacity {
            self.prices.pop_front();
        }
        self.prices.push_back(price);
    }

    /// Number of recorded prices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.prices.len()
    }

    /// True when no prices have been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    /// Current estimate. With fewer than two prices there are no returns
    /// yet, so the lower clamp bound is returned.
    #[must_use]
    pub fn estimate(&self) -> f64 {
        if self.prices.len() < 2 {
            return self.min;
        }
        let returns: Vec<f64> = self
            .prices
            .iter()
            .zip(self.prices.iter().skip(1))
            .map(|(prev, next)| next / prev - 1.0)
            .collect();
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance =
            returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
        variance.sqrt().clamp(self.min, self.max)
    }
}
