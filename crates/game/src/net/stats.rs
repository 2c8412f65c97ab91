/// Traffic counters kept by endpoints and sessions.
#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl NetworkStats {
    pub fn record_sent(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
    }

    pub fn record_dropped(&mut self) {
        self.packets_dropped += 1;
    }
}

/// Smoothed round-trip estimate from PING/PONG samples, in milliseconds.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: f32,
    rtt_var: f32,
    samples: u32,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            srtt: 100.0,
            rtt_var: 50.0,
            samples: 0,
        }
    }
}

impl RttEstimator {
    pub fn update(&mut self, rtt_ms: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        if self.samples == 0 {
            self.srtt = rtt_ms;
            self.rtt_var = rtt_ms / 2.0;
        } else {
            let diff = (rtt_ms - self.srtt).abs();
            self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
            self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt_ms;
        }
        self.samples = self.samples.saturating_add(1);
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_estimate() {
        let mut rtt = RttEstimator::default();
        rtt.update(40.0);
        assert_eq!(rtt.srtt(), 40.0);
        assert_eq!(rtt.rtt_var(), 20.0);
    }

    #[test]
    fn later_samples_are_smoothed() {
        let mut rtt = RttEstimator::default();
        rtt.update(40.0);
        rtt.update(120.0);
        assert!((rtt.srtt() - 50.0).abs() < 1e-4);
        assert!((rtt.rtt_var() - 35.0).abs() < 1e-4);
        assert_eq!(rtt.samples(), 2);
    }
}
