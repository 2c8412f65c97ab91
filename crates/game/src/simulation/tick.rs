use std::time::Duration;

/// Cap on wall time credited per call; a stalled host runs a few catch-up
/// ticks and then drops the rest.
const MAX_CATCH_UP: Duration = Duration::from_millis(250);

/// Converts wall-clock deltas into whole simulation ticks.
#[derive(Debug, Clone)]
pub struct FixedTimestep {
    tick_rate: u32,
    tick: Duration,
    backlog: Duration,
}

impl FixedTimestep {
    pub fn new(tick_rate: u32) -> Self {
        let tick_rate = tick_rate.max(1);
        Self {
            tick_rate,
            tick: Duration::from_secs(1) / tick_rate,
            backlog: Duration::ZERO,
        }
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    /// Tick length in seconds, as fed to the simulation.
    pub fn dt(&self) -> f32 {
        self.tick.as_secs_f32()
    }

    pub fn accumulate(&mut self, elapsed: Duration) {
        self.backlog += elapsed.min(MAX_CATCH_UP);
    }

    pub fn consume_tick(&mut self) -> bool {
        match self.backlog.checked_sub(self.tick) {
            Some(rest) => {
                self.backlog = rest;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(ts: &mut FixedTimestep) -> u32 {
        let mut ticks = 0;
        while ts.consume_tick() {
            ticks += 1;
        }
        ticks
    }

    #[test]
    fn partial_ticks_carry_over() {
        let mut ts = FixedTimestep::new(60);

        ts.accumulate(Duration::from_millis(34));
        assert_eq!(drain(&mut ts), 2);

        ts.accumulate(Duration::from_millis(16));
        assert_eq!(drain(&mut ts), 1);
    }

    #[test]
    fn long_stall_is_clamped() {
        let mut ts = FixedTimestep::new(8);
        ts.accumulate(Duration::from_secs(5));
        assert_eq!(drain(&mut ts), 2);
    }

    #[test]
    fn zero_rate_is_treated_as_one() {
        let ts = FixedTimestep::new(0);
        assert_eq!(ts.tick_rate(), 1);
        assert_eq!(ts.dt(), 1.0);
    }
}
