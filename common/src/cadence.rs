/// Elapsed-time gate for one cooperative sub-task of the control loop.
#[derive(Debug, Clone, Copy)]
pub struct Cadence {
    period_ms: u64,
    last_run_ms: Option<u64>,
}

impl Cadence {
    pub fn new(period_ms: u64) -> Self {
        Self {
            period_ms,
            last_run_ms: None,
        }
    }

    /// True on the first call and then once per period; marks the run.
    pub fn due(&mut self, now_ms: u64) -> bool {
        match self.last_run_ms {
            Some(last) if now_ms.saturating_sub(last) < self.period_ms => false,
            _ => {
                self.last_run_ms = Some(now_ms);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last_run_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_per_period() {
        let mut cadence = Cadence::new(1_000);
        assert!(cadence.due(50));
        assert!(!cadence.due(500));
        assert!(!cadence.due(1_049));
        assert!(cadence.due(1_050));
        assert!(!cadence.due(1_051));

        cadence.reset();
        assert!(cadence.due(1_052));
    }
}
