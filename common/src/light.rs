use crate::error::DeviceError;

/// PWM-capable light driver taking an 8-bit duty.
pub trait DimmerOutput {
    fn set_duty(&mut self, duty: u8) -> Result<(), DeviceError>;
}

impl<T: DimmerOutput + ?Sized> DimmerOutput for Box<T> {
    fn set_duty(&mut self, duty: u8) -> Result<(), DeviceError> {
        (**self).set_duty(duty)
    }
}

/// Last applied duty cycle. Hardware is only touched when the target changes.
#[derive(Debug)]
pub struct LightOutput<O> {
    output: O,
    duty_cycle: Option<u8>,
}

impl<O: DimmerOutput> LightOutput<O> {
    pub fn new(output: O) -> Self {
        Self {
            output,
            duty_cycle: None,
        }
    }

    /// Drives the fixture dark regardless of the cached value.
    pub fn force_off(&mut self) -> Result<(), DeviceError> {
        self.output.set_duty(0)?;
        self.duty_cycle = Some(0);
        Ok(())
    }

    /// Returns whether the hardware was written.
    pub fn apply(&mut self, duty: u8) -> Result<bool, DeviceError> {
        if self.duty_cycle == Some(duty) {
            return Ok(false);
        }
        self.output.set_duty(duty)?;
        self.duty_cycle = Some(duty);
        Ok(true)
    }

    pub fn duty_cycle(&self) -> u8 {
        self.duty_cycle.unwrap_or(0)
    }

    pub fn output(&self) -> &O {
        &self.output
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::RecordingDimmer;

    #[test]
    fn writes_only_on_change() {
        let mut light = LightOutput::new(RecordingDimmer::default());
        light.force_off().unwrap();

        assert!(!light.apply(0).unwrap());
        assert!(light.apply(120).unwrap());
        assert!(!light.apply(120).unwrap());
        assert!(light.apply(121).unwrap());

        assert_eq!(light.output().writes, vec![0, 120, 121]);
        assert_eq!(light.duty_cycle(), 121);
    }

    #[test]
    fn failed_write_is_retried_next_time() {
        let mut failing = LightOutput::new(RecordingDimmer::failing());
        assert!(failing.apply(10).is_err());
        assert_eq!(failing.duty_cycle(), 0);
        assert!(failing.apply(10).is_err());
        assert_eq!(failing.output().attempts, 2);
    }
}
