use num_traits::{CheckedAdd, CheckedSub};
use std::hash::Hash;

/// Raw value a [`crate::control::rail_system::components::Speed`] is
/// built from.
pub type DefaultSpeedType = u8;

/// Numeric backing type for speed values.
///
/// Braking and acceleration arithmetic goes through the checked
/// operations so a ramp can never wrap around; running below zero is a
/// stop, not an underflow.
pub trait SpeedType:
    Copy + Clone + Eq + Hash + Ord + Send + Sync + CheckedAdd + CheckedSub + 'static
{
    /// One braking step. Subtracting this from a running speed yields
    /// the reduced speed a train holds between the brake and the stop
    /// trigger of a block.
    fn braking_delta() -> Self;

    /// Speed a train is set to when its start is granted.
    fn cruising() -> Self;

    fn step_down(&self, delta: &Self) -> Option<Self> {
        self.checked_sub(delta)
    }
}

impl SpeedType for u8 {
    fn braking_delta() -> Self {
        60
    }

    fn cruising() -> Self {
        100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_down_saturates_into_none() {
        assert_eq!(100u8.step_down(&60), Some(40));
        assert_eq!(40u8.step_down(&60), None);
    }
}
