use crate::control::rail_system::components::{Address, SensorLevel, Speed, TurnoutState};
use std::time::Duration;

/// Everything the outside world may tell the scheduler.
///
/// Sensor activations, turnout acknowledgements and power changes all
/// arrive here and are worked off one at a time by the single consumer
/// task.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Message {
    /// Track power restored. Clears an emergency halt.
    RailOn,
    /// Track power lost or cut. Halts everything.
    RailOff,
    /// A speed reported or requested for a hand-driven train.
    TrainSpeed(Address, Speed),
    /// Request to throw a turnout.
    Turnout(Address, TurnoutState),
    /// A turnout confirmed its new state.
    TurnoutAck(Address, TurnoutState),
    /// A sensor changed level.
    UpdateSensor(Address, SensorLevel),
    /// Wall time passed, for station holds and countdowns.
    Tick(Duration),
}
