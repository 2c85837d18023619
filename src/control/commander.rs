use crate::control::rail_system::components::{Address, Speed, TurnoutState};
use async_trait::async_trait;
use log::info;
use tokio::sync::Mutex;

/// Outbound side of the control loop: whatever the scheduler decides
/// ends up here as concrete commands for the physical layout.
///
/// Implementations bridge to a digital command station. Commands must
/// not block the scheduler for long; buffer and flush elsewhere if the
/// link is slow.
#[async_trait]
pub trait Commander: Send + Sync {
    async fn set_speed(&self, train: Address, speed: Speed);

    async fn set_turnout(&self, turnout: Address, state: TurnoutState);

    /// Cuts power to every train immediately. Issued on a safety
    /// violation; must not depend on per-train state.
    async fn emergency_stop_all(&self);
}

/// A command as the layout would receive it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Command {
    Speed(Address, Speed),
    Turnout(Address, TurnoutState),
    EmergencyStopAll,
}

/// Commander that only logs, for running a layout model without
/// hardware attached.
pub struct NullCommander;

#[async_trait]
impl Commander for NullCommander {
    async fn set_speed(&self, train: Address, speed: Speed) {
        info!("speed {speed} for train {train}");
    }

    async fn set_turnout(&self, turnout: Address, state: TurnoutState) {
        info!("turnout {turnout} to {state:?}");
    }

    async fn emergency_stop_all(&self) {
        info!("emergency stop");
    }
}

/// Commander that records every command in order, for tests.
#[derive(Default)]
pub struct RecordingCommander {
    commands: Mutex<Vec<Command>>,
}

impl RecordingCommander {
    pub fn new() -> Self {
        RecordingCommander::default()
    }

    pub async fn commands(&self) -> Vec<Command> {
        self.commands.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.commands.lock().await.clear();
    }
}

#[async_trait]
impl Commander for RecordingCommander {
    async fn set_speed(&self, train: Address, speed: Speed) {
        self.commands.lock().await.push(Command::Speed(train, speed));
    }

    async fn set_turnout(&self, turnout: Address, state: TurnoutState) {
        self.commands
            .lock()
            .await
            .push(Command::Turnout(turnout, state));
    }

    async fn emergency_stop_all(&self) {
        self.commands.lock().await.push(Command::EmergencyStopAll);
    }
}
