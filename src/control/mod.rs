//! Control-channel surface (input/rumble). This is deliberately a thin
//! interface: wire-level input encoding and rumble feedback parsing are out
//! of scope, only the event/command shapes are defined here.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonState {
    Press,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StickState {
    pub lx: i16,
    pub ly: i16,
    pub rx: i16,
    pub ry: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerState {
    pub l2: u8,
    pub r2: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RumbleEvent {
    pub small: u8,
    pub large: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    NotConnected,
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::NotConnected => write!(f, "control channel is not connected"),
        }
    }
}

impl std::error::Error for ControlError {}

pub trait ControlChannel: Send + Sync {
    fn connect(&mut self) -> Result<(), ControlError>;
    fn disconnect(&mut self) -> Result<(), ControlError>;
    fn send_button(&mut self, name: &str, state: ButtonState) -> Result<(), ControlError>;
    fn send_sticks(&mut self, sticks: StickState) -> Result<(), ControlError>;
    fn send_triggers(&mut self, triggers: TriggerState) -> Result<(), ControlError>;
}

/// No-op control channel used where a session has no bound controller yet.
pub struct NullControlChannel {
    connected: bool,
}

impl NullControlChannel {
    pub fn new() -> Self {
        Self { connected: false }
    }
}

impl Default for NullControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlChannel for NullControlChannel {
    fn connect(&mut self) -> Result<(), ControlError> {
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), ControlError> {
        self.connected = false;
        Ok(())
    }

    fn send_button(&mut self, _name: &str, _state: ButtonState) -> Result<(), ControlError> {
        if !self.connected {
            return Err(ControlError::NotConnected);
        }
        Ok(())
    }

    fn send_sticks(&mut self, _sticks: StickState) -> Result<(), ControlError> {
        if !self.connected {
            return Err(ControlError::NotConnected);
        }
        Ok(())
    }

    fn send_triggers(&mut self, _triggers: TriggerState) -> Result<(), ControlError> {
        if !self.connected {
            return Err(ControlError::NotConnected);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_commands_before_connect() {
        let mut ch = NullControlChannel::new();
        assert_eq!(
            ch.send_button("cross", ButtonState::Press),
            Err(ControlError::NotConnected)
        );
    }

    #[test]
    fn accepts_commands_after_connect() {
        let mut ch = NullControlChannel::new();
        ch.connect().unwrap();
        assert!(ch.send_sticks(StickState { lx: 0, ly: 0, rx: 0, ry: 0 }).is_ok());
    }
}
