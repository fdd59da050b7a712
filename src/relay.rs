//! Serial relay driver
//!
//! Mirrors floor occupancy onto a serial-attached relay that keys the radio
//! transmitter. A port that cannot be opened, or that errors mid-run,
//! degrades the driver to disabled; audio service continues without it.

use log::{info, warn};
use parking_lot::Mutex;
use std::io::Write;
use std::time::Duration;

use crate::config::RelayConfig;

const CMD_ON: &[u8] = b"A1";
const CMD_OFF: &[u8] = b"A0";
const OPEN_TIMEOUT: Duration = Duration::from_millis(500);

struct RelayState {
    port: Option<Box<dyn serialport::SerialPort>>,
    energized: bool,
}

/// Relay driver; all writes are serialized through the internal lock.
pub struct RelayDriver {
    state: Mutex<RelayState>,
}

impl RelayDriver {
    /// Open the configured port. Open failure logs a warning and yields a
    /// disabled driver rather than an error.
    pub fn open(config: &RelayConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }

        let port = match serialport::new(&config.port, config.baud_rate)
            .timeout(OPEN_TIMEOUT)
            .open()
        {
            Ok(port) => {
                info!(
                    "Relay port {} open at {} baud",
                    config.port, config.baud_rate
                );
                Some(port)
            }
            Err(e) => {
                warn!(
                    "Failed to open relay port {}: {}; relay disabled",
                    config.port, e
                );
                None
            }
        };

        Self {
            state: Mutex::new(RelayState {
                port,
                energized: false,
            }),
        }
    }

    /// A driver whose operations are all no-ops.
    pub fn disabled() -> Self {
        Self {
            state: Mutex::new(RelayState {
                port: None,
                energized: false,
            }),
        }
    }

    /// Energize the relay (transmitter keyed).
    pub fn turn_on(&self) {
        self.write_command(CMD_ON, true);
    }

    /// De-energize the relay.
    pub fn turn_off(&self) {
        self.write_command(CMD_OFF, false);
    }

    /// Whether the last successful command energized the relay.
    pub fn is_energized(&self) -> bool {
        self.state.lock().energized
    }

    /// Whether a port is currently attached.
    pub fn is_enabled(&self) -> bool {
        self.state.lock().port.is_some()
    }

    fn write_command(&self, command: &[u8], energized: bool) {
        let mut state = self.state.lock();
        let Some(port) = state.port.as_mut() else {
            return;
        };

        if let Err(e) = port.write_all(command) {
            warn!(
                "Relay write failed: {}; relay disabled for the rest of the run",
                e
            );
            state.port = None;
            state.energized = false;
            return;
        }

        state.energized = energized;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_driver_is_inert() {
        let relay = RelayDriver::disabled();
        assert!(!relay.is_enabled());
        relay.turn_on();
        assert!(!relay.is_energized());
        relay.turn_off();
        assert!(!relay.is_energized());
    }

    #[test]
    fn open_with_bogus_port_degrades_to_disabled() {
        let config = RelayConfig {
            enabled: true,
            port: "/dev/nonexistent-relay-port".to_string(),
            baud_rate: 9600,
        };
        let relay = RelayDriver::open(&config);
        assert!(!relay.is_enabled());
        relay.turn_on();
        assert!(!relay.is_energized());
    }

    #[test]
    fn open_respects_enabled_flag() {
        let config = RelayConfig {
            enabled: false,
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
        };
        assert!(!RelayDriver::open(&config).is_enabled());
    }
}
