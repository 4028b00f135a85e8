//! Device command catalogue
//!
//! Every request the engine issues is a command code followed by a
//! command-specific payload. The framer adds the header around it.

/// Command codes understood by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandCode {
    /// Query status, battery and firmware versions (0x10)
    GetStatus = 0x10,
    /// Start or stop measurements (0x18)
    Measurements = 0x18,
    /// Initialize the session (0x1A)
    Init = 0x1A,
    /// Set the sampling period (0x1B)
    SetMeasurementPeriod = 0x1B,
    /// Query the descriptor of one sensor channel (0x50)
    GetSensorInfo = 0x50,
    /// Query the mask of available sensor channels (0x51)
    GetSensorIds = 0x51,
    /// Disconnect the session (0x54)
    Disconnect = 0x54,
    /// Query device identity strings (0x55)
    GetInfo = 0x55,
    /// Query the mask of sensors enabled by default (0x56)
    GetDefaultSensorsMask = 0x56,
}

impl CommandCode {
    /// Get command code from u8
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x10 => Some(Self::GetStatus),
            0x18 => Some(Self::Measurements),
            0x1A => Some(Self::Init),
            0x1B => Some(Self::SetMeasurementPeriod),
            0x50 => Some(Self::GetSensorInfo),
            0x51 => Some(Self::GetSensorIds),
            0x54 => Some(Self::Disconnect),
            0x55 => Some(Self::GetInfo),
            0x56 => Some(Self::GetDefaultSensorsMask),
            _ => None,
        }
    }

    /// Get name of command
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetStatus => "Get Status",
            Self::Measurements => "Start/Stop Measurements",
            Self::Init => "Init",
            Self::SetMeasurementPeriod => "Set Measurement Period",
            Self::GetSensorInfo => "Get Sensor Info",
            Self::GetSensorIds => "Get Sensor IDs",
            Self::Disconnect => "Disconnect",
            Self::GetInfo => "Get Device Info",
            Self::GetDefaultSensorsMask => "Get Default Sensors Mask",
        }
    }
}

/// Payload of the INIT command
const INIT_PAYLOAD: [u8; 20] = [
    0xA5, 0x4A, 0x06, 0x49, 0x07, 0x48, 0x08, 0x47, 0x09, 0x46, 0x0A, 0x45, 0x0B, 0x44, 0x0C,
    0x43, 0x0D, 0x42, 0x0E, 0x41,
];

/// Channel selector meaning "all channels"
const ALL_CHANNELS: u8 = 0xFF;

/// A command ready to be framed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Raw command code
    pub code: u8,
    /// Command-specific payload
    pub payload: Vec<u8>,
}

impl Command {
    /// Create a command from a raw code and payload
    pub fn raw(code: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    fn of(code: CommandCode, payload: impl Into<Vec<u8>>) -> Self {
        Self::raw(code as u8, payload)
    }

    /// INIT
    pub fn init() -> Self {
        Self::of(CommandCode::Init, INIT_PAYLOAD)
    }

    /// GET_STATUS
    pub fn status() -> Self {
        Self::of(CommandCode::GetStatus, Vec::new())
    }

    /// GET_DEFAULT_SENSORS_MASK
    pub fn default_sensors_mask() -> Self {
        Self::of(CommandCode::GetDefaultSensorsMask, Vec::new())
    }

    /// GET_SENSOR_IDS
    pub fn sensor_ids() -> Self {
        Self::of(CommandCode::GetSensorIds, vec![0x00])
    }

    /// GET_SENSOR_INFO for one channel
    pub fn sensor_info(channel: u8) -> Self {
        Self::of(CommandCode::GetSensorInfo, vec![channel])
    }

    /// GET_INFO
    pub fn device_info() -> Self {
        Self::of(CommandCode::GetInfo, Vec::new())
    }

    /// DISCONNECT
    pub fn disconnect() -> Self {
        Self::of(CommandCode::Disconnect, Vec::new())
    }

    /// SET_MEASUREMENT_PERIOD, period given in milliseconds.
    ///
    /// The device takes microseconds; fractional microseconds are rounded and
    /// the value saturates at `u32::MAX`.
    pub fn set_measurement_period(period_ms: f64) -> Self {
        let micros = (period_ms * 1000.0).round().clamp(0.0, f64::from(u32::MAX)) as u32;
        let mut payload = vec![ALL_CHANNELS];
        payload.extend_from_slice(&micros.to_le_bytes());
        payload.extend_from_slice(&[0x00, 0x00, 0x00]);
        Self::of(CommandCode::SetMeasurementPeriod, payload)
    }

    /// START_MEASUREMENTS for the channels in `channel_mask`
    pub fn start_measurements(channel_mask: u32) -> Self {
        let mut payload = vec![ALL_CHANNELS, 0x01];
        payload.extend_from_slice(&channel_mask.to_le_bytes());
        payload.extend_from_slice(&[0x00, 0x00, 0x00]);
        Self::of(CommandCode::Measurements, payload)
    }

    /// STOP_MEASUREMENTS
    pub fn stop_measurements() -> Self {
        Self::of(
            CommandCode::Measurements,
            vec![ALL_CHANNELS, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00],
        )
    }

    /// Known command code, if any
    pub fn known_code(&self) -> Option<CommandCode> {
        CommandCode::from_u8(self.code)
    }

    /// Human readable command name for logs
    pub fn name(&self) -> &'static str {
        self.known_code().map_or("Unknown", |c| c.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for code in [0x10u8, 0x18, 0x1A, 0x1B, 0x50, 0x51, 0x54, 0x55, 0x56] {
            assert_eq!(CommandCode::from_u8(code).map(|c| c as u8), Some(code));
        }
        assert_eq!(CommandCode::from_u8(0x99), None);
    }

    #[test]
    fn test_start_payload_carries_mask() {
        let cmd = Command::start_measurements(0b101);
        assert_eq!(cmd.code, 0x18);
        assert_eq!(cmd.payload, vec![0xFF, 0x01, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_period_in_microseconds() {
        let cmd = Command::set_measurement_period(100.0);
        assert_eq!(cmd.code, 0x1B);
        assert_eq!(&cmd.payload[1..5], &100_000u32.to_le_bytes());
        assert_eq!(cmd.payload.len(), 8);
    }

    #[test]
    fn test_init_payload() {
        let cmd = Command::init();
        assert_eq!(cmd.payload.len(), 20);
        assert_eq!(cmd.name(), "Init");
    }
}
