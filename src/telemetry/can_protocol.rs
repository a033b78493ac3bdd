// CAN communication protocol definitions for the telemetry link

use crate::fmt::*;
use crate::telemetry::{ValueChanged, ValueItem};

/// CAN message IDs
pub mod can_ids {
    /// Target speed command (f32 RPM, 4 bytes)
    pub const SPEED_CMD: u32 = 0x100;

    /// Motor enable command (u8, 1 byte: 0=stop, 1=start)
    pub const ENABLE_CMD: u32 = 0x102;

    /// Motor status feedback (rpm: f32, phase: u16, state: u8, flags: u8, 8 bytes)
    pub const STATUS: u32 = 0x200;

    /// Voltage status feedback (voltage: f32, flags: u8, 5 bytes)
    pub const VOLTAGE_STATUS: u32 = 0x201;

    /// Value changed event (item: u8, value: f32, 5 bytes)
    pub const VALUE_CHANGED: u32 = 0x202;

    /// Emergency stop (any data length)
    pub const EMERGENCY_STOP: u32 = 0x000;
}

/// Inbound command from the telemetry link
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    SetSpeed(f32),
    Enable(bool),
    EmergencyStop,
}

/// Motor status flags (byte 7 of the status frame)
pub mod status_flags {
    /// Speed estimate is valid
    pub const SPEED_VALID: u8 = 0x01;
    /// Rotating in reverse
    pub const REVERSE: u8 = 0x02;
    /// Controller start requested
    pub const RUNNING: u8 = 0x04;
}

/// Parse an inbound frame into a command
///
/// # Arguments
/// * `id` - Standard CAN identifier
/// * `data` - CAN frame data
///
/// # Returns
/// * `Some(Command)` for a known id with valid data
/// * `None` otherwise
pub fn parse_command(id: u32, data: &[u8]) -> Option<Command> {
    match id {
        can_ids::EMERGENCY_STOP => {
            warn!("Emergency stop received");
            Some(Command::EmergencyStop)
        }
        can_ids::SPEED_CMD => parse_speed_command(data).map(Command::SetSpeed),
        can_ids::ENABLE_CMD => parse_enable_command(data).map(Command::Enable),
        _ => {
            debug!("Unknown CAN ID: 0x{:x}", id);
            None
        }
    }
}

/// Parse speed command from CAN data
///
/// # Arguments
/// * `data` - CAN frame data (should be 4 bytes)
///
/// # Returns
/// * `Some(speed_rpm)` if parsing successful
/// * `None` if data length is incorrect or the value is not a finite non-negative number
pub fn parse_speed_command(data: &[u8]) -> Option<f32> {
    if data.len() < 4 {
        error!("Speed command: invalid data length {}", data.len());
        return None;
    }

    let speed_rpm = f32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if !speed_rpm.is_finite() || speed_rpm < 0.0 {
        error!("Speed command: invalid value");
        return None;
    }

    info!("Speed command received: {} RPM", speed_rpm);
    Some(speed_rpm)
}

/// Parse enable command from CAN data
///
/// # Returns
/// * `Some(true)` if start command (data[0] != 0)
/// * `Some(false)` if stop command (data[0] == 0)
/// * `None` if data is empty
pub fn parse_enable_command(data: &[u8]) -> Option<bool> {
    let Some(&first) = data.first() else {
        error!("Enable command: no data");
        return None;
    };

    let enable = first != 0;
    info!("Motor enable command: {}", enable);
    Some(enable)
}

/// Encode motor status into CAN data
///
/// # Arguments
/// * `speed_rpm` - Filtered motor speed in RPM
/// * `phase_deg` - Electrical phase in degrees (60 degree steps)
/// * `state` - Motor state code
/// * `flags` - See [`status_flags`]
///
/// # Returns
/// 8-byte array containing encoded status
pub fn encode_status(speed_rpm: f32, phase_deg: u16, state: u8, flags: u8) -> [u8; 8] {
    let mut data = [0u8; 8];
    data[0..4].copy_from_slice(&speed_rpm.to_le_bytes());
    data[4..6].copy_from_slice(&phase_deg.to_le_bytes());
    data[6] = state;
    data[7] = flags;
    data
}

/// Encode voltage status into CAN data
///
/// # Arguments
/// * `voltage` - DC bus voltage in volts
/// * `overvoltage` - Above the allowed range
/// * `undervoltage` - Below the allowed range
///
/// # Returns
/// 5-byte array containing encoded voltage status
pub fn encode_voltage_status(voltage: f32, overvoltage: bool, undervoltage: bool) -> [u8; 5] {
    let mut data = [0u8; 5];
    data[0..4].copy_from_slice(&voltage.to_le_bytes());

    // Bit 0: overvoltage, bit 1: undervoltage
    let mut flags = 0u8;
    if overvoltage {
        flags |= 0x01;
    }
    if undervoltage {
        flags |= 0x02;
    }
    data[4] = flags;

    data
}

/// Encode a value changed event into CAN data
pub fn encode_value_changed(event: &ValueChanged) -> [u8; 5] {
    let mut data = [0u8; 5];
    data[0] = event.item as u8;
    data[1..5].copy_from_slice(&event.value.to_le_bytes());
    data
}

/// Decode a value changed event from CAN data
///
/// # Returns
/// * `None` if data length is incorrect or the item code is unknown
pub fn decode_value_changed(data: &[u8]) -> Option<ValueChanged> {
    if data.len() < 5 {
        return None;
    }
    let item = ValueItem::from_u8(data[0])?;
    let value = f32::from_le_bytes([data[1], data[2], data[3], data[4]]);
    Some(ValueChanged { item, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_speed_command() {
        let data = 1234.5f32.to_le_bytes();
        assert_eq!(parse_speed_command(&data), Some(1234.5));
        assert_eq!(parse_speed_command(&data[..3]), None);
        assert_eq!(parse_speed_command(&(-5.0f32).to_le_bytes()), None);
        assert_eq!(parse_speed_command(&f32::NAN.to_le_bytes()), None);
    }

    #[test]
    fn test_parse_command_dispatch() {
        assert_eq!(
            parse_command(can_ids::SPEED_CMD, &2000.0f32.to_le_bytes()),
            Some(Command::SetSpeed(2000.0))
        );
        assert_eq!(
            parse_command(can_ids::ENABLE_CMD, &[1]),
            Some(Command::Enable(true))
        );
        assert_eq!(
            parse_command(can_ids::ENABLE_CMD, &[0]),
            Some(Command::Enable(false))
        );
        assert_eq!(parse_command(can_ids::ENABLE_CMD, &[]), None);
        assert_eq!(
            parse_command(can_ids::EMERGENCY_STOP, &[]),
            Some(Command::EmergencyStop)
        );
        assert_eq!(parse_command(0x123, &[0; 8]), None);
    }

    #[test]
    fn test_encode_status_layout() {
        let data = encode_status(1500.0, 300, 2, status_flags::SPEED_VALID | status_flags::RUNNING);
        assert_eq!(f32::from_le_bytes([data[0], data[1], data[2], data[3]]), 1500.0);
        assert_eq!(u16::from_le_bytes([data[4], data[5]]), 300);
        assert_eq!(data[6], 2);
        assert_eq!(data[7], 0x05);
    }

    #[test]
    fn test_voltage_flags() {
        let data = encode_voltage_status(35.0, true, false);
        assert_eq!(data[4], 0x01);
        let data = encode_voltage_status(5.0, false, true);
        assert_eq!(data[4], 0x02);
    }

    #[test]
    fn test_value_changed_frame() {
        let event = ValueChanged {
            item: ValueItem::BusVoltage,
            value: 24_000.0,
        };
        let data = encode_value_changed(&event);
        assert_eq!(data[0], 2);
        assert_eq!(decode_value_changed(&data), Some(event));
        assert_eq!(decode_value_changed(&[9, 0, 0, 0, 0]), None);
    }
}
