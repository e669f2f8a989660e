//! Power control of the device under test.

/// Represents a switch powering the device behind a channel, such as a
/// programmable USB hub port or a power supply driving a battery emulator.
///
/// Channels refuse to open while the device is off.
pub trait HardwareDevice: Send + Sync {
    fn is_on(&self) -> bool;

    fn turn_on(&self);

    fn turn_off(&self);
}
