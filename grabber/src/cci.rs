/*!
Command and control interface (CCI): 16-bit register access over I2C.

A command runs as: wait until the device is not busy, write the data length,
write the command word, wait again, then read the result code from the
status register.
*/

use std::thread;
use std::time::{Duration, Instant};

use i2cdev::core::I2CDevice;
use i2cdev::linux::LinuxI2CDevice;
use tracing::{debug, info};

use crate::transport::{DeviceCommand, TransportError};

pub const STATUS_REGISTER: u16 = 0x0002;
pub const COMMAND_REGISTER: u16 = 0x0004;
pub const DATA_LENGTH_REGISTER: u16 = 0x0006;

const STATUS_BUSY: u16 = 0x0001;

/// Default time to wait for the busy bit to clear (an FFC takes a few hundred ms)
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(1000);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Big-endian 16-bit register access
pub trait RegisterBus: Send {
    fn write_register(&mut self, register: u16, value: u16) -> Result<(), TransportError>;
    fn read_register(&mut self, register: u16) -> Result<u16, TransportError>;
}

impl RegisterBus for LinuxI2CDevice {
    fn write_register(&mut self, register: u16, value: u16) -> Result<(), TransportError> {
        let [reg_hi, reg_lo] = register.to_be_bytes();
        let [val_hi, val_lo] = value.to_be_bytes();
        self.write(&[reg_hi, reg_lo, val_hi, val_lo])?;
        Ok(())
    }

    fn read_register(&mut self, register: u16) -> Result<u16, TransportError> {
        self.write(&register.to_be_bytes())?;
        let mut value = [0u8; 2];
        self.read(&mut value)?;
        Ok(u16::from_be_bytes(value))
    }
}

/// Command port over a register bus
pub struct CciPort<B: RegisterBus> {
    bus: B,
    busy_timeout: Duration,
}

impl<B: RegisterBus> CciPort<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Run a command and check the device's result code
    pub fn run(&mut self, command: DeviceCommand) -> Result<(), TransportError> {
        let word = command.command_word();
        debug!("CCI command {:#06x} ({:?})", word, command);

        self.wait_ready()?;
        self.bus.write_register(DATA_LENGTH_REGISTER, 0)?;
        self.bus.write_register(COMMAND_REGISTER, word)?;
        let status = self.wait_ready()?;

        // Result code is a signed byte in the high half of the status word
        let code = (status >> 8) as u8 as i8;
        if code < 0 {
            return Err(TransportError::CommandRejected { command: word, code });
        }

        info!("✅ Device accepted {:?}", command);
        Ok(())
    }

    /// Poll the status register until the busy bit clears, returning the final status
    fn wait_ready(&mut self) -> Result<u16, TransportError> {
        let deadline = Instant::now() + self.busy_timeout;
        loop {
            let status = self.bus.read_register(STATUS_REGISTER)?;
            if status & STATUS_BUSY == 0 {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(TransportError::BusyTimeout(
                    self.busy_timeout.as_millis() as u64,
                ));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}
