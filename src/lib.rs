//! This crate implements a driver for the HM3301 laser-scattering
//! particulate matter sensor based on
//! [`embedded-hal`](https://github.com/rust-embedded/embedded-hal).
//! Thanks to this abstraction layer, it can be used on full-fledged
//! operating systems as well as embedded devices.
//!
//! # Features
//! * `use_sync`: To use the synchronous interface, enable this feature.
//!   By default, this library exposes an async API.
//!
//! # Example
//! ```ignore
//! use embassy_time::Delay;
//! use hm3301::Hm3301;
//!
//! let mut sensor = Hm3301::new(i2c);
//! let mut delay = Delay;
//!
//! // bring the sensor into a known state
//! sensor.reset(&mut delay).await.unwrap();
//! println!("serial number: {}", sensor.read_serial().await.unwrap());
//!
//! loop {
//!     let dust = sensor.read_measurement(&mut delay).await.unwrap();
//!     println!("{}", dust);
//! }
//! ```
//!
//! # Technical Overview
//! The sensor has two operating states:
//! * Idle ([`DeviceState::Reset`]): the fan is off and no data is produced.
//!   This is the power-on state and the state after a reset.
//! * Measuring ([`DeviceState::Measuring`]): the fan spins and a fresh
//!   reading becomes available roughly once per second, signalled through a
//!   data-ready flag.
//!
//! [`Hm3301::read_measurement`] hides the lifecycle: it starts the
//! measurement if necessary, polls the data-ready flag a bounded number of
//! times and decodes the reading. The sensor reports each channel as a
//! big-endian IEEE-754 single; the driver converts these to fixed-point
//! hundredths of a µg/m³, clamped to the documented reliable range of
//! 3000 µg/m³.
//!
//! Every 2-byte word on the bus is followed by a CRC-8 byte. A single
//! checksum mismatch aborts the whole operation; no partial data is ever
//! returned.
//!
//! # Concurrency
//! One [`Hm3301`] instance owns the bus handle and the lifecycle state, and
//! all operations take `&mut self`, so accesses through one instance are
//! naturally sequential. Multi-step operations perform several bus
//! round-trips; if a session is shared across threads (or tasks) the caller
//! must hold its lock for the duration of a whole call, never between the
//! round-trips of one.

#![no_std]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]

use core::error::Error;
use core::fmt::{Debug, Display, Formatter};
#[cfg(feature = "use_sync")]
use embedded_hal::delay::DelayNs;
#[cfg(feature = "use_sync")]
use embedded_hal::i2c::I2c;
#[cfg(not(feature = "use_sync"))]
use embedded_hal_async::delay::DelayNs;
#[cfg(not(feature = "use_sync"))]
use embedded_hal_async::i2c::I2c;
use log::{debug, warn};
use maybe_async::maybe_async;

use command::{Command, MAX_FRAME_SIZE, MAX_RESPONSE_SIZE, decode_response};
pub use command::{
    AUTO_CLEANING_PERIOD_MAX, AUTO_CLEANING_PERIOD_MIN, AUTO_CLEANING_PERIOD_STEP, FrameError,
    Measurement, SerialNumber,
};

mod command;

/// Settle time after a reset before the sensor accepts commands.
const RESET_SETTLE_MS: u32 = 300;
/// Settle time after writing the cleaning period.
const PERIOD_SETTLE_MS: u32 = 20;
/// How often the data-ready flag is polled before giving up.
const READY_POLL_ATTEMPTS: u32 = 5;
/// Pause between data-ready polls.
const READY_POLL_INTERVAL_MS: u32 = 300;

/// Error type for operations on the HM3301 sensor.
pub enum Hm3301Error<E> {
    /// The bus returned an error while writing a command.
    WriteError(E),
    /// The bus returned an error while reading a response.
    ReadError(E),
    /// A received response failed checksum validation.
    Frame(FrameError),
    /// The data-ready flag was never set within the poll budget.
    Timeout,
    /// The given parameters were invalid.
    InvalidArgument,
}

impl<E> Display for Hm3301Error<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Hm3301Error::WriteError(_) => f.write_str("bus write error"),
            Hm3301Error::ReadError(_) => f.write_str("bus read error"),
            Hm3301Error::Frame(e) => f.write_fmt(format_args!("malformed response: {e}")),
            Hm3301Error::Timeout => f.write_str("sensor data not ready in time"),
            Hm3301Error::InvalidArgument => f.write_str("given parameters were invalid"),
        }
    }
}

impl<E> Debug for Hm3301Error<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        Display::fmt(self, f)
    }
}

impl<E> Error for Hm3301Error<E> {}

impl<E> From<FrameError> for Hm3301Error<E> {
    fn from(e: FrameError) -> Self {
        Hm3301Error::Frame(e)
    }
}

/// Measurement lifecycle state, as explained in the
/// [technical overview](crate#technical-overview).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    /// Idle; the power-on state and the state after [`Hm3301::reset`].
    Reset,
    /// Actively measuring, entered through an acknowledged start command.
    Measuring,
}

/// The main struct. Wraps around an I2C bus handle that implements
/// embedded-hal(-async).
pub struct Hm3301<I2C> {
    i2c: I2C,
    state: DeviceState,
}

impl<I2C> Hm3301<I2C>
where
    I2C: I2c,
{
    const ADDRESS: u8 = 0x69;

    /// Create a new sensor instance, consuming the bus handle.
    ///
    /// No communication happens during creation. Call [`Self::reset`] to
    /// bring the sensor into a known state before the first measurement.
    pub fn new(i2c: I2C) -> Self {
        Hm3301 {
            i2c,
            state: DeviceState::Reset,
        }
    }

    /// The lifecycle state the driver believes the sensor is in.
    #[must_use]
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Destroy the driver and get back the bus handle.
    pub fn release(self) -> I2C {
        self.i2c
    }

    #[maybe_async]
    async fn send(&mut self, cmd: Command) -> Result<(), Hm3301Error<I2C::Error>> {
        let mut buf = [0u8; MAX_FRAME_SIZE];
        let len = cmd.encode(&mut buf);

        self.i2c
            .write(Self::ADDRESS, &buf[..len])
            .await
            .map_err(Hm3301Error::WriteError)
    }

    /// Send a read command and receive its checksummed response.
    ///
    /// The sensor does not support repeated start, so command and response
    /// are two separate bus transactions, never a combined write-read.
    #[maybe_async]
    async fn transfer(
        &mut self,
        cmd: Command,
        data: &mut [u8],
    ) -> Result<(), Hm3301Error<I2C::Error>> {
        debug_assert_eq!(data.len(), cmd.data_len());

        self.send(cmd).await?;

        let mut raw = [0u8; MAX_RESPONSE_SIZE];
        let raw = &mut raw[..cmd.response_len()];
        self.i2c
            .read(Self::ADDRESS, raw)
            .await
            .map_err(Hm3301Error::ReadError)?;

        decode_response(raw, data)?;
        Ok(())
    }

    #[maybe_async]
    async fn ensure_measuring(&mut self) -> Result<(), Hm3301Error<I2C::Error>> {
        if self.state == DeviceState::Reset {
            debug!("starting measurement");
            self.send(Command::StartMeasurement).await?;
            self.state = DeviceState::Measuring;
        }

        Ok(())
    }

    /// Reset the sensor, returning it to the idle state.
    ///
    /// The driver state becomes [`DeviceState::Reset`] even if the reset
    /// command itself failed; the error is still returned so the caller
    /// knows the sensor may not have seen it.
    ///
    /// # Errors
    /// This communicates with the sensor and may fail with any
    /// [`Hm3301Error`].
    #[maybe_async]
    pub async fn reset<D: DelayNs>(
        &mut self,
        delay: &mut D,
    ) -> Result<(), Hm3301Error<I2C::Error>> {
        let res = self.send(Command::Reset).await;
        delay.delay_ms(RESET_SETTLE_MS).await;

        // The power-on reset produces a glitch on the bus that leaves some
        // controllers in an error state. Placing any data on the bus
        // recovers them; a stop command is a no-op right after reset.
        if let Err(e) = self.send(Command::StopMeasurement).await {
            warn!("post-reset bus flush failed: {e}");
        }

        self.state = DeviceState::Reset;
        res
    }

    /// Read one measurement, starting the sensor first if it is idle.
    ///
    /// Polls the data-ready flag up to five times, 300 ms apart. After a
    /// [`Hm3301Error::Timeout`] the sensor is left measuring, so a
    /// subsequent call may pick up where this one gave up.
    ///
    /// # Errors
    /// This communicates with the sensor and may fail with any
    /// [`Hm3301Error`].
    #[maybe_async]
    pub async fn read_measurement<D: DelayNs>(
        &mut self,
        delay: &mut D,
    ) -> Result<Measurement, Hm3301Error<I2C::Error>> {
        self.ensure_measuring().await?;

        let mut ready = false;
        for attempt in 0..READY_POLL_ATTEMPTS {
            let mut flag = [0u8; 2];
            self.transfer(Command::ReadDataReadyFlag, &mut flag).await?;

            if flag[1] == 1 {
                debug!("data ready after {attempt} polls");
                ready = true;
                break;
            }

            if attempt + 1 < READY_POLL_ATTEMPTS {
                delay.delay_ms(READY_POLL_INTERVAL_MS).await;
            }
        }
        if !ready {
            return Err(Hm3301Error::Timeout);
        }

        let mut raw = [0u8; 16];
        self.transfer(Command::ReadData, &mut raw).await?;
        Ok(Measurement::from_bytes(&raw))
    }

    /// Read the sensor's serial number.
    ///
    /// # Errors
    /// This communicates with the sensor and may fail with any
    /// [`Hm3301Error`].
    #[maybe_async]
    pub async fn read_serial(&mut self) -> Result<SerialNumber, Hm3301Error<I2C::Error>> {
        let mut buf = [0u8; 32];
        self.transfer(Command::ReadSerial, &mut buf).await?;
        Ok(SerialNumber::new(buf))
    }

    /// Read the self-cleaning period, in seconds. Zero means automatic
    /// cleaning is disabled.
    ///
    /// # Errors
    /// This communicates with the sensor and may fail with any
    /// [`Hm3301Error`].
    #[maybe_async]
    pub async fn get_cleaning_period(&mut self) -> Result<u32, Hm3301Error<I2C::Error>> {
        let mut buf = [0u8; 4];
        self.transfer(Command::ReadAutoCleaningPeriod, &mut buf)
            .await?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Set the self-cleaning period, in seconds, up to one week
    /// ([`AUTO_CLEANING_PERIOD_MAX`]). Zero disables automatic cleaning.
    ///
    /// The sensor only reports the updated period after a reset, so one is
    /// issued as part of this call. A failure of that reset does not fail
    /// the write; it is logged, and subsequent reads may return the stale
    /// value until the next reset.
    ///
    /// # Errors
    /// Returns [`Hm3301Error::InvalidArgument`] for out-of-range periods
    /// without touching the bus; otherwise this communicates with the
    /// sensor and may fail with any [`Hm3301Error`].
    #[maybe_async]
    pub async fn set_cleaning_period<D: DelayNs>(
        &mut self,
        seconds: u32,
        delay: &mut D,
    ) -> Result<(), Hm3301Error<I2C::Error>> {
        if seconds > AUTO_CLEANING_PERIOD_MAX {
            return Err(Hm3301Error::InvalidArgument);
        }

        self.send(Command::SetAutoCleaningPeriod(seconds)).await?;
        delay.delay_ms(PERIOD_SETTLE_MS).await;

        if let Err(e) = self.reset(delay).await {
            warn!("period changed but reads will return the old value: {e}");
        }

        Ok(())
    }

    /// Start a fan cleaning cycle immediately.
    ///
    /// # Errors
    /// This communicates with the sensor and may fail with any
    /// [`Hm3301Error`].
    #[maybe_async]
    pub async fn start_cleaning(&mut self) -> Result<(), Hm3301Error<I2C::Error>> {
        self.send(Command::StartFanCleaning).await
    }

    /// Stop measuring, e.g. when shutting down.
    ///
    /// This does not touch the driver's lifecycle state; use
    /// [`Self::reset`] instead to stop and keep measuring later.
    ///
    /// # Errors
    /// This communicates with the sensor and may fail with any
    /// [`Hm3301Error`].
    #[maybe_async]
    pub async fn stop_measurement(&mut self) -> Result<(), Hm3301Error<I2C::Error>> {
        self.send(Command::StopMeasurement).await
    }
}
