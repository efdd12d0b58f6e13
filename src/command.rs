use core::fmt::{Display, Formatter};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("checksum mismatch: computed {computed:#04X}, received {received:#04X}")]
    Checksum { computed: u8, received: u8 },
}

const CRC8_POLYNOMIAL: u8 = 0x31;
const CRC8_INIT: u8 = 0xFF;

/// The longest defined response: 32 serial-number bytes plus crc bytes.
pub const MAX_RESPONSE_SIZE: usize = 48;
/// The longest defined request: the 8-byte cleaning period write.
pub const MAX_FRAME_SIZE: usize = 8;

/// Minimum configurable self-cleaning period, in seconds.
pub const AUTO_CLEANING_PERIOD_MIN: u32 = 0;
/// The cleaning period is configurable in steps of one second.
pub const AUTO_CLEANING_PERIOD_STEP: u32 = 1;
/// Maximum configurable self-cleaning period (one week), in seconds.
pub const AUTO_CLEANING_PERIOD_MAX: u32 = 604_800;

/// The sensor measures reliably up to 3000 µg/m³.
const MAX_PM: i32 = 3000;

/// CRC-8 over one 2-byte word. Every word on the bus carries its own
/// checksum; there is no running checksum across a frame.
pub fn crc8(word: [u8; 2]) -> u8 {
    let mut crc = CRC8_INIT;
    for byte in word {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 == 0 {
                crc << 1
            } else {
                (crc << 1) ^ CRC8_POLYNOMIAL
            };
        }
    }
    crc
}

/// Commands understood by the sensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    StartMeasurement,
    StopMeasurement,
    Reset,
    ReadDataReadyFlag,
    ReadData,
    ReadSerial,
    StartFanCleaning,
    SetAutoCleaningPeriod(u32),
    ReadAutoCleaningPeriod,
}

impl Command {
    fn code(self) -> u16 {
        match self {
            Command::StartMeasurement => 0x0010,
            Command::StopMeasurement => 0x0104,
            Command::Reset => 0xD304,
            Command::ReadDataReadyFlag => 0x0202,
            Command::ReadData => 0x0300,
            Command::ReadSerial => 0xD033,
            Command::StartFanCleaning => 0x5607,
            // reads and writes of the period address the same register
            Command::SetAutoCleaningPeriod(_) | Command::ReadAutoCleaningPeriod => 0x8004,
        }
    }

    /// Write the request frame into `buf` and return its length.
    pub fn encode(self, buf: &mut [u8; MAX_FRAME_SIZE]) -> usize {
        let code = self.code().to_be_bytes();
        buf[0] = code[0];
        buf[1] = code[1];

        match self {
            Command::StartMeasurement => {
                // fixed measurement-mode selector
                buf[2] = 0x03;
                buf[3] = 0x00;
                buf[4] = crc8([buf[2], buf[3]]);
                5
            }
            Command::SetAutoCleaningPeriod(seconds) => {
                let period = seconds.to_be_bytes();
                buf[2] = period[0];
                buf[3] = period[1];
                buf[4] = crc8([period[0], period[1]]);
                buf[5] = period[2];
                buf[6] = period[3];
                buf[7] = crc8([period[2], period[3]]);
                8
            }
            _ => 2,
        }
    }

    /// Payload bytes this command yields after checksum stripping.
    pub fn data_len(self) -> usize {
        match self {
            Command::ReadDataReadyFlag => 2,
            Command::ReadData => 16,
            Command::ReadSerial => 32,
            Command::ReadAutoCleaningPeriod => 4,
            _ => 0,
        }
    }

    /// Bytes the sensor puts on the wire: one crc byte per 2-byte word.
    pub fn response_len(self) -> usize {
        let n = self.data_len();
        n + n / 2
    }
}

/// Validate a raw response and strip the crc bytes.
///
/// The buffer is walked in 3-byte groups (2 data bytes, 1 crc byte). A
/// single mismatch invalidates the whole response; nothing is copied out
/// in that case.
pub fn decode_response(raw: &[u8], data: &mut [u8]) -> Result<(), FrameError> {
    debug_assert_eq!(raw.len(), data.len() + data.len() / 2);

    for group in raw.chunks_exact(3) {
        let computed = crc8([group[0], group[1]]);
        if computed != group[2] {
            return Err(FrameError::Checksum {
                computed,
                received: group[2],
            });
        }
    }

    for (group, word) in raw.chunks_exact(3).zip(data.chunks_exact_mut(2)) {
        word.copy_from_slice(&group[..2]);
    }

    Ok(())
}

/// Convert a big-endian IEEE-754 single into hundredths of a µg/m³,
/// clamped to the reliable measurement range.
///
/// The sensor never reports negative concentrations, so the sign bit is
/// treated as part of the exponent (it is always clear).
pub fn float_to_fixed(bytes: [u8; 4]) -> i32 {
    let raw = u32::from_be_bytes(bytes);
    let mantissa = (raw & 0x007F_FFFF) as i32;
    let exp = (raw >> 23) as i32;

    // special case 0.0
    if exp == 0 && mantissa == 0 {
        return 0;
    }

    let exp = exp - 127;
    if exp < 0 {
        // anything below 2^-7 is under a hundredth, and the shift below
        // would exceed the i32 width for very small exponents
        if exp <= -8 {
            return 0;
        }
        // pure fractions, 0.01 .. 0.99
        return ((((1 << 23) + mantissa) * 100) >> 23) >> -exp;
    }

    // an exponent of 12 or more means at least 4096, already past the clamp
    if exp >= 12 {
        return MAX_PM * 100;
    }

    let shift = 23 - exp;
    let integral = (1 << exp) + (mantissa >> shift);
    if integral >= MAX_PM {
        return MAX_PM * 100;
    }

    let fraction = mantissa & ((1 << shift) - 1);
    integral * 100 + ((fraction * 100) >> shift)
}

/// One decoded measurement: mass concentrations for all four channels,
/// in hundredths of a µg/m³.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Measurement {
    pm1_0: i32,
    pm2_5: i32,
    pm4_0: i32,
    pm10_0: i32,
}

impl Measurement {
    pub(crate) fn from_bytes(raw: &[u8; 16]) -> Self {
        let mut pm = [0i32; 4];
        for (value, bytes) in pm.iter_mut().zip(raw.chunks_exact(4)) {
            *value = float_to_fixed(bytes.try_into().expect("chunk size is 4"));
        }

        Measurement {
            pm1_0: pm[0],
            pm2_5: pm[1],
            pm4_0: pm[2],
            pm10_0: pm[3],
        }
    }

    /// PM1.0 concentration. Divide by 100 to get µg/m³.
    #[must_use]
    pub fn pm1_0(&self) -> i32 {
        self.pm1_0
    }

    /// PM2.5 concentration. Divide by 100 to get µg/m³.
    #[must_use]
    pub fn pm2_5(&self) -> i32 {
        self.pm2_5
    }

    /// PM4.0 concentration. Divide by 100 to get µg/m³.
    #[must_use]
    pub fn pm4_0(&self) -> i32 {
        self.pm4_0
    }

    /// PM10 concentration. Divide by 100 to get µg/m³.
    #[must_use]
    pub fn pm10_0(&self) -> i32 {
        self.pm10_0
    }
}

impl Display for Measurement {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!(
            "PM1: {}.{:02} µg/m3, PM2.5: {}.{:02} µg/m3, PM4: {}.{:02} µg/m3, PM10: {}.{:02} µg/m3",
            self.pm1_0 / 100,
            self.pm1_0 % 100,
            self.pm2_5 / 100,
            self.pm2_5 % 100,
            self.pm4_0 / 100,
            self.pm4_0 % 100,
            self.pm10_0 / 100,
            self.pm10_0 % 100,
        ))
    }
}

/// The sensor's serial number, as reported on the wire.
#[derive(Clone, Debug)]
pub struct SerialNumber([u8; 32]);

impl SerialNumber {
    pub(crate) fn new(raw: [u8; 32]) -> Self {
        SerialNumber(raw)
    }

    /// The serial string; the sensor null-terminates it on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(self.0.len());
        core::str::from_utf8(&self.0[..end]).unwrap_or("")
    }
}

impl Display for SerialNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AUTO_CLEANING_PERIOD_MAX, Command, FrameError, MAX_FRAME_SIZE, Measurement, SerialNumber,
        crc8, decode_response, float_to_fixed,
    };

    #[test]
    fn crc_known_vectors() {
        assert_eq!(crc8([0xBE, 0xEF]), 0x92);
        assert_eq!(crc8([0x03, 0x00]), 0xAC);
        assert_eq!(crc8([0x00, 0x00]), 0x81);
        assert_eq!(crc8([0x00, 0x01]), 0xB0);
    }

    #[test]
    fn crc_is_deterministic() {
        for word in [[0x00, 0x00], [0xFF, 0xFF], [0x12, 0x34]] {
            assert_eq!(crc8(word), crc8(word));
        }
    }

    #[test]
    fn encode_start_measurement() {
        const EXPECTED: [u8; 5] = [0x00, 0x10, 0x03, 0x00, 0xAC];
        let mut buf = [0u8; MAX_FRAME_SIZE];
        let len = Command::StartMeasurement.encode(&mut buf);
        assert_eq!(buf[..len], EXPECTED);
    }

    #[test]
    fn encode_bare_commands() {
        let cases: [(Command, [u8; 2]); 6] = [
            (Command::StopMeasurement, [0x01, 0x04]),
            (Command::Reset, [0xD3, 0x04]),
            (Command::ReadDataReadyFlag, [0x02, 0x02]),
            (Command::ReadData, [0x03, 0x00]),
            (Command::ReadSerial, [0xD0, 0x33]),
            (Command::StartFanCleaning, [0x56, 0x07]),
        ];

        for (cmd, expected) in cases {
            let mut buf = [0u8; MAX_FRAME_SIZE];
            let len = cmd.encode(&mut buf);
            assert_eq!(buf[..len], expected, "{cmd:?}");
        }
    }

    #[test]
    fn encode_cleaning_period_write() {
        const EXPECTED: [u8; 8] = [0x80, 0x04, 0x00, 0x09, 0x09, 0x3A, 0x80, 0xA7];
        let mut buf = [0u8; MAX_FRAME_SIZE];
        let len = Command::SetAutoCleaningPeriod(604_800).encode(&mut buf);
        assert_eq!(buf[..len], EXPECTED);
    }

    #[test]
    fn encode_cleaning_period_read() {
        const EXPECTED: [u8; 2] = [0x80, 0x04];
        let mut buf = [0u8; MAX_FRAME_SIZE];
        let len = Command::ReadAutoCleaningPeriod.encode(&mut buf);
        assert_eq!(buf[..len], EXPECTED);
    }

    #[test]
    fn response_lengths() {
        assert_eq!(Command::ReadDataReadyFlag.response_len(), 3);
        assert_eq!(Command::ReadData.response_len(), 24);
        assert_eq!(Command::ReadSerial.response_len(), 48);
        assert_eq!(Command::ReadAutoCleaningPeriod.response_len(), 6);
        assert_eq!(Command::Reset.response_len(), 0);
        assert_eq!(Command::SetAutoCleaningPeriod(1).response_len(), 0);
    }

    #[test]
    fn decode_strips_checksums() {
        const RAW: [u8; 6] = [0x00, 0x09, 0x09, 0x3A, 0x80, 0xA7];
        let mut data = [0u8; 4];
        decode_response(&RAW, &mut data).unwrap();
        assert_eq!(data, [0x00, 0x09, 0x3A, 0x80]);
    }

    #[test]
    fn decode_rejects_any_corrupted_bit() {
        const RAW: [u8; 6] = [0x00, 0x09, 0x09, 0x3A, 0x80, 0xA7];

        for byte in 0..4 {
            for bit in 0..8 {
                let mut raw = RAW;
                // corrupt one data bit, leave the crc bytes untouched
                let i = if byte < 2 { byte } else { byte + 1 };
                raw[i] ^= 1 << bit;

                let mut data = [0u8; 4];
                let err = decode_response(&raw, &mut data).unwrap_err();
                assert!(matches!(err, FrameError::Checksum { .. }));
            }
        }
    }

    #[test]
    fn cleaning_period_round_trips() {
        for period in [0, 1, 20, 3600, 86_400, AUTO_CLEANING_PERIOD_MAX] {
            let mut buf = [0u8; MAX_FRAME_SIZE];
            let len = Command::SetAutoCleaningPeriod(period).encode(&mut buf);
            assert_eq!(len, 8);

            let mut data = [0u8; 4];
            decode_response(&buf[2..len], &mut data).unwrap();
            assert_eq!(u32::from_be_bytes(data), period);
        }
    }

    #[test]
    fn float_decode_zero() {
        assert_eq!(float_to_fixed([0x00, 0x00, 0x00, 0x00]), 0);
    }

    #[test]
    fn float_decode_fractions() {
        // 0.5
        assert_eq!(float_to_fixed([0x3F, 0x00, 0x00, 0x00]), 50);
        // 0.99
        assert_eq!(float_to_fixed([0x3F, 0x7D, 0x70, 0xA4]), 99);
        // 0.01 is below the decoder's resolution
        assert_eq!(float_to_fixed([0x3C, 0x23, 0xD7, 0x0A]), 0);
        // 1e-20
        assert_eq!(float_to_fixed([0x1E, 0x3C, 0xE5, 0x08]), 0);
        // the smallest subnormal
        assert_eq!(float_to_fixed([0x00, 0x00, 0x00, 0x01]), 0);
    }

    #[test]
    fn float_decode_integral() {
        // 1.0
        assert_eq!(float_to_fixed([0x3F, 0x80, 0x00, 0x00]), 100);
        // 12.34
        assert_eq!(float_to_fixed([0x41, 0x45, 0x70, 0xA4]), 1234);
        // 299.9 truncates the binary fraction
        assert_eq!(float_to_fixed([0x43, 0x95, 0xF3, 0x33]), 29_989);
        // 1234.5678, within one hundredth of the exact value
        assert_eq!(float_to_fixed([0x44, 0x9A, 0x52, 0x2B]), 123_456);
    }

    #[test]
    fn float_decode_clamps() {
        // 2999.99 is still below the clamp
        assert_eq!(float_to_fixed([0x45, 0x3B, 0x7F, 0xD7]), 299_998);
        // 3000.0 clamps exactly
        assert_eq!(float_to_fixed([0x45, 0x3B, 0x80, 0x00]), 300_000);
        // 3500.0
        assert_eq!(float_to_fixed([0x45, 0x5A, 0xC0, 0x00]), 300_000);
        // 1e10
        assert_eq!(float_to_fixed([0x50, 0x15, 0x02, 0xF9]), 300_000);
    }

    #[test]
    fn measurement_from_bytes() {
        // 12.34, 0.0, 3500.0, 45.6
        const RAW: [u8; 16] = [
            0x41, 0x45, 0x70, 0xA4, 0x00, 0x00, 0x00, 0x00, 0x45, 0x5A, 0xC0, 0x00, 0x42, 0x36,
            0x66, 0x66,
        ];
        let m = Measurement::from_bytes(&RAW);

        assert_eq!(m.pm1_0(), 1234);
        assert_eq!(m.pm2_5(), 0);
        assert_eq!(m.pm4_0(), 300_000);
        assert_eq!(m.pm10_0(), 4559);
    }

    #[test]
    fn serial_number_truncates_at_nul() {
        let mut raw = [0u8; 32];
        raw[..4].copy_from_slice(b"A1B2");
        let serial = SerialNumber::new(raw);
        assert_eq!(serial.as_str(), "A1B2");
    }
}
