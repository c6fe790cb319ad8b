//! Persisted calibration record codec.
//!
//! The record occupies a fixed 64-byte blob in non-volatile memory:
//!
//! ```text
//! byte 0      presence sentinel (0x02; erased EEPROM reads 0xFF)
//! byte 1      float count, must equal 8
//! bytes 2..34 eight little-endian f32 values, positional:
//!             rtd_offset[0..2], rtd_setpoint[0..2],
//!             mdr_adc_zero, mdr_k_t, reserved[0..2]
//! bytes 34..  unused padding
//! ```
//!
//! Validity is decided here and nowhere else: `decode` returns `None` for a
//! wrong sentinel or count, and callers treat that as "calibration absent".

/// Total persisted blob size.
pub const RECORD_LEN: usize = 64;

/// Presence sentinel. Distinct from both 0x00 and the erased value 0xFF.
pub const PRESENCE_SENTINEL: u8 = 0x02;

/// Number of floats the record must carry.
pub const FLOAT_COUNT: u8 = 8;

/// Decoded calibration record.
///
/// Field order matches the persisted layout; `reserved` is carried through
/// rewrites untouched.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CalibrationRecord {
    /// Linear offsets subtracted from the two RTD channels.
    pub rtd_offset: [f32; 2],
    /// Thermostat setpoints for the two heater zones.
    pub rtd_setpoint: [f32; 2],
    /// Raw ADC counts at zero torque.
    pub mdr_adc_zero: f32,
    /// Torque coefficient converting corrected counts to N·m.
    pub mdr_k_t: f32,
    /// Reserved slots, preserved across read-modify-write.
    pub reserved: [f32; 2],
}

impl CalibrationRecord {
    /// Decode a persisted blob. `None` means the record is absent or was
    /// never written (bad sentinel or count).
    pub fn decode(blob: &[u8; RECORD_LEN]) -> Option<Self> {
        if blob[0] != PRESENCE_SENTINEL || blob[1] != FLOAT_COUNT {
            return None;
        }
        let mut floats = [0.0f32; 8];
        for (i, f) in floats.iter_mut().enumerate() {
            let at = 2 + i * 4;
            *f = f32::from_le_bytes([blob[at], blob[at + 1], blob[at + 2], blob[at + 3]]);
        }
        Some(Self {
            rtd_offset: [floats[0], floats[1]],
            rtd_setpoint: [floats[2], floats[3]],
            mdr_adc_zero: floats[4],
            mdr_k_t: floats[5],
            reserved: [floats[6], floats[7]],
        })
    }

    /// Encode into the persisted blob layout.
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let floats = [
            self.rtd_offset[0],
            self.rtd_offset[1],
            self.rtd_setpoint[0],
            self.rtd_setpoint[1],
            self.mdr_adc_zero,
            self.mdr_k_t,
            self.reserved[0],
            self.reserved[1],
        ];
        let mut blob = [0u8; RECORD_LEN];
        blob[0] = PRESENCE_SENTINEL;
        blob[1] = FLOAT_COUNT;
        for (i, f) in floats.iter().enumerate() {
            blob[2 + i * 4..2 + i * 4 + 4].copy_from_slice(&f.to_le_bytes());
        }
        blob
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CalibrationRecord {
        CalibrationRecord {
            rtd_offset: [1.25, -0.5],
            rtd_setpoint: [180.0, 175.5],
            mdr_adc_zero: 84213.0,
            mdr_k_t: 0.00125,
            reserved: [0.0, 0.0],
        }
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let rec = sample();
        let decoded = CalibrationRecord::decode(&rec.encode()).unwrap();
        assert_eq!(decoded, rec);
        // Bit-identical, not merely approximately equal.
        assert_eq!(decoded.mdr_k_t.to_bits(), rec.mdr_k_t.to_bits());
        assert_eq!(decoded.mdr_adc_zero.to_bits(), rec.mdr_adc_zero.to_bits());
    }

    #[test]
    fn wrong_sentinel_is_absent() {
        let mut blob = sample().encode();
        blob[0] = 0xFF; // erased
        assert!(CalibrationRecord::decode(&blob).is_none());
        blob[0] = 0x00;
        assert!(CalibrationRecord::decode(&blob).is_none());
    }

    #[test]
    fn wrong_count_is_absent() {
        let mut blob = sample().encode();
        blob[1] = 7;
        assert!(CalibrationRecord::decode(&blob).is_none());
    }

    #[test]
    fn erased_blob_is_absent() {
        let blob = [0xFFu8; RECORD_LEN];
        assert!(CalibrationRecord::decode(&blob).is_none());
    }
}
