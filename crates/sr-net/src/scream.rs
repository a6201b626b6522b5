//! Raw Scream header codec
//!
//! Five bytes in front of every 1152-byte PCM payload:
//! - byte 0: top bit selects the 44.1 kHz family (else 48 kHz), the low
//!   seven bits are the sample-rate divisor (0 is treated as 1)
//! - byte 1: bit depth
//! - byte 2: channel count
//! - bytes 3-4: channel layout pair (WAVEFORMATEXTENSIBLE mask, LE)

use sr_core::{AudioFormat, SCREAM_HEADER_SIZE};

use crate::{NetError, NetResult};

const BASE_44K: u32 = 44_100;
const BASE_48K: u32 = 48_000;

/// Protocol-level channel ceiling; the engine itself mixes at most 8.
const MAX_WIRE_CHANNELS: u8 = 64;

/// Encode a format into the 5-byte Scream header.
///
/// Fails when the sample rate is not a divisor-reachable member of either
/// rate family.
pub fn encode_scream_header(format: &AudioFormat) -> NetResult<[u8; SCREAM_HEADER_SIZE]> {
    let rate = format.sample_rate;
    if rate == 0 {
        return Err(NetError::InvalidFrame("sample rate is zero".into()));
    }

    let byte0 = if BASE_48K % rate == 0 && BASE_48K / rate <= 0x7F {
        (BASE_48K / rate) as u8
    } else if BASE_44K % rate == 0 && BASE_44K / rate <= 0x7F {
        0x80 | (BASE_44K / rate) as u8
    } else {
        return Err(NetError::InvalidFrame(format!(
            "sample rate {rate} not representable in a Scream header"
        )));
    };

    Ok([
        byte0,
        format.bit_depth,
        format.channels,
        format.chlayout1,
        format.chlayout2,
    ])
}

/// Decode the 5-byte Scream header into a format.
pub fn decode_scream_header(header: &[u8]) -> NetResult<AudioFormat> {
    if header.len() < SCREAM_HEADER_SIZE {
        return Err(NetError::InvalidFrame(format!(
            "scream header truncated at {} bytes",
            header.len()
        )));
    }

    let base = if header[0] & 0x80 != 0 { BASE_44K } else { BASE_48K };
    let divisor = (header[0] & 0x7F) as u32;
    let divisor = if divisor == 0 { 1 } else { divisor };
    let sample_rate = base / divisor;

    let bit_depth = header[1];
    if !matches!(bit_depth, 8 | 16 | 24 | 32) {
        return Err(NetError::InvalidFrame(format!(
            "bit depth {bit_depth} not in {{8,16,24,32}}"
        )));
    }

    let channels = header[2];
    if channels == 0 || channels > MAX_WIRE_CHANNELS {
        return Err(NetError::InvalidFrame(format!(
            "channel count {channels} out of range 1..={MAX_WIRE_CHANNELS}"
        )));
    }

    Ok(AudioFormat {
        sample_rate,
        bit_depth,
        channels,
        chlayout1: header[3],
        chlayout2: header[4],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_all_valid_tuples() {
        for base in [44_100u32, 48_000] {
            for divisor in 1u32..=127 {
                if base % divisor != 0 {
                    continue;
                }
                let rate = base / divisor;
                for bit_depth in [8u8, 16, 24, 32] {
                    for channels in 1u8..=8 {
                        let format = AudioFormat::new(rate, bit_depth, channels);
                        let header = encode_scream_header(&format).unwrap();
                        let back = decode_scream_header(&header).unwrap();
                        assert_eq!(back.sample_rate, rate);
                        assert_eq!(back.bit_depth, bit_depth);
                        assert_eq!(back.channels, channels);
                        assert_eq!(back.channel_mask(), format.channel_mask());
                    }
                }
            }
        }
    }

    #[test]
    fn divisor_zero_reads_as_one() {
        let format = decode_scream_header(&[0x00, 16, 2, 0x03, 0x00]).unwrap();
        assert_eq!(format.sample_rate, 48_000);
        let format = decode_scream_header(&[0x80, 16, 2, 0x03, 0x00]).unwrap();
        assert_eq!(format.sample_rate, 44_100);
    }

    #[test]
    fn rejects_invalid_fields() {
        assert!(decode_scream_header(&[0x01, 12, 2, 0, 0]).is_err());
        assert!(decode_scream_header(&[0x01, 16, 0, 0, 0]).is_err());
        assert!(decode_scream_header(&[0x01, 16, 65, 0, 0]).is_err());
        assert!(decode_scream_header(&[0x01, 16]).is_err());
    }

    #[test]
    fn rejects_unrepresentable_rate() {
        let format = AudioFormat::new(12_345, 16, 2);
        assert!(encode_scream_header(&format).is_err());
    }
}
