//! In-memory audio files for tests.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::io::Cursor;

use hound::{SampleFormat, WavSpec, WavWriter};

/// Frames per FLAC frame.
const FLAC_BLOCK: usize = 4000;

/// A 16-bit PCM WAV file where every sample is `value`.
pub fn wav_file(rate: u32, channels: u16, frames: usize, value: i16) -> Vec<u8> {
    let spec = WavSpec {
        channels,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut out = Cursor::new(Vec::new());
    let mut writer = WavWriter::new(&mut out, spec).unwrap();
    for _ in 0..frames * usize::from(channels) {
        writer.write_sample(value).unwrap();
    }
    writer.finalize().unwrap();
    out.into_inner()
}

/// A 16-bit FLAC file with verbatim subframes where every sample is `value`.
pub fn flac_file(rate: u32, channels: u8, frames: usize, value: i16) -> Vec<u8> {
    let mut out = b"fLaC".to_vec();

    // STREAMINFO, last metadata block.
    out.push(0x80);
    out.extend_from_slice(&[0, 0, 34]);
    out.extend_from_slice(&(FLAC_BLOCK as u16).to_be_bytes());
    out.extend_from_slice(&(FLAC_BLOCK as u16).to_be_bytes());
    out.extend_from_slice(&[0; 6]);
    let packed = (u64::from(rate) << 44)
        | (u64::from(channels - 1) << 41)
        | (15u64 << 36)
        | frames as u64;
    out.extend_from_slice(&packed.to_be_bytes());
    out.extend_from_slice(&[0; 16]);

    let rate_code = match rate {
        22050 => 0x6,
        44100 => 0x9,
        48000 => 0xA,
        _ => 0x0,
    };

    let mut remaining = frames;
    let mut number = 0u8;
    while remaining > 0 {
        let block = remaining.min(FLAC_BLOCK);
        let start = out.len();

        out.extend_from_slice(&[0xFF, 0xF8, 0x70 | rate_code]);
        out.push(((channels - 1) << 4) | 0x08);
        out.push(number);
        out.extend_from_slice(&((block - 1) as u16).to_be_bytes());
        out.push(crc8(&out[start..]));

        for _ in 0..channels {
            out.push(0x02);
            for _ in 0..block {
                out.extend_from_slice(&value.to_be_bytes());
            }
        }
        let crc = crc16(&out[start..]);
        out.extend_from_slice(&crc.to_be_bytes());

        remaining -= block;
        number += 1;
    }
    out
}

fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |mut crc, &byte| {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 == 0 { crc << 1 } else { (crc << 1) ^ 0x07 };
        }
        crc
    })
}

fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |mut crc, &byte| {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 == 0 { crc << 1 } else { (crc << 1) ^ 0x8005 };
        }
        crc
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_check_values() {
        assert_eq!(crc8(b"123456789"), 0xF4);
        assert_eq!(crc16(b"123456789"), 0xFEE8);
    }

    #[test]
    fn test_wav_layout() {
        let wav = wav_file(44100, 2, 10, 5);
        assert_eq!(wav.len(), 44 + 40);
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(&wav[36..40], b"data");

        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.duration(), 10);
        let samples: Vec<i16> = reader.into_samples().map(Result::unwrap).collect();
        assert!(samples.iter().all(|&s| s == 5));
    }

    #[test]
    fn test_flac_frames_split_at_block_size() {
        let flac = flac_file(44100, 2, FLAC_BLOCK + 10, 1);
        let syncs = flac
            .windows(2)
            .filter(|pair| *pair == [0xFF, 0xF8])
            .count();
        assert_eq!(syncs, 2);
    }
}
