// SPDX-FileCopyrightText: 2025 Contributors to the LiteX M2SDR project.
// SPDX-License-Identifier: Apache-2.0

//! Conversion between wire samples and `Complex32`.
//!
//! On the wire every sample period carries one signed little-endian I/Q pair
//! per active channel, channel 0 first:
//!
//! ```text
//! 16-bit, 2 channels:  | I0 lo I0 hi | Q0 lo Q0 hi | I1 lo I1 hi | Q1 lo Q1 hi | ...
//!  8-bit, 2 channels:  | I0 | Q0 | I1 | Q1 | ...
//! ```
//!
//! Components are scaled by 1/2047 (16-bit, the AD9361's 12-bit range) or
//! 1/127 (8-bit) and clamped to the same range on the way out.

use num_complex::Complex32;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Wire sample width, selected once per device and written to the gateware's
/// format register.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleMode {
    /// 8-bit I/Q, twice the samples per slot.
    #[serde(alias = "8")]
    Bits8,
    /// 16-bit containers carrying 12-bit I/Q.
    #[default]
    #[serde(alias = "16")]
    Bits16,
}

impl SampleMode {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleMode::Bits8 => 1,
            SampleMode::Bits16 => 2,
        }
    }

    pub fn bytes_per_complex(self) -> usize {
        2 * self.bytes_per_sample()
    }

    /// Fixed-point value of full scale (1.0).
    pub fn scale(self) -> f32 {
        match self {
            SampleMode::Bits8 => 127.0,
            SampleMode::Bits16 => 2047.0,
        }
    }

    /// Value of the gateware's format CSR for this mode.
    pub(crate) fn format_register(self) -> u32 {
        match self {
            SampleMode::Bits8 => 1,
            SampleMode::Bits16 => 0,
        }
    }
}

impl std::str::FromStr for SampleMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "8" | "bits8" | "8bit" => Ok(SampleMode::Bits8),
            "16" | "bits16" | "16bit" => Ok(SampleMode::Bits16),
            other => Err(Error::InvalidArg(format!("unknown sample mode {other:?}"))),
        }
    }
}

/// Converter for one stream: a sample mode and a wire channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleCodec {
    mode: SampleMode,
    channels: usize,
}

impl SampleCodec {
    /// Creates a codec for `channels` interleaved channels (1 or 2).
    pub fn new(mode: SampleMode, channels: usize) -> Result<Self> {
        if !(1..=2).contains(&channels) {
            return Err(Error::InvalidChannel(channels));
        }
        Ok(Self { mode, channels })
    }

    pub fn mode(&self) -> SampleMode {
        self.mode
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Bytes of one sample period across all channels.
    pub fn frame_size(&self) -> usize {
        self.mode.bytes_per_complex() * self.channels
    }

    /// Samples per channel carried by a slot of `slot_size` bytes.
    pub fn samples_per_slot(&self, slot_size: usize) -> usize {
        slot_size / self.frame_size()
    }

    fn check_buffers(&self, count: usize) -> Result<()> {
        if count != self.channels {
            return Err(Error::InvalidArg(format!(
                "{count} buffers for a {}-channel stream",
                self.channels
            )));
        }
        Ok(())
    }

    fn read_component(&self, bytes: &[u8]) -> f32 {
        let raw = match self.mode {
            SampleMode::Bits8 => bytes[0] as i8 as f32,
            SampleMode::Bits16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f32,
        };
        raw / self.mode.scale()
    }

    fn write_component(&self, value: f32, bytes: &mut [u8]) {
        let scale = self.mode.scale();
        // NaN survives `clamp` and becomes 0 in the integer cast.
        let fixed = (value * scale).round().clamp(-scale, scale);
        match self.mode {
            SampleMode::Bits8 => bytes[0] = (fixed as i8) as u8,
            SampleMode::Bits16 => bytes[..2].copy_from_slice(&(fixed as i16).to_le_bytes()),
        }
    }

    /// Decodes `raw` into `outputs[ch][offset..]`, one buffer per channel.
    ///
    /// Returns the number of samples written per channel: the smaller of the
    /// whole frames in `raw` and the room left after `offset`.
    pub fn decode_into(
        &self,
        raw: &[u8],
        outputs: &mut [&mut [Complex32]],
        offset: usize,
    ) -> Result<usize> {
        self.check_buffers(outputs.len())?;
        let room = outputs
            .iter()
            .map(|out| out.len().saturating_sub(offset))
            .min()
            .unwrap_or(0);
        let count = (raw.len() / self.frame_size()).min(room);
        let width = self.mode.bytes_per_sample();
        for (n, frame) in raw.chunks_exact(self.frame_size()).take(count).enumerate() {
            for (channel, pair) in frame.chunks_exact(2 * width).enumerate() {
                outputs[channel][offset + n] = Complex32::new(
                    self.read_component(&pair[..width]),
                    self.read_component(&pair[width..]),
                );
            }
        }
        Ok(count)
    }

    /// Encodes `inputs[ch][offset..]` into `raw`, one buffer per channel.
    ///
    /// Returns the number of samples consumed per channel. Only whole frames
    /// that fit in `raw` are written; bytes past them are left untouched.
    pub fn encode_into(
        &self,
        inputs: &[&[Complex32]],
        offset: usize,
        raw: &mut [u8],
    ) -> Result<usize> {
        self.check_buffers(inputs.len())?;
        let available = inputs
            .iter()
            .map(|input| input.len().saturating_sub(offset))
            .min()
            .unwrap_or(0);
        let frame_size = self.frame_size();
        let count = (raw.len() / frame_size).min(available);
        let width = self.mode.bytes_per_sample();
        for (n, frame) in raw.chunks_exact_mut(frame_size).take(count).enumerate() {
            for (channel, pair) in frame.chunks_exact_mut(2 * width).enumerate() {
                let sample = inputs[channel][offset + n];
                let (i, q) = pair.split_at_mut(width);
                self.write_component(sample.re, i);
                self.write_component(sample.im, q);
            }
        }
        Ok(count)
    }

    /// Decodes a whole slot into freshly allocated per-channel buffers.
    pub fn decode(&self, raw: &[u8]) -> Vec<Vec<Complex32>> {
        let count = raw.len() / self.frame_size();
        let mut outputs = vec![vec![Complex32::default(); count]; self.channels];
        let mut views: Vec<&mut [Complex32]> =
            outputs.iter_mut().map(|out| out.as_mut_slice()).collect();
        // Buffer count and sizes are derived from the codec itself.
        let _ = self.decode_into(raw, &mut views, 0);
        outputs
    }

    /// Encodes per-channel buffers of equal length into wire bytes.
    pub fn encode(&self, inputs: &[&[Complex32]]) -> Result<Vec<u8>> {
        self.check_buffers(inputs.len())?;
        let count = inputs.iter().map(|input| input.len()).min().unwrap_or(0);
        let mut raw = vec![0u8; count * self.frame_size()];
        self.encode_into(inputs, 0, &mut raw)?;
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize, phase: f32) -> Vec<Complex32> {
        (0..len)
            .map(|n| {
                let x = (n as f32 / len as f32) * 2.0 - 1.0;
                Complex32::new(x, -x * phase)
            })
            .collect()
    }

    #[test]
    fn frame_sizes() {
        let codec = SampleCodec::new(SampleMode::Bits16, 2).unwrap();
        assert_eq!(codec.frame_size(), 8);
        assert_eq!(codec.samples_per_slot(8192), 1024);
        let codec = SampleCodec::new(SampleMode::Bits8, 1).unwrap();
        assert_eq!(codec.frame_size(), 2);
        assert_eq!(codec.samples_per_slot(8192), 4096);
        assert!(matches!(
            SampleCodec::new(SampleMode::Bits8, 3),
            Err(Error::InvalidChannel(3))
        ));
    }

    #[test]
    fn decode_16bit_little_endian_interleave() {
        let codec = SampleCodec::new(SampleMode::Bits16, 2).unwrap();
        let mut raw = Vec::new();
        for value in [2047i16, -2047, 0, 1024] {
            raw.extend_from_slice(&value.to_le_bytes());
        }
        let decoded = codec.decode(&raw);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0], vec![Complex32::new(1.0, -1.0)]);
        assert_eq!(decoded[1], vec![Complex32::new(0.0, 1024.0 / 2047.0)]);
    }

    #[test]
    fn decode_8bit_signed() {
        let codec = SampleCodec::new(SampleMode::Bits8, 1).unwrap();
        let decoded = codec.decode(&[127, 0x81, 0, 0xff]);
        assert_eq!(
            decoded[0],
            vec![Complex32::new(1.0, -1.0), Complex32::new(0.0, -1.0 / 127.0)]
        );
    }

    #[test]
    fn roundtrip_within_one_quantization_step() {
        for mode in [SampleMode::Bits8, SampleMode::Bits16] {
            let codec = SampleCodec::new(mode, 2).unwrap();
            let ch0 = ramp(300, 1.0);
            let ch1 = ramp(300, 0.5);
            let raw = codec.encode(&[ch0.as_slice(), ch1.as_slice()]).unwrap();
            let decoded = codec.decode(&raw);
            let step = 1.0 / mode.scale();
            for (input, output) in [(&ch0, &decoded[0]), (&ch1, &decoded[1])] {
                for (a, b) in input.iter().zip(output) {
                    assert!((a.re - b.re).abs() <= step, "{mode:?}: {a} vs {b}");
                    assert!((a.im - b.im).abs() <= step, "{mode:?}: {a} vs {b}");
                }
            }
        }
    }

    #[test]
    fn out_of_range_input_saturates() {
        let codec = SampleCodec::new(SampleMode::Bits16, 1).unwrap();
        let raw = codec
            .encode(&[&[Complex32::new(4.0, -9.0), Complex32::new(f32::NAN, 0.5)][..]])
            .unwrap();
        assert_eq!(&raw[0..2], &2047i16.to_le_bytes());
        assert_eq!(&raw[2..4], &(-2047i16).to_le_bytes());
        assert_eq!(&raw[4..6], &0i16.to_le_bytes());
        assert_eq!(&raw[6..8], &1024i16.to_le_bytes());

        let codec = SampleCodec::new(SampleMode::Bits8, 1).unwrap();
        let raw = codec.encode(&[&[Complex32::new(1e9, -1e9)][..]]).unwrap();
        assert_eq!(raw, vec![127, (-127i8) as u8]);
    }

    #[test]
    fn encode_never_writes_past_the_slot() {
        let codec = SampleCodec::new(SampleMode::Bits16, 2).unwrap();
        let input = vec![Complex32::new(10.0, -10.0); 64];
        // 3 whole frames plus 5 trailing bytes, followed by a guard region.
        let mut buffer = vec![0xAAu8; 29 + 16];
        let (slot, guard) = buffer.split_at_mut(29);
        let written = codec.encode_into(&[input.as_slice(), input.as_slice()], 0, slot).unwrap();
        assert_eq!(written, 3);
        assert!(slot[24..].iter().all(|&b| b == 0xAA));
        assert!(guard.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn decode_respects_offset_and_room() {
        let codec = SampleCodec::new(SampleMode::Bits8, 1).unwrap();
        let mut out = vec![Complex32::default(); 3];
        let written = codec
            .decode_into(&[127, 127, 127, 127, 127, 127], &mut [out.as_mut_slice()], 2)
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(out[0], Complex32::default());
        assert_eq!(out[2], Complex32::new(1.0, 1.0));
    }

    #[test]
    fn buffer_count_must_match_channels() {
        let codec = SampleCodec::new(SampleMode::Bits16, 2).unwrap();
        let mut only_one = vec![Complex32::default(); 4];
        assert!(matches!(
            codec.decode_into(&[0; 16], &mut [only_one.as_mut_slice()], 0),
            Err(Error::InvalidArg(_))
        ));
    }

    #[test]
    fn sample_mode_parsing() {
        assert_eq!("8".parse::<SampleMode>().unwrap(), SampleMode::Bits8);
        assert_eq!("bits16".parse::<SampleMode>().unwrap(), SampleMode::Bits16);
        assert!("12".parse::<SampleMode>().is_err());
        let mode: SampleMode = serde_json::from_str("\"bits8\"").unwrap();
        assert_eq!(mode, SampleMode::Bits8);
    }
}
