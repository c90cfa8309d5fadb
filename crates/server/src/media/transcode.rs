//! AAC to Opus audio transcoding
//!
//! The upstream feed carries AAC; subscribers get Opus. Frames are
//! decoded, resampled to 48 kHz stereo, buffered in a FIFO and
//! re-encoded in 20 ms Opus frames. Decode, resample and encode are
//! external collaborators (`symphonia`, `rubato`, `opus`); this
//! module owns the plumbing between them and the output timeline.

use bytes::Bytes;
use opus::{Application, Bitrate, Channels, Encoder};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_AAC};
use symphonia::core::formats::Packet;

use crate::error::Error;
use crate::Result;

/// Output sample rate Opus always runs at
const OUTPUT_SAMPLE_RATE: u32 = 48_000;

/// Samples per channel in one 20 ms Opus frame
const OPUS_FRAME_SAMPLES: usize = 960;

/// Duration of one emitted frame
const OPUS_FRAME_MILLIS: u64 = 20;

/// Fixed input chunk the resampler consumes, matching the AAC frame
/// size
const RESAMPLER_CHUNK: usize = 1024;

/// Upper bound for one encoded Opus frame
const MAX_OPUS_PACKET: usize = 4000;

/// Sampling frequencies indexed by the AudioSpecificConfig
const AAC_SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

/// Extract sample rate and channel count from an
/// AudioSpecificConfig (ISO 14496-3).
pub fn parse_audio_specific_config(asc: &[u8]) -> Result<(u32, usize)> {
    if asc.len() < 2 {
        return Err(Error::Transcode("AudioSpecificConfig too short".into()));
    }
    let freq_index = ((asc[0] & 0x07) << 1) | (asc[1] >> 7);
    let channel_config = (asc[1] >> 3) & 0x0f;
    let sample_rate = AAC_SAMPLE_RATES
        .get(freq_index as usize)
        .copied()
        .ok_or_else(|| Error::Transcode(format!("bad frequency index {}", freq_index)))?;
    if channel_config == 0 || channel_config > 2 {
        return Err(Error::Transcode(format!(
            "unsupported channel configuration {}",
            channel_config
        )));
    }
    Ok((sample_rate, channel_config as usize))
}

/// Streaming AAC to Opus transcoder for one source.
pub struct OpusTranscoder {
    decoder: Box<dyn Decoder>,
    sample_buf: Option<SampleBuffer<f32>>,
    resampler: Option<SincFixedIn<f32>>,
    /// Planar stereo samples waiting for the resampler
    input_fifo: [Vec<f32>; 2],
    /// Planar stereo samples at 48 kHz waiting for the encoder
    output_fifo: [Vec<f32>; 2],
    encoder: Encoder,
    next_pts_ms: u64,
    packet_ts: u64,
}

impl OpusTranscoder {
    /// Build a transcoder from the stream's AudioSpecificConfig.
    ///
    /// `base_pts_ms` anchors the output timeline: the first emitted
    /// frame carries it, each following frame adds 20 ms.
    pub fn new(asc: &[u8], base_pts_ms: u64) -> Result<Self> {
        let (sample_rate, _channels) = parse_audio_specific_config(asc)?;

        let mut params = CodecParameters::new();
        params
            .for_codec(CODEC_TYPE_AAC)
            .with_sample_rate(sample_rate)
            .with_extra_data(asc.to_vec().into_boxed_slice());
        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| Error::Transcode(format!("aac decoder: {}", e)))?;

        let resampler = if sample_rate != OUTPUT_SAMPLE_RATE {
            let params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            Some(
                SincFixedIn::new(
                    OUTPUT_SAMPLE_RATE as f64 / sample_rate as f64,
                    2.0,
                    params,
                    RESAMPLER_CHUNK,
                    2,
                )
                .map_err(|e| Error::Transcode(format!("resampler: {}", e)))?,
            )
        } else {
            None
        };

        let mut encoder = Encoder::new(OUTPUT_SAMPLE_RATE, Channels::Stereo, Application::Audio)
            .map_err(|e| Error::Transcode(format!("opus encoder: {}", e)))?;
        encoder
            .set_bitrate(Bitrate::Bits(64_000))
            .map_err(|e| Error::Transcode(format!("opus bitrate: {}", e)))?;

        Ok(Self {
            decoder,
            sample_buf: None,
            resampler,
            input_fifo: [Vec::new(), Vec::new()],
            output_fifo: [Vec::new(), Vec::new()],
            encoder,
            next_pts_ms: base_pts_ms,
            packet_ts: 0,
        })
    }

    /// Decode one raw AAC frame and emit any completed Opus frames
    /// as `(frame, pts_ms)`.
    pub fn transcode(
        &mut self,
        aac_frame: &[u8],
        emit: &mut dyn FnMut(Bytes, u64),
    ) -> Result<()> {
        let packet = Packet::new_from_slice(0, self.packet_ts, RESAMPLER_CHUNK as u64, aac_frame);
        self.packet_ts += RESAMPLER_CHUNK as u64;

        let decoded = self
            .decoder
            .decode(&packet)
            .map_err(|e| Error::Transcode(format!("aac decode: {}", e)))?;
        let spec = *decoded.spec();
        let channels = spec.channels.count();

        let too_small = self
            .sample_buf
            .as_ref()
            .map_or(true, |buf| buf.capacity() < decoded.capacity() * channels);
        if too_small {
            self.sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
        }
        let Some(sample_buf) = self.sample_buf.as_mut() else {
            return Err(Error::Transcode("sample buffer unavailable".into()));
        };
        sample_buf.copy_interleaved_ref(decoded);

        // fan out to planar stereo, duplicating mono
        for frame in sample_buf.samples().chunks_exact(channels.max(1)) {
            let left = frame[0];
            let right = if channels > 1 { frame[1] } else { left };
            if self.resampler.is_some() {
                self.input_fifo[0].push(left);
                self.input_fifo[1].push(right);
            } else {
                self.output_fifo[0].push(left);
                self.output_fifo[1].push(right);
            }
        }

        if let Some(resampler) = &mut self.resampler {
            while self.input_fifo[0].len() >= RESAMPLER_CHUNK {
                let chunk = [
                    self.input_fifo[0].drain(..RESAMPLER_CHUNK).collect::<Vec<f32>>(),
                    self.input_fifo[1].drain(..RESAMPLER_CHUNK).collect::<Vec<f32>>(),
                ];
                let resampled = resampler
                    .process(&chunk, None)
                    .map_err(|e| Error::Transcode(format!("resample: {}", e)))?;
                self.output_fifo[0].extend_from_slice(&resampled[0]);
                self.output_fifo[1].extend_from_slice(&resampled[1]);
            }
        }

        while self.output_fifo[0].len() >= OPUS_FRAME_SAMPLES {
            let mut interleaved = Vec::with_capacity(OPUS_FRAME_SAMPLES * 2);
            for i in 0..OPUS_FRAME_SAMPLES {
                interleaved.push(self.output_fifo[0][i]);
                interleaved.push(self.output_fifo[1][i]);
            }
            self.output_fifo[0].drain(..OPUS_FRAME_SAMPLES);
            self.output_fifo[1].drain(..OPUS_FRAME_SAMPLES);

            let encoded = self
                .encoder
                .encode_vec_float(&interleaved, MAX_OPUS_PACKET)
                .map_err(|e| Error::Transcode(format!("opus encode: {}", e)))?;
            emit(Bytes::from(encoded), self.next_pts_ms);
            self.next_pts_ms += OPUS_FRAME_MILLIS;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_asc_44100_stereo() {
        // AAC-LC, frequency index 4 (44100), channel config 2
        let asc = [0x12, 0x10];
        assert_eq!(parse_audio_specific_config(&asc).unwrap(), (44_100, 2));
    }

    #[test]
    fn test_parse_asc_48000_mono() {
        // AAC-LC, frequency index 3 (48000), channel config 1
        let asc = [0x11, 0x88];
        assert_eq!(parse_audio_specific_config(&asc).unwrap(), (48_000, 1));
    }

    #[test]
    fn test_parse_asc_rejects_garbage() {
        assert!(parse_audio_specific_config(&[0x12]).is_err());
        // frequency index 14 is out of table
        assert!(parse_audio_specific_config(&[0x17, 0x10]).is_err());
        // channel config 0 unsupported
        assert!(parse_audio_specific_config(&[0x12, 0x00]).is_err());
    }
}
