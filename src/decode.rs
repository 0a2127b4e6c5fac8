//! Audio decoding using symphonia.
//!
//! Supports every container and codec symphonia is built with (WAV, FLAC,
//! MP3, OGG/Vorbis, ...). Reads can start at a frame offset and stop after a
//! fixed number of frames, so long files are never decoded in full.

use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use std::fs::File;
use std::path::Path;
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, DecoderOptions};
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Symphonia error: {0}")]
    Symphonia(#[from] symphonia::core::errors::Error),
    #[error("No audio track found")]
    NoAudioTrack,
    #[error("Unsupported codec")]
    UnsupportedCodec,
    #[error("Track does not report its length in frames")]
    UnknownLength,
    #[error("Decoded zero frames")]
    Empty,
    #[error("Track declares {expected} channels but a packet decoded to {got}")]
    ChannelMismatch { expected: usize, got: usize },
    #[error("Resampler construction error: {0}")]
    ResamplerConstruction(#[from] rubato::ResamplerConstructionError),
    #[error("Resampling error: {0}")]
    Resample(#[from] rubato::ResampleError),
}

/// Header-level facts about an audio file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub n_frames: u64,
    pub channels: usize,
}

impl AudioInfo {
    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        self.n_frames as f64 / self.sample_rate as f64
    }
}

/// Decoded audio samples, interleaved.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
}

impl DecodedAudio {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    /// Number of frames (samples per channel).
    pub fn n_frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }

    /// Extract a single channel.
    pub fn channel(&self, ch: usize) -> Vec<f32> {
        if self.channels == 1 {
            return self.samples.clone();
        }
        self.samples
            .iter()
            .skip(ch)
            .step_by(self.channels)
            .copied()
            .collect()
    }

    /// Convert to mono by averaging channels.
    pub fn to_mono(&self) -> Vec<f32> {
        if self.channels == 1 {
            return self.samples.clone();
        }

        let n_frames = self.n_frames();
        let mut mono = Vec::with_capacity(n_frames);

        for frame in 0..n_frames {
            let mut sum = 0.0;
            for ch in 0..self.channels {
                sum += self.samples[frame * self.channels + ch];
            }
            mono.push(sum / self.channels as f32);
        }

        mono
    }

    /// Resample every channel to `target_rate` using sinc interpolation (rubato).
    pub fn resample(&self, target_rate: u32) -> Result<DecodedAudio, DecodeError> {
        if self.sample_rate == target_rate {
            return Ok(self.clone());
        }

        let channels: Vec<Vec<f32>> = (0..self.channels).map(|ch| self.channel(ch)).collect();
        let resampled = resample_channels(&channels, self.sample_rate, target_rate)?;

        let n_frames = resampled.first().map_or(0, Vec::len);
        let mut samples = Vec::with_capacity(n_frames * self.channels);
        for frame in 0..n_frames {
            for channel in &resampled {
                samples.push(channel[frame]);
            }
        }

        Ok(DecodedAudio {
            samples,
            sample_rate: target_rate,
            channels: self.channels,
        })
    }
}

/// Resample planar channels from `source_rate` to `target_rate`.
/// Uses a high-quality anti-aliasing filter to prevent aliasing artifacts.
pub fn resample_channels(
    channels: &[Vec<f32>],
    source_rate: u32,
    target_rate: u32,
) -> Result<Vec<Vec<f32>>, DecodeError> {
    let n_in = channels.first().map_or(0, Vec::len);
    if source_rate == target_rate || n_in == 0 {
        return Ok(channels.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let resample_ratio = target_rate as f64 / source_rate as f64;
    let chunk_size = 1024;

    // max_resample_ratio_relative must cover actual ratio (e.g., 8kHz→32kHz = 4x)
    let max_ratio = resample_ratio.max(1.0 / resample_ratio) * 1.1;

    let mut resampler =
        SincFixedIn::<f32>::new(resample_ratio, max_ratio, params, chunk_size, channels.len())?;

    let mut output = vec![Vec::new(); channels.len()];
    let mut pos = 0;

    while pos < n_in {
        let end = (pos + chunk_size).min(n_in);

        // Last chunk is zero-padded up to the fixed input size.
        let input: Vec<Vec<f32>> = channels
            .iter()
            .map(|ch| {
                let mut chunk = ch[pos..end].to_vec();
                chunk.resize(chunk_size, 0.0);
                chunk
            })
            .collect();

        let resampled = resampler.process(&input, None)?;
        for (out, chunk) in output.iter_mut().zip(resampled) {
            out.extend_from_slice(&chunk);
        }

        pos += chunk_size;
    }

    let expected_len = (n_in as f64 * resample_ratio).round() as usize;
    for out in &mut output {
        out.resize(expected_len, 0.0);
    }

    Ok(output)
}

struct OpenTrack {
    format: Box<dyn FormatReader>,
    track_id: u32,
    params: CodecParameters,
}

fn open_track(path: &Path) -> Result<OpenTrack, DecodeError> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let format = probed.format;

    // Find the first audio track
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(DecodeError::NoAudioTrack)?;

    let track_id = track.id;
    let params = track.codec_params.clone();

    Ok(OpenTrack {
        format,
        track_id,
        params,
    })
}

/// Read sample rate, length and channel count from the container header.
pub fn probe_info<P: AsRef<Path>>(path: P) -> Result<AudioInfo, DecodeError> {
    let track = open_track(path.as_ref())?;
    let sample_rate = track
        .params
        .sample_rate
        .ok_or(DecodeError::UnsupportedCodec)?;
    let n_frames = track.params.n_frames.ok_or(DecodeError::UnknownLength)?;
    let channels = track.params.channels.map(|c| c.count()).unwrap_or(1);

    Ok(AudioInfo {
        sample_rate,
        n_frames,
        channels,
    })
}

/// Decode `num_frames` frames starting at `frame_offset` (source rate).
/// `None` decodes through to the end of the stream.
pub fn decode_file<P: AsRef<Path>>(
    path: P,
    frame_offset: u64,
    num_frames: Option<usize>,
) -> Result<DecodedAudio, DecodeError> {
    let OpenTrack {
        mut format,
        track_id,
        params,
    } = open_track(path.as_ref())?;

    let sample_rate = params.sample_rate.ok_or(DecodeError::UnsupportedCodec)?;
    let channels = params.channels.map(|c| c.count()).unwrap_or(1);

    let decoder_opts = DecoderOptions::default();
    let mut decoder = symphonia::default::get_codecs().make(&params, &decoder_opts)?;

    // Containers that cannot seek are decoded from the start; frames before the
    // offset are dropped below either way.
    if frame_offset > 0
        && format
            .seek(
                SeekMode::Accurate,
                SeekTo::TimeStamp {
                    ts: frame_offset,
                    track_id,
                },
            )
            .is_ok()
    {
        decoder.reset();
    }

    let wanted = num_frames.map(|n| n * channels);
    let mut samples = Vec::with_capacity(wanted.unwrap_or(0));
    let mut packet_samples = Vec::new();

    loop {
        if wanted.is_some_and(|w| samples.len() >= w) {
            break;
        }

        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(e.into()),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let packet_ts = packet.ts();
        let decoded = decoder.decode(&packet)?;

        packet_samples.clear();
        append_samples(&decoded, &mut packet_samples, channels)?;

        let skip = (frame_offset.saturating_sub(packet_ts) as usize * channels)
            .min(packet_samples.len());
        samples.extend_from_slice(&packet_samples[skip..]);
    }

    if let Some(w) = wanted {
        samples.truncate(w);
    }

    if samples.is_empty() {
        return Err(DecodeError::Empty);
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

fn append_samples(
    buffer: &AudioBufferRef,
    output: &mut Vec<f32>,
    channels: usize,
) -> Result<(), DecodeError> {
    let got = buffer.spec().channels.count();
    if got != channels {
        return Err(DecodeError::ChannelMismatch {
            expected: channels,
            got,
        });
    }
    match buffer {
        AudioBufferRef::F32(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    output.push(buf.chan(ch)[frame]);
                }
            }
        }
        AudioBufferRef::F64(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    output.push(buf.chan(ch)[frame] as f32);
                }
            }
        }
        AudioBufferRef::S16(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    output.push(buf.chan(ch)[frame] as f32 / 32768.0);
                }
            }
        }
        AudioBufferRef::S24(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    output.push(buf.chan(ch)[frame].inner() as f32 / 8388608.0);
                }
            }
        }
        AudioBufferRef::S32(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    output.push(buf.chan(ch)[frame] as f32 / 2147483648.0);
                }
            }
        }
        AudioBufferRef::U8(buf) => {
            for frame in 0..buf.frames() {
                for ch in 0..channels {
                    output.push((buf.chan(ch)[frame] as f32 - 128.0) / 128.0);
                }
            }
        }
        _ => {
            return Err(DecodeError::UnsupportedCodec);
        }
    }
    Ok(())
}
