//! Symphonia-backed file decoder.
//!
//! One [`Decoder`] owns one open file: probe, default audio track,
//! codec setup. Blocks come out as interleaved i16 at the source
//! format; the engine worker drives it one packet at a time so the
//! slot ring stays the only backpressure.

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use tracing::{debug, warn};

use crate::error::{AudioError, AudioResult};

pub struct Decoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: u16,
    total_frames: u64,
}

impl Decoder {
    /// Probe and open a file for decoding.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, no audio track is
    /// present, or the codec is unsupported.
    pub fn open(path: &Path) -> AudioResult<Self> {
        let file = File::open(path)?;
        let stream = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe().format(
            &hint,
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(AudioError::NoAudioTrack)?;
        let track_id = track.id;
        let params = &track.codec_params;

        let sample_rate =
            params.sample_rate.ok_or(AudioError::UnsupportedFormat("unknown sample rate"))?;
        let channels = u16::try_from(
            params.channels.ok_or(AudioError::UnsupportedFormat("unknown channel layout"))?.count(),
        )
        .map_err(|_| AudioError::UnsupportedFormat("too many channels"))?;
        let total_frames = params.n_frames.unwrap_or(0);

        let decoder = symphonia::default::get_codecs().make(params, &DecoderOptions::default())?;

        debug!(path = %path.display(), sample_rate, channels, total_frames, "decoder opened");
        Ok(Self { format, decoder, track_id, sample_rate, channels, total_frames })
    }

    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Total frames in the track, 0 when the container does not say.
    #[must_use]
    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// Decode the next packet of the audio track into `out` as
    /// interleaved i16. Returns `Ok(false)` at end of stream; `out` is
    /// cleared first either way. Corrupt packets are skipped.
    ///
    /// # Errors
    /// Returns an error on a non-recoverable decode failure.
    pub fn next_block(&mut self, out: &mut Vec<i16>) -> AudioResult<bool> {
        out.clear();
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let mut buffer = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
                    buffer.copy_interleaved_ref(decoded);
                    out.extend_from_slice(buffer.samples());
                    return Ok(true);
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!(error = e, "skipping corrupt packet");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Coarse seek to a fraction of the track, 0-1.
    ///
    /// # Errors
    /// Returns an error if the format reader cannot seek.
    pub fn seek_to(&mut self, fraction: f64) -> AudioResult<()> {
        let fraction = fraction.clamp(0.0, 1.0);
        let seconds = if self.sample_rate > 0 {
            (self.total_frames as f64 / f64::from(self.sample_rate)) * fraction
        } else {
            0.0
        };
        self.format.seek(
            SeekMode::Coarse,
            SeekTo::Time { time: Time::from(seconds), track_id: Some(self.track_id) },
        )?;
        self.decoder.reset();
        Ok(())
    }

    /// Frame offset a fraction of the track corresponds to.
    #[must_use]
    pub fn frame_at(&self, fraction: f64) -> u64 {
        (self.total_frames as f64 * fraction.clamp(0.0, 1.0)) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 0.1 s of a 440 Hz sine, mono 16-bit 44.1 kHz.
    fn write_fixture(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("tone.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for n in 0..4410u32 {
            let t = f64::from(n) / 44_100.0;
            let sample = (t * 440.0 * std::f64::consts::TAU).sin();
            writer.write_sample((sample * f64::from(i16::MAX) * 0.5) as i16).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    #[test]
    fn test_open_reports_stream_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let decoder = Decoder::open(&write_fixture(&dir)).unwrap();
        assert_eq!(decoder.sample_rate(), 44_100);
        assert_eq!(decoder.channels(), 1);
        assert_eq!(decoder.total_frames(), 4410);
    }

    #[test]
    fn test_decodes_every_frame_then_eof() {
        let dir = tempfile::tempdir().unwrap();
        let mut decoder = Decoder::open(&write_fixture(&dir)).unwrap();

        let mut block = Vec::new();
        let mut frames = 0u64;
        while decoder.next_block(&mut block).unwrap() {
            frames += block.len() as u64;
        }
        assert_eq!(frames, 4410);
        // EOF is sticky.
        assert!(!decoder.next_block(&mut block).unwrap());
    }

    #[test]
    fn test_open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Decoder::open(&dir.path().join("absent.flac")).is_err());
    }
}
