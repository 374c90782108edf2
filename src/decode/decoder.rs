//! 音频文件解码器
//!
//! 使用 symphonia 库解码，支持：FLAC, WAV, AIFF, MP3
//!
//! 输出统一为 16-bit 有符号小端交错 PCM 字节，格式用 `WaveFormat` 描述，
//! 可以直接交给 `StreamingSource::add` / `add_async`

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

use crate::audio::{FormatError, WaveFormat};

/// 解码错误
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),
    #[error("unsupported audio format")]
    UnsupportedFormat,
    #[error("no audio track found")]
    NoAudioTrack,
    #[error("failed to create decoder: {0}")]
    DecoderCreation(String),
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    #[error("unsupported stream layout: {0}")]
    Layout(#[from] FormatError),
}

/// 音频文件信息
#[derive(Debug, Clone)]
pub struct AudioInfo {
    /// 解码输出的 PCM 格式
    pub format: WaveFormat,
    /// 原始位深度
    pub bit_depth: Option<u32>,
    /// 总帧数（如果已知）
    pub total_frames: Option<u64>,
    /// 总时长（秒）
    pub duration_secs: Option<f64>,
    /// 容器名称
    pub container: String,
    /// 编解码器名称
    pub codec: String,
}

/// 音频文件解码器
pub struct AudioDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    info: AudioInfo,
    samples: Option<SampleBuffer<i16>>,
    bytes: Vec<u8>,
}

impl AudioDecoder {
    /// 打开音频文件
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DecodeError> {
        let path = path.as_ref();

        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        // 提示文件扩展名
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let metadata_opts = MetadataOptions::default();

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &metadata_opts)
            .map_err(|_| DecodeError::UnsupportedFormat)?;

        let reader = probed.format;
        let container = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|s| s.to_uppercase())
            .unwrap_or_else(|| "Unknown".to_string());

        // 第一个音频轨道
        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecodeError::NoAudioTrack)?;

        let track_id = track.id;
        let codec_params = &track.codec_params;

        let sample_rate = codec_params.sample_rate.ok_or(DecodeError::NoAudioTrack)?;
        let channels = codec_params.channels.map(|c| c.count() as u16).unwrap_or(2);
        let format = WaveFormat::new(sample_rate, channels, 16)?;

        let total_frames = codec_params.n_frames;
        let codec = symphonia::default::get_codecs()
            .get_codec(codec_params.codec)
            .map(|c| c.short_name.to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        let info = AudioInfo {
            format,
            bit_depth: codec_params.bits_per_sample,
            total_frames,
            duration_secs: total_frames.map(|f| f as f64 / sample_rate as f64),
            container,
            codec,
        };

        let decoder = symphonia::default::get_codecs()
            .make(codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError::DecoderCreation(e.to_string()))?;

        Ok(Self {
            reader,
            decoder,
            track_id,
            info,
            samples: None,
            bytes: Vec::new(),
        })
    }

    /// 获取音频信息
    pub fn info(&self) -> &AudioInfo {
        &self.info
    }

    #[inline]
    pub fn format(&self) -> WaveFormat {
        self.info.format
    }

    /// 解码下一个 packet
    ///
    /// 返回 (PCM 字节, 块数)；`None` 表示文件结束
    pub fn next_chunk(&mut self) -> Result<Option<(&[u8], usize)>, DecodeError> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            // 跳过非目标轨道
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                // 跳过损坏的帧
                Err(SymphoniaError::DecodeError(e)) => {
                    log::debug!("Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            let frames = decoded.frames();
            if frames == 0 {
                continue;
            }

            let spec = *decoded.spec();
            if spec.channels.count() != self.info.format.channels as usize {
                return Err(DecodeError::DecodeFailed(format!(
                    "channel count changed mid-stream ({} -> {})",
                    self.info.format.channels,
                    spec.channels.count()
                )));
            }

            let samples = sample_buffer(&mut self.samples, frames, spec);
            samples.copy_interleaved_ref(decoded);

            self.bytes.clear();
            for s in samples.samples() {
                self.bytes.extend_from_slice(&s.to_le_bytes());
            }
            return Ok(Some((&self.bytes, frames)));
        }
    }
}

/// 复用样本缓冲区，容量不够时重新分配
fn sample_buffer(slot: &mut Option<SampleBuffer<i16>>, frames: usize, spec: SignalSpec) -> &mut SampleBuffer<i16> {
    let reuse = slot
        .as_ref()
        .is_some_and(|buf| buf.capacity() >= frames * spec.channels.count());
    if !reuse {
        *slot = None;
    }
    slot.get_or_insert_with(|| SampleBuffer::new(frames as u64, spec))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 写一个最简单的 16-bit PCM WAV 文件
    fn write_wav(path: &Path, rate: u32, channels: u16, samples: &[i16]) {
        let data_len = (samples.len() * 2) as u32;
        let block_align = channels * 2;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&rate.to_le_bytes());
        bytes.extend_from_slice(&(rate * block_align as u32).to_le_bytes());
        bytes.extend_from_slice(&block_align.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_decode_wav_to_pcm_bytes() {
        let path = std::env::temp_dir().join(format!("pcm-streamer-decode-{}.wav", std::process::id()));
        let samples: Vec<i16> = (0..2000).map(|i| ((i % 100) - 50) * 300).collect();
        write_wav(&path, 22050, 2, &samples);

        let mut decoder = AudioDecoder::open(&path).unwrap();
        assert_eq!(decoder.format(), WaveFormat::new(22050, 2, 16).unwrap());
        assert_eq!(decoder.info().container, "WAV");

        let mut pcm = Vec::new();
        let mut blocks = 0;
        while let Some((bytes, n)) = decoder.next_chunk().unwrap() {
            assert_eq!(bytes.len(), n * 4);
            pcm.extend_from_slice(bytes);
            blocks += n;
        }
        std::fs::remove_file(&path).ok();

        assert_eq!(blocks, 1000);
        let expected: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        assert_eq!(pcm, expected);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            AudioDecoder::open("/nonexistent/pcm-streamer.wav"),
            Err(DecodeError::FileOpen(_))
        ));
    }
}
