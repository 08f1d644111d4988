use crate::core::{PlayerError, Result};
use crate::player::audio::sink::{AudioDevice, AudioFormat, DeviceInfo, SampleEncoding};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use crossbeam::queue::SegQueue;
use log::{debug, error, info};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

const STANDARD_RATES: [u32; 4] = [44100, 48000, 88200, 96000];

/// 基于 cpal 的音频设备
pub struct CpalAudioDevice {
    device: Device,
    config: Option<StreamConfig>,
    encoding: SampleEncoding,
    stream: Option<Stream>,
    buffer: Arc<SegQueue<f32>>,
    queued_samples: Arc<AtomicUsize>,
    /// 回调里累加，自然 32 位回绕
    played_frames: Arc<AtomicU32>,
    buffer_frames: u32,
}

// cpal::Stream 本身不是 Send；设备只在音频管线线程中创建和使用
unsafe impl Send for CpalAudioDevice {}

impl CpalAudioDevice {
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlayerError::AudioError("无法找到音频输出设备".to_string()))?;
        debug!("使用音频设备: {}", device.name().unwrap_or_default());

        Ok(Self {
            device,
            config: None,
            encoding: SampleEncoding::PcmF32,
            stream: None,
            buffer: Arc::new(SegQueue::new()),
            queued_samples: Arc::new(AtomicUsize::new(0)),
            played_frames: Arc::new(AtomicU32::new(0)),
            buffer_frames: 0,
        })
    }

    fn clear_buffer(&self) {
        while self.buffer.pop().is_some() {}
        self.queued_samples.store(0, Ordering::SeqCst);
    }
}

impl AudioDevice for CpalAudioDevice {
    fn info(&self) -> DeviceInfo {
        let mut sample_rates = Vec::new();
        let mut channel_counts = Vec::new();
        match self.device.supported_output_configs() {
            Ok(configs) => {
                for supported in configs {
                    for rate in STANDARD_RATES {
                        if rate >= supported.min_sample_rate().0
                            && rate <= supported.max_sample_rate().0
                            && !sample_rates.contains(&rate)
                        {
                            sample_rates.push(rate);
                        }
                    }
                    if !channel_counts.contains(&supported.channels()) {
                        channel_counts.push(supported.channels());
                    }
                }
            }
            Err(e) => error!("无法获取支持的音频配置: {}", e),
        }
        sample_rates.sort_unstable();
        channel_counts.sort_unstable();

        DeviceInfo {
            name: self.device.name().unwrap_or_default(),
            sample_rates,
            channel_counts,
            // 统一转换成 f32 输出，不支持直通
            encodings: vec![SampleEncoding::PcmF32, SampleEncoding::PcmS16],
        }
    }

    fn open(&mut self, format: &AudioFormat) -> Result<()> {
        self.close();
        let config = StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        self.clear_buffer();
        self.played_frames.store(0, Ordering::SeqCst);
        let buffer = self.buffer.clone();
        let queued = self.queued_samples.clone();
        let played = self.played_frames.clone();
        let channels = format.channels.max(1) as usize;

        let stream = self
            .device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut popped = 0usize;
                    for sample in data.iter_mut() {
                        if let Some(value) = buffer.pop() {
                            *sample = value;
                            popped += 1;
                        } else {
                            *sample = 0.0;
                        }
                    }
                    queued.fetch_sub(popped.min(queued.load(Ordering::SeqCst)), Ordering::SeqCst);
                    played.fetch_add((popped / channels) as u32, Ordering::SeqCst);
                },
                move |err| {
                    error!("音频流错误: {}", err);
                },
                None,
            )
            .map_err(|e| PlayerError::AudioError(format!("创建音频流失败: {}", e)))?;

        self.stream = Some(stream);
        self.config = Some(config);
        self.encoding = format.encoding;
        // 设备侧缓冲 0.5 秒
        self.buffer_frames = format.sample_rate / 2;
        info!("音频输出已打开: {} Hz, {} 声道", format.sample_rate, format.channels);
        Ok(())
    }

    fn write(&mut self, data: &[u8], frames: u32) -> Result<u32> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| PlayerError::AudioError("设备未打开".to_string()))?;
        let channels = config.channels.max(1) as usize;
        let queued_frames = self.queued_samples.load(Ordering::SeqCst) / channels;
        let free = (self.buffer_frames as usize).saturating_sub(queued_frames);
        let accepted = (frames as usize).min(free);

        let samples = accepted * channels;
        match self.encoding {
            SampleEncoding::PcmS16 => {
                for chunk in data.chunks_exact(2).take(samples) {
                    let value = i16::from_le_bytes([chunk[0], chunk[1]]);
                    self.buffer.push(value as f32 / i16::MAX as f32);
                }
            }
            _ => {
                for chunk in data.chunks_exact(4).take(samples) {
                    self.buffer
                        .push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
                }
            }
        }
        self.queued_samples.fetch_add(samples, Ordering::SeqCst);
        Ok(accepted as u32)
    }

    fn head_position(&mut self) -> u32 {
        self.played_frames.load(Ordering::SeqCst)
    }

    fn buffer_frames(&self) -> u32 {
        self.buffer_frames
    }

    fn play(&mut self) {
        if let Some(stream) = &self.stream {
            if let Err(e) = stream.play() {
                error!("启动音频流失败: {}", e);
            }
        }
    }

    fn pause(&mut self) {
        if let Some(stream) = &self.stream {
            if let Err(e) = stream.pause() {
                error!("暂停音频流失败: {}", e);
            }
        }
    }

    fn flush(&mut self) {
        self.clear_buffer();
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            info!("音频输出已停止");
        }
        self.config = None;
        self.clear_buffer();
    }
}

impl Drop for CpalAudioDevice {
    fn drop(&mut self) {
        self.close();
    }
}
