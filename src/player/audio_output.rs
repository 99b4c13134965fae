use crate::core::{log_ctx, AudioParams, PlayerError, Result, SampleFormat};
use crate::player::render::AudioSink;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig, SupportedStreamConfigRange};
use crossbeam::queue::SegQueue;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// 设备缓冲的最大时长（毫秒），超过后 `render_frame` 阻塞
const MAX_BUFFERED_MS: u64 = 200;

/// 回退配置（最常见的放前面）
const FALLBACK_CONFIGS: [(u32, u16); 4] = [(44_100, 2), (48_000, 2), (48_000, 1), (44_100, 1)];

// cpal::Stream 不是 Send，但只在持锁时创建 / 销毁，不会被并发访问
struct StreamHandle(Stream);

unsafe impl Send for StreamHandle {}

/// cpal 音频输出
///
/// 解码线程写入交错 PCM，设备回调从无锁队列取样本；
/// 队列积压超过 `MAX_BUFFERED_MS` 时写入方阻塞，从而按实时速度推进音频时钟。
pub struct CpalAudioSink {
    device: Device,
    stream: Mutex<Option<StreamHandle>>,
    buffer: Arc<SegQueue<f32>>,
    params: Mutex<Option<AudioParams>>,
    closed: AtomicBool,
}

impl CpalAudioSink {
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlayerError::AudioError("无法找到音频输出设备".to_string()))?;
        debug!("使用音频设备: {}", device.name().unwrap_or_default());
        Ok(Self {
            device,
            stream: Mutex::new(None),
            buffer: Arc::new(SegQueue::new()),
            params: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// 选择设备支持的输出格式：优先使用请求的格式，不支持则按回退列表尝试
    pub fn negotiate(&self, requested: &AudioParams) -> Result<AudioParams> {
        let supports = |rate: u32, channels: u16| -> Result<bool> {
            let config = StreamConfig {
                channels,
                sample_rate: cpal::SampleRate(rate),
                buffer_size: cpal::BufferSize::Default,
            };
            let mut supported = self
                .device
                .supported_output_configs()
                .map_err(|e| PlayerError::AudioError(format!("无法获取支持的音频配置: {}", e)))?;
            Ok(supported.any(|range| Self::is_config_compatible(&config, &range)))
        };

        if supports(requested.sample_rate, requested.channels)? {
            return Ok(*requested);
        }
        warn!(
            "⚠️  音频设备不支持 {} Hz, {} 声道，尝试回退配置",
            requested.sample_rate, requested.channels
        );
        for (rate, channels) in FALLBACK_CONFIGS {
            if supports(rate, channels)? {
                info!("✅ 使用回退配置: {} Hz, {} 声道", rate, channels);
                return Ok(AudioParams {
                    sample_rate: rate,
                    channels,
                    format: requested.format,
                });
            }
        }
        Err(PlayerError::AudioError(format!(
            "音频设备不支持任何标准配置 (原请求: {} Hz, {} 声道)",
            requested.sample_rate, requested.channels
        )))
    }

    fn is_config_compatible(config: &StreamConfig, supported: &SupportedStreamConfigRange) -> bool {
        let rate_in_range = config.sample_rate.0 >= supported.min_sample_rate().0
            && config.sample_rate.0 <= supported.max_sample_rate().0;
        rate_in_range && config.channels == supported.channels()
    }

    fn max_buffered_samples(params: &AudioParams) -> usize {
        params.sample_rate as usize * params.channels as usize * MAX_BUFFERED_MS as usize / 1000
    }

    fn push_samples(&self, params: &AudioParams, data: &[u8]) -> Result<()> {
        match params.format {
            SampleFormat::S16 => {
                for chunk in data.chunks_exact(2) {
                    let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
                    self.buffer.push(sample as f32 / i16::MAX as f32);
                }
            }
            SampleFormat::F32 => {
                for chunk in data.chunks_exact(4) {
                    self.buffer.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
                }
            }
            other => {
                return Err(PlayerError::AudioError(format!("不支持的输出采样格式: {:?}", other)));
            }
        }
        Ok(())
    }
}

impl AudioSink for CpalAudioSink {
    fn init(&self, params: &AudioParams) -> Result<()> {
        let mut stream_slot = self.stream.lock();
        if stream_slot.is_some() {
            return Ok(());
        }
        info!(
            "{} 🔊 初始化音频输出: {} Hz, {} 声道, {:?}",
            log_ctx(),
            params.sample_rate,
            params.channels,
            params.format
        );
        let config = StreamConfig {
            channels: params.channels,
            sample_rate: cpal::SampleRate(params.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let buffer = self.buffer.clone();
        let stream = self
            .device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for sample in data.iter_mut() {
                        *sample = buffer.pop().unwrap_or(0.0);
                    }
                },
                move |err| {
                    error!("音频流错误: {}", err);
                },
                None,
            )
            .map_err(|e| PlayerError::AudioError(format!("创建音频流失败: {}", e)))?;
        stream
            .play()
            .map_err(|e| PlayerError::AudioError(format!("启动音频流失败: {}", e)))?;

        *stream_slot = Some(StreamHandle(stream));
        *self.params.lock() = Some(*params);
        self.closed.store(false, Ordering::SeqCst);
        info!("{} ✅ 音频输出已启动", log_ctx());
        Ok(())
    }

    fn render_frame(&self, data: &[u8]) -> Result<()> {
        let Some(params) = *self.params.lock() else {
            return Err(PlayerError::AudioError("音频输出尚未初始化".to_string()));
        };
        let limit = Self::max_buffered_samples(&params);
        while self.buffer.len() > limit && !self.closed.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }
        self.push_samples(&params, data)
    }

    fn clear_cache(&self) {
        let mut dropped = 0usize;
        while self.buffer.pop().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("🧹 清空音频输出缓冲: {} 个采样", dropped);
        }
    }

    fn uninit(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(stream) = self.stream.lock().take() {
            drop(stream);
            info!("{} 🔇 音频输出已停止", log_ctx());
        }
        self.clear_cache();
        *self.params.lock() = None;
    }
}

impl Drop for CpalAudioSink {
    fn drop(&mut self) {
        self.uninit();
    }
}
