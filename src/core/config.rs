use crate::core::{AudioParams, PlayerError, Result, SampleFormat};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 视频帧环形队列的容量上限
pub const FRAME_QUEUE_MAX_SIZE: usize = 10;

/// 音视频同步阈值（毫秒）
pub const SYNC_THRESHOLD_MS: i64 = 25;

/// 落后超过该值时清空整个帧队列（毫秒）
pub const MAX_FRAME_LAG_MS: i64 = 200;

/// 播放器配置
///
/// 所有字段都有默认值，JSON 里只需要写要覆盖的部分。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// 播放到结尾后从头循环
    pub loop_playback: bool,
    /// 不循环时，播放到结尾自动结束会话
    pub auto_exit: bool,
    /// 会话以暂停状态开始
    pub start_paused: bool,
    /// seek 同时清除暂停标志
    pub resume_on_seek: bool,
    /// seek 后丢弃目标位置之前解码出的帧
    pub accurate_seek: bool,
    /// 视频帧队列容量（1..=10）
    pub frame_queue_size: usize,
    pub sync_threshold_ms: i64,
    pub max_frame_lag_ms: i64,
    /// 解码线程 / 同步线程的轮询间隔
    pub poll_interval_ms: u64,
    /// 解封装线程暂停等待的时间片
    pub pause_poll_ms: u64,
    /// 读包软失败或未排空的 EOF 之后的重试间隔
    pub read_retry_ms: u64,
    /// 压缩数据总量超过该值时暂停读包
    pub max_buffered_bytes: usize,
    /// 所有活动队列都达到该包数时暂停读包
    pub max_buffered_packets: usize,
    /// 重采样输出格式
    pub audio_output: AudioParams,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            loop_playback: true,
            auto_exit: false,
            start_paused: false,
            resume_on_seek: false,
            accurate_seek: true,
            frame_queue_size: FRAME_QUEUE_MAX_SIZE,
            sync_threshold_ms: SYNC_THRESHOLD_MS,
            max_frame_lag_ms: MAX_FRAME_LAG_MS,
            poll_interval_ms: 5,
            pause_poll_ms: 10,
            read_retry_ms: 5,
            max_buffered_bytes: 15 * 1024 * 1024,
            max_buffered_packets: 300,
            audio_output: AudioParams {
                sample_rate: 44_100,
                channels: 2,
                format: SampleFormat::S16,
            },
        }
    }
}

impl PlayerConfig {
    /// 从 JSON 字符串解析
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PlayerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// 从 JSON 文件加载
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("加载播放器配置: {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_queue_size == 0 {
            return Err(PlayerError::ConfigError("frame_queue_size 不能为 0".to_string()));
        }
        if self.sync_threshold_ms <= 0 {
            return Err(PlayerError::ConfigError("sync_threshold_ms 必须大于 0".to_string()));
        }
        if self.max_frame_lag_ms < self.sync_threshold_ms {
            return Err(PlayerError::ConfigError(format!(
                "max_frame_lag_ms ({}) 不能小于 sync_threshold_ms ({})",
                self.max_frame_lag_ms, self.sync_threshold_ms
            )));
        }
        if self.poll_interval_ms == 0 || self.pause_poll_ms == 0 {
            return Err(PlayerError::ConfigError("轮询间隔必须大于 0".to_string()));
        }
        let out = &self.audio_output;
        if out.sample_rate == 0 || out.channels == 0 {
            return Err(PlayerError::ConfigError(format!(
                "非法的音频输出格式: {} Hz, {} 声道",
                out.sample_rate, out.channels
            )));
        }
        Ok(())
    }

    /// 实际使用的帧队列容量
    pub fn frame_capacity(&self) -> usize {
        self.frame_queue_size.clamp(1, FRAME_QUEUE_MAX_SIZE)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }

    pub fn read_retry(&self) -> Duration {
        Duration::from_millis(self.read_retry_ms)
    }
}
