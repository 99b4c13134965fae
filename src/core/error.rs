use thiserror::Error;

use crate::player::codec::CodecHandle;

#[derive(Error, Debug)]
pub enum PlayerError {
    #[cfg(feature = "ffmpeg")]
    #[error("FFmpeg 错误: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 容器无法打开（错误的 URL / 不支持的封装格式）
    #[error("无法打开媒体: {0}")]
    OpenError(String),

    /// 流信息探测失败
    #[error("无法获取流信息: {0}")]
    StreamInfoError(String),

    #[error("没有可用的音频流或视频流")]
    NoUsableStream,

    /// 单路流的解码器无法创建；另一路可用时不致命
    #[error("解码器初始化失败 (stream #{stream_index}): {reason}")]
    DecoderInitError { stream_index: usize, reason: String },

    /// 确认的 I/O 读取失败，终止解封装循环
    #[error("读取数据包失败: {0}")]
    ReadError(String),

    #[error("Seek 失败: {0}")]
    SeekError(String),

    #[error("解码错误: {0}")]
    DecodeError(String),

    #[error("渲染错误: {0}")]
    RenderError(String),

    #[error("音频输出错误: {0}")]
    AudioError(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 解码器线程访问了已经释放的 codec 上下文
    #[error("codec 上下文已释放: {0:?}")]
    CodecReleased(CodecHandle),

    #[error("非法状态: {0}")]
    InvalidState(String),

    #[error("其他错误: {0}")]
    Other(String),

    #[error("Anyhow 错误: {0}")]
    AnyhowError(#[from] anyhow::Error),
}

impl From<serde_json::Error> for PlayerError {
    fn from(e: serde_json::Error) -> Self {
        PlayerError::ConfigError(e.to_string())
    }
}

impl PlayerError {
    /// 会话初始化阶段的错误（会话直接结束）
    pub fn is_init_error(&self) -> bool {
        matches!(
            self,
            PlayerError::OpenError(_)
                | PlayerError::StreamInfoError(_)
                | PlayerError::NoUsableStream
                | PlayerError::DecoderInitError { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;
