use serde::{Deserialize, Serialize};

/// 媒体流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    Subtitle,
    Data,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Subtitle => "subtitle",
            MediaKind::Data => "data",
        }
    }
}

/// 有理数（时间基、帧率）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn is_valid(&self) -> bool {
        self.num != 0 && self.den != 0
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    /// 以该时间基表示的时间戳 → 毫秒
    pub fn to_millis(&self, ts: i64) -> i64 {
        (ts as f64 * self.as_f64() * 1000.0) as i64
    }

    /// 把帧率当作时间基的倒数，得到单帧时长（毫秒）
    pub fn frame_duration_ms(&self) -> i64 {
        if self.is_valid() {
            (self.den as f64 * 1000.0 / self.num as f64).round() as i64
        } else {
            0
        }
    }
}

/// 像素格式
///
/// 编解码引擎无法映射到这里的格式，由引擎自身转换为 RGBA 再交出。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    YUV420P,
    YUVJ420P,
    YUV422P,
    YUV444P,
    NV12,
    NV21,
    RGBA,
    BGRA,
    RGB24,
    Unknown,
}

impl PixelFormat {
    /// 平面数量
    pub fn plane_count(&self) -> usize {
        match self {
            PixelFormat::YUV420P
            | PixelFormat::YUVJ420P
            | PixelFormat::YUV422P
            | PixelFormat::YUV444P => 3,
            PixelFormat::NV12 | PixelFormat::NV21 => 2,
            PixelFormat::RGBA | PixelFormat::BGRA | PixelFormat::RGB24 => 1,
            PixelFormat::Unknown => 0,
        }
    }
}

/// 音频采样格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    /// 交错 16 位有符号
    S16,
    /// 交错 32 位浮点
    F32,
    /// 平面 16 位有符号
    S16P,
    /// 平面 32 位浮点
    F32P,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::S16 | SampleFormat::S16P => 2,
            SampleFormat::F32 | SampleFormat::F32P => 4,
        }
    }

    pub fn is_planar(&self) -> bool {
        matches!(self, SampleFormat::S16P | SampleFormat::F32P)
    }
}

/// 音频参数（采样率 / 声道 / 采样格式）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
}

impl AudioParams {
    /// 每个采样点（所有声道）占用的字节数
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * self.format.bytes_per_sample()
    }
}

/// 播放状态
///
/// `Uninitialized → Initializing → Ready → Playing ⇄ Paused → Stopping → Stopped`，
/// `Seeking` 是 Playing/Paused 下的瞬时子状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Uninitialized,
    Initializing,
    Ready,
    Playing,
    Paused,
    Seeking,
    Stopping,
    Stopped,
}

impl PlaybackState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlaybackState::Stopping | PlaybackState::Stopped)
    }
}

/// `get_param` 可查询的参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaParam {
    VideoWidth,
    VideoHeight,
    /// 总时长（秒）
    Duration,
    RotateAngle,
}

/// 媒体信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration_ms: i64,       // 总时长（毫秒），未知为 0
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub rotation: i32,          // 旋转角度（度）
    pub video_codec: String,
    pub audio_codec: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// 缓冲状态信息（用于监控和调试）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BufferStatus {
    /// 视频数据包队列长度
    pub video_packets: usize,

    /// 音频数据包队列长度
    pub audio_packets: usize,

    /// 队列中压缩数据的总字节数
    pub queued_bytes: usize,

    /// 已解码、待渲染的视频帧数
    pub video_frames: usize,

    /// 视频帧环形队列容量
    pub video_frame_capacity: usize,
}
