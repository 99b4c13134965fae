use crate::core::{AudioParams, MediaKind, PixelFormat, PlayerError, Rational, Result, SampleFormat};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

/// 压缩数据包（可跨线程传递）
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub stream_index: usize,
    /// 显示时间戳（流时间基），未知为 None
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    /// 时长（流时间基）
    pub duration: i64,
    pub is_key: bool,
    pub data: Vec<u8>,
    /// 入队时由 PacketQueue 写入，用于识别 flush 之前的旧包
    pub serial: u64,
}

impl Packet {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// 解码后的视频帧
///
/// 平面缓冲区由帧队列的槽位持有并原地复用。
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: [Vec<u8>; 3],
    pub strides: [usize; 3],
    /// 显示时间戳（流时间基）
    pub pts: Option<i64>,
    /// 时长（流时间基），未知为 0
    pub duration: i64,
    pub key_frame: bool,
}

impl Default for VideoFrame {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            format: PixelFormat::Unknown,
            planes: [Vec::new(), Vec::new(), Vec::new()],
            strides: [0; 3],
            pts: None,
            duration: 0,
            key_frame: false,
        }
    }
}

impl VideoFrame {
    /// 清空元数据，保留缓冲区容量
    pub fn reset(&mut self) {
        for plane in self.planes.iter_mut() {
            plane.clear();
        }
        self.strides = [0; 3];
        self.pts = None;
        self.duration = 0;
        self.key_frame = false;
    }

    /// 复制到指定平面（复用已有容量）
    pub fn fill_plane(&mut self, index: usize, data: &[u8], stride: usize) {
        let plane = &mut self.planes[index];
        plane.clear();
        plane.extend_from_slice(data);
        self.strides[index] = stride;
    }
}

/// 解码后的音频帧
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// 显示时间戳（流时间基）
    pub pts: Option<i64>,
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
    pub nb_samples: usize,
    /// 交错格式只使用第 0 个平面
    pub planes: Vec<Vec<u8>>,
}

impl Default for AudioFrame {
    fn default() -> Self {
        Self {
            pts: None,
            sample_rate: 0,
            channels: 0,
            format: SampleFormat::S16,
            nb_samples: 0,
            planes: Vec::new(),
        }
    }
}

impl AudioFrame {
    pub fn params(&self) -> AudioParams {
        AudioParams {
            sample_rate: self.sample_rate,
            channels: self.channels,
            format: self.format,
        }
    }

    /// 该帧的播放时长（毫秒）
    pub fn duration_ms(&self) -> i64 {
        if self.sample_rate == 0 {
            0
        } else {
            self.nb_samples as i64 * 1000 / self.sample_rate as i64
        }
    }
}

/// 流描述
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: MediaKind,
    pub codec_name: String,
    pub time_base: Rational,
    /// 平均帧率（仅视频）
    pub frame_rate: Rational,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub sample_rate: u32,
    pub channels: u16,
    pub metadata: HashMap<String, String>,
}

impl StreamInfo {
    /// 旋转角度（`rotate` 元数据，默认 0）
    pub fn rotation(&self) -> i32 {
        self.metadata
            .get("rotate")
            .and_then(|v| v.trim().parse::<i32>().ok())
            .unwrap_or(0)
    }
}

/// 读包结果
#[derive(Debug)]
pub enum ReadOutcome {
    Packet(Packet),
    /// 确认到达文件末尾
    EndOfStream,
    /// 暂时读不到数据（尚未确认 EOF），稍后重试
    Retry,
}

/// 送包结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Accepted,
    /// 解码器需要先取走输出，同一个包稍后重新提交
    TryAgain,
}

/// 取帧结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    Frame,
    NeedsInput,
    EndOfStream,
}

/// 编解码引擎 - 打开容器并提供重采样 / 像素格式转换
pub trait CodecEngine: Send + Sync {
    /// 打开容器
    fn open_input(&self, url: &str) -> Result<Box<dyn DemuxContext>>;

    /// 创建重采样器（输入格式 → 固定输出格式）
    fn create_resampler(&self, input: &AudioParams, output: &AudioParams) -> Result<Box<dyn Resampler>>;

    /// 创建像素格式转换器（任意格式 → RGBA，同时缩放到目标尺寸）
    fn create_converter(
        &self,
        src_width: u32,
        src_height: u32,
        src_format: PixelFormat,
        dst_width: u32,
        dst_height: u32,
    ) -> Result<Box<dyn FrameConverter>>;

    fn name(&self) -> &str;
}

/// 解封装上下文
///
/// 所有方法只在会话的解封装线程中调用。
pub trait DemuxContext: Send {
    /// 探测流信息
    fn find_stream_info(&mut self) -> Result<()>;

    fn streams(&self) -> Vec<StreamInfo>;

    /// 总时长（微秒），未知为 None
    fn duration_us(&self) -> Option<i64>;

    /// 起始时间偏移（微秒）
    fn start_time_us(&self) -> Option<i64>;

    /// 为指定流查找并打开解码器
    fn open_decoder(&mut self, stream_index: usize) -> Result<Box<dyn CodecContext>>;

    /// 读取下一个数据包
    ///
    /// `Err` 表示确认的 I/O 失败。
    fn read_packet(&mut self) -> Result<ReadOutcome>;

    /// Seek 到目标时间（微秒），落在目标之前最近的关键帧
    fn seek(&mut self, target_us: i64) -> Result<()>;

    fn description(&self) -> String;
}

/// 解码器上下文
pub trait CodecContext: Send {
    fn send_packet(&mut self, packet: &Packet) -> Result<SendStatus>;

    /// 取出一帧视频，写入调用方提供的帧（复用其缓冲区）
    fn receive_video(&mut self, _frame: &mut VideoFrame) -> Result<ReceiveStatus> {
        Err(PlayerError::DecodeError("不是视频解码器".to_string()))
    }

    /// 取出一帧音频
    fn receive_audio(&mut self, _frame: &mut AudioFrame) -> Result<ReceiveStatus> {
        Err(PlayerError::DecodeError("不是音频解码器".to_string()))
    }

    /// 丢弃解码器内部缓存的参考帧
    fn flush_buffers(&mut self);

    fn name(&self) -> String;
}

/// 重采样器
pub trait Resampler: Send {
    /// 把一帧音频转换为输出格式的交错数据，返回输出采样数
    fn resample(&mut self, frame: &AudioFrame, out: &mut Vec<u8>) -> Result<usize>;
}

/// 像素格式转换器
pub trait FrameConverter: Send {
    /// 转换为 RGBA（单平面）
    fn convert(&mut self, src: &VideoFrame, dst: &mut VideoFrame) -> Result<()>;
}

/// codec 上下文句柄（借用而非持有）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodecHandle(usize);

impl CodecHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// codec 上下文表
///
/// 会话持有所有 codec 上下文，解码线程只拿句柄。每个槽位一把锁，
/// 释放后再访问得到 `CodecReleased`，不会访问已释放的上下文。
pub struct CodecArena {
    slots: RwLock<Vec<Mutex<Option<Box<dyn CodecContext>>>>>,
}

impl CodecArena {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
        }
    }

    pub fn insert(&self, codec: Box<dyn CodecContext>) -> CodecHandle {
        let mut slots = self.slots.write();
        slots.push(Mutex::new(Some(codec)));
        CodecHandle(slots.len() - 1)
    }

    /// 在槽位锁内访问 codec 上下文
    pub fn with<R>(&self, handle: CodecHandle, f: impl FnOnce(&mut dyn CodecContext) -> R) -> Result<R> {
        let slots = self.slots.read();
        let slot = slots.get(handle.0).ok_or(PlayerError::CodecReleased(handle))?;
        let mut guard = slot.lock();
        match guard.as_mut() {
            Some(codec) => Ok(f(codec.as_mut())),
            None => Err(PlayerError::CodecReleased(handle)),
        }
    }

    /// 释放单个上下文（等待正在进行的调用结束）
    pub fn release(&self, handle: CodecHandle) -> bool {
        let slots = self.slots.read();
        match slots.get(handle.0) {
            Some(slot) => slot.lock().take().is_some(),
            None => false,
        }
    }

    pub fn release_all(&self) {
        let slots = self.slots.read();
        for slot in slots.iter() {
            slot.lock().take();
        }
    }

    pub fn is_live(&self, handle: CodecHandle) -> bool {
        let slots = self.slots.read();
        slots.get(handle.0).map(|s| s.lock().is_some()).unwrap_or(false)
    }

    pub fn live_count(&self) -> usize {
        self.slots.read().iter().filter(|s| s.lock().is_some()).count()
    }
}

impl Default for CodecArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingCodec {
        flushed: usize,
    }

    impl CodecContext for CountingCodec {
        fn send_packet(&mut self, _packet: &Packet) -> Result<SendStatus> {
            Ok(SendStatus::Accepted)
        }

        fn flush_buffers(&mut self) {
            self.flushed += 1;
        }

        fn name(&self) -> String {
            "counting".to_string()
        }
    }

    #[test]
    fn test_arena_release_blocks_further_access() {
        let arena = CodecArena::new();
        let handle = arena.insert(Box::new(CountingCodec { flushed: 0 }));
        assert!(arena.with(handle, |c| c.flush_buffers()).is_ok());
        assert_eq!(arena.live_count(), 1);

        assert!(arena.release(handle));
        assert!(!arena.release(handle));
        assert!(!arena.is_live(handle));
        assert!(matches!(
            arena.with(handle, |c| c.flush_buffers()),
            Err(PlayerError::CodecReleased(h)) if h == handle
        ));
    }

    #[test]
    fn test_arena_release_all() {
        let arena = CodecArena::new();
        let a = arena.insert(Box::new(CountingCodec { flushed: 0 }));
        let b = arena.insert(Box::new(CountingCodec { flushed: 0 }));
        assert_ne!(a, b);
        arena.release_all();
        assert_eq!(arena.live_count(), 0);
    }

    #[test]
    fn test_default_receive_rejects_wrong_kind() {
        let mut codec = CountingCodec { flushed: 0 };
        let mut frame = VideoFrame::default();
        assert!(codec.receive_video(&mut frame).is_err());
    }

    #[test]
    fn test_rotation_from_metadata() {
        let mut info = StreamInfo {
            index: 0,
            kind: MediaKind::Video,
            codec_name: "h264".to_string(),
            time_base: Rational::new(1, 90_000),
            frame_rate: Rational::new(30, 1),
            width: 1920,
            height: 1080,
            pixel_format: PixelFormat::YUV420P,
            sample_rate: 0,
            channels: 0,
            metadata: HashMap::new(),
        };
        assert_eq!(info.rotation(), 0);
        info.metadata.insert("rotate".to_string(), "90".to_string());
        assert_eq!(info.rotation(), 90);
    }

    #[test]
    fn test_video_frame_reset_keeps_capacity() {
        let mut frame = VideoFrame::default();
        frame.fill_plane(0, &[1u8; 64], 8);
        let cap = frame.planes[0].capacity();
        frame.reset();
        assert!(frame.planes[0].is_empty());
        assert_eq!(frame.planes[0].capacity(), cap);
    }
}
