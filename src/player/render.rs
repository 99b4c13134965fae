use crate::core::{AudioParams, PixelFormat, Result};
use crate::player::codec::VideoFrame;
use std::sync::Arc;

/// 交给视频输出的图像格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    I420,
    NV12,
    NV21,
    RGBA,
}

/// 视频输出类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderKind {
    /// 原生窗口：总是转换为 RGBA 并缩放到协商尺寸
    NativeWindow,
    OpenGl,
    Vr,
}

/// 交给视频输出的图像描述（借用帧队列槽位里的数据）
#[derive(Debug, Clone, Copy)]
pub struct NativeImage<'a> {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub planes: [&'a [u8]; 3],
    pub strides: [usize; 3],
    pub pts_ms: Option<i64>,
}

impl<'a> NativeImage<'a> {
    /// 把解码帧映射为图像描述；不支持的格式返回 None，需要先转换为 RGBA
    pub fn from_frame(frame: &'a VideoFrame, pts_ms: Option<i64>) -> Option<Self> {
        let format = match frame.format {
            PixelFormat::YUV420P | PixelFormat::YUVJ420P => {
                // 某些硬件解码器交出的 NV12 被标成 YUV420P：第三个平面为空且前两个平面跨度相同
                if frame.planes[2].is_empty() && frame.strides[2] == 0 && frame.strides[0] == frame.strides[1] {
                    ImageFormat::NV12
                } else {
                    ImageFormat::I420
                }
            }
            PixelFormat::NV12 => ImageFormat::NV12,
            PixelFormat::NV21 => ImageFormat::NV21,
            PixelFormat::RGBA => ImageFormat::RGBA,
            _ => return None,
        };
        Some(Self {
            format,
            width: frame.width,
            height: frame.height,
            planes: [
                frame.planes[0].as_slice(),
                frame.planes[1].as_slice(),
                frame.planes[2].as_slice(),
            ],
            strides: frame.strides,
            pts_ms,
        })
    }
}

/// 视频输出
///
/// 由同步线程独占，所有调用都发生在该线程上。
pub trait VideoSink: Send {
    /// 返回协商后的输出尺寸
    fn init(&mut self, src_width: u32, src_height: u32) -> Result<(u32, u32)>;

    fn render_frame(&mut self, image: &NativeImage<'_>) -> Result<()>;

    fn render_kind(&self) -> RenderKind;

    fn uninit(&mut self);
}

/// 音频输出
///
/// 音频解码线程写入，会话线程在 seek 时清空缓存，所以使用 `&self`。
pub trait AudioSink: Send + Sync {
    fn init(&self, params: &AudioParams) -> Result<()>;

    /// 写入一段交错 PCM；缓冲区满时可以阻塞，以此控制解码节奏
    fn render_frame(&self, data: &[u8]) -> Result<()>;

    /// 立即丢弃已缓冲的音频
    fn clear_cache(&self);

    fn uninit(&self);
}

/// 会话使用的输出组合
pub struct RenderBackend {
    pub video: Box<dyn VideoSink>,
    pub audio: Arc<dyn AudioSink>,
}

impl RenderBackend {
    pub fn new(video: Box<dyn VideoSink>, audio: Arc<dyn AudioSink>) -> Self {
        Self { video, audio }
    }

    /// 不输出任何内容（基准测试 / 无界面运行）
    pub fn null() -> Self {
        Self {
            video: Box::new(NullVideoSink::default()),
            audio: Arc::new(NullAudioSink),
        }
    }
}

/// 丢弃所有帧的视频输出
#[derive(Debug, Default)]
pub struct NullVideoSink {
    pub frames: u64,
}

impl VideoSink for NullVideoSink {
    fn init(&mut self, src_width: u32, src_height: u32) -> Result<(u32, u32)> {
        Ok((src_width, src_height))
    }

    fn render_frame(&mut self, _image: &NativeImage<'_>) -> Result<()> {
        self.frames += 1;
        Ok(())
    }

    fn render_kind(&self) -> RenderKind {
        RenderKind::OpenGl
    }

    fn uninit(&mut self) {}
}

/// 丢弃所有数据的音频输出
#[derive(Debug, Default)]
pub struct NullAudioSink;

impl AudioSink for NullAudioSink {
    fn init(&self, _params: &AudioParams) -> Result<()> {
        Ok(())
    }

    fn render_frame(&self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn clear_cache(&self) {}

    fn uninit(&self) {}
}
