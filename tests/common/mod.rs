//! 测试用的内存编解码引擎
//!
//! 合成 44.1kHz 立体声音频（每包 1024 采样）和 30fps 的 16x16 YUV420P 视频，
//! 时间戳直接写在包里；可以注入打开 / 探测 / 解码器 / 读包 / seek 失败。

#![allow(dead_code)]

use crossbeam_channel::Receiver;
use myy_engine::core::{AudioParams, MediaKind, PixelFormat, PlayerError, Rational, Result, SampleFormat};
use myy_engine::player::{
    AudioFrame, AudioSink, CodecContext, CodecEngine, DemuxContext, FrameConverter, NativeImage, Packet,
    PlayerEvent, ReadOutcome, ReceiveStatus, RenderKind, Resampler, SendStatus, StreamInfo, VideoFrame, VideoSink,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const SAMPLE_RATE: u32 = 44_100;
pub const SAMPLES_PER_PACKET: i64 = 1024;
pub const FRAME_MS: i64 = 33;
pub const KEYFRAME_INTERVAL: i64 = 10;
pub const AUDIO_INDEX: usize = 0;
pub const VIDEO_INDEX: usize = 1;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 合成媒体描述
#[derive(Debug, Clone)]
pub struct MockMedia {
    pub duration_ms: i64,
    pub has_audio: bool,
    pub has_video: bool,
    pub known_duration: bool,
    pub rotate: Option<i32>,
    /// 容器起始时间（毫秒），所有时间戳都带上这个偏移
    pub start_ms: i64,
}

impl MockMedia {
    pub fn av(duration_ms: i64) -> Self {
        Self {
            duration_ms,
            has_audio: true,
            has_video: true,
            known_duration: true,
            rotate: None,
            start_ms: 0,
        }
    }

    pub fn with_start(self, start_ms: i64) -> Self {
        Self { start_ms, ..self }
    }

    pub fn video_only(duration_ms: i64) -> Self {
        Self {
            has_audio: false,
            ..Self::av(duration_ms)
        }
    }

    pub fn audio_only(duration_ms: i64) -> Self {
        Self {
            has_video: false,
            ..Self::av(duration_ms)
        }
    }
}

/// 故障注入
#[derive(Debug, Clone, Default)]
pub struct Failures {
    pub open: bool,
    pub probe: bool,
    pub audio_decoder: bool,
    pub video_decoder: bool,
    /// 读到第 N 个包之后返回读错误
    pub read_after: Option<u64>,
    pub seek: bool,
    /// 每隔 N 次读取返回一次 Retry
    pub retry_every: Option<u64>,
}

/// 引擎内部计数
#[derive(Default)]
pub struct MockStats {
    pub codecs_opened: AtomicUsize,
    pub codecs_dropped: AtomicUsize,
    pub codec_flushes: AtomicUsize,
    pub packets_read: AtomicU64,
    pub seeks: Mutex<Vec<i64>>,
    pub demux_closed: AtomicBool,
}

impl MockStats {
    pub fn seek_count(&self) -> usize {
        self.seeks.lock().len()
    }

    pub fn live_codecs(&self) -> usize {
        self.codecs_opened.load(Ordering::SeqCst) - self.codecs_dropped.load(Ordering::SeqCst)
    }
}

pub struct MockEngine {
    pub media: MockMedia,
    pub failures: Failures,
    pub stats: Arc<MockStats>,
}

impl MockEngine {
    pub fn new(media: MockMedia) -> Self {
        Self::with_failures(media, Failures::default())
    }

    pub fn with_failures(media: MockMedia, failures: Failures) -> Self {
        Self {
            media,
            failures,
            stats: Arc::new(MockStats::default()),
        }
    }
}

impl CodecEngine for MockEngine {
    fn open_input(&self, url: &str) -> Result<Box<dyn DemuxContext>> {
        if self.failures.open {
            return Err(PlayerError::OpenError(format!("mock: cannot open {}", url)));
        }
        Ok(Box::new(MockDemux {
            url: url.to_string(),
            media: self.media.clone(),
            failures: self.failures.clone(),
            stats: self.stats.clone(),
            audio_index: 0,
            video_index: 0,
            reads: 0,
        }))
    }

    fn create_resampler(&self, _input: &AudioParams, output: &AudioParams) -> Result<Box<dyn Resampler>> {
        Ok(Box::new(MockResampler { output: *output }))
    }

    fn create_converter(
        &self,
        _src_width: u32,
        _src_height: u32,
        _src_format: PixelFormat,
        dst_width: u32,
        dst_height: u32,
    ) -> Result<Box<dyn FrameConverter>> {
        Ok(Box::new(MockConverter {
            width: dst_width,
            height: dst_height,
        }))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

pub fn audio_packet_ms(index: i64) -> i64 {
    index * SAMPLES_PER_PACKET * 1000 / SAMPLE_RATE as i64
}

struct MockDemux {
    url: String,
    media: MockMedia,
    failures: Failures,
    stats: Arc<MockStats>,
    audio_index: i64,
    video_index: i64,
    reads: u64,
}

impl MockDemux {
    fn next_audio_ms(&self) -> Option<i64> {
        let ms = audio_packet_ms(self.audio_index);
        (self.media.has_audio && ms < self.media.duration_ms).then_some(ms)
    }

    fn next_video_ms(&self) -> Option<i64> {
        let ms = self.video_index * FRAME_MS;
        (self.media.has_video && ms < self.media.duration_ms).then_some(ms)
    }

    fn audio_packet(&mut self) -> Packet {
        let pts = self.audio_index * SAMPLES_PER_PACKET + self.media.start_ms * SAMPLE_RATE as i64 / 1000;
        self.audio_index += 1;
        Packet {
            stream_index: AUDIO_INDEX,
            pts: Some(pts),
            dts: Some(pts),
            duration: SAMPLES_PER_PACKET,
            is_key: true,
            data: vec![0u8; 32],
            serial: 0,
        }
    }

    fn video_packet(&mut self) -> Packet {
        let pts = self.video_index * FRAME_MS + self.media.start_ms;
        let is_key = self.video_index % KEYFRAME_INTERVAL == 0;
        self.video_index += 1;
        Packet {
            stream_index: VIDEO_INDEX,
            pts: Some(pts),
            dts: Some(pts),
            duration: FRAME_MS,
            is_key,
            data: vec![0u8; 64],
            serial: 0,
        }
    }
}

impl DemuxContext for MockDemux {
    fn find_stream_info(&mut self) -> Result<()> {
        if self.failures.probe {
            return Err(PlayerError::StreamInfoError("mock: probe failed".to_string()));
        }
        Ok(())
    }

    fn streams(&self) -> Vec<StreamInfo> {
        let mut streams = Vec::new();
        if self.media.has_audio {
            streams.push(StreamInfo {
                index: AUDIO_INDEX,
                kind: MediaKind::Audio,
                codec_name: "mock-aac".to_string(),
                time_base: Rational::new(1, SAMPLE_RATE as i32),
                frame_rate: Rational::new(0, 1),
                width: 0,
                height: 0,
                pixel_format: PixelFormat::Unknown,
                sample_rate: SAMPLE_RATE,
                channels: 2,
                metadata: HashMap::new(),
            });
        }
        if self.media.has_video {
            let mut metadata = HashMap::new();
            if let Some(rotate) = self.media.rotate {
                metadata.insert("rotate".to_string(), rotate.to_string());
            }
            streams.push(StreamInfo {
                index: VIDEO_INDEX,
                kind: MediaKind::Video,
                codec_name: "mock-h264".to_string(),
                time_base: Rational::new(1, 1000),
                frame_rate: Rational::new(30, 1),
                width: 16,
                height: 16,
                pixel_format: PixelFormat::YUV420P,
                sample_rate: 0,
                channels: 0,
                metadata,
            });
        }
        streams
    }

    fn duration_us(&self) -> Option<i64> {
        self.media.known_duration.then_some(self.media.duration_ms * 1000)
    }

    fn start_time_us(&self) -> Option<i64> {
        Some(self.media.start_ms * 1000)
    }

    fn open_decoder(&mut self, stream_index: usize) -> Result<Box<dyn CodecContext>> {
        let kind = if stream_index == AUDIO_INDEX {
            MediaKind::Audio
        } else {
            MediaKind::Video
        };
        let fail = match kind {
            MediaKind::Audio => self.failures.audio_decoder,
            _ => self.failures.video_decoder,
        };
        if fail {
            return Err(PlayerError::DecodeError(format!("mock: no decoder for #{}", stream_index)));
        }
        self.stats.codecs_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockCodec {
            kind,
            pending: VecDeque::new(),
            stats: self.stats.clone(),
        }))
    }

    fn read_packet(&mut self) -> Result<ReadOutcome> {
        self.reads += 1;
        if let Some(every) = self.failures.retry_every {
            if self.reads % every == 0 {
                return Ok(ReadOutcome::Retry);
            }
        }
        let read = self.stats.packets_read.load(Ordering::SeqCst);
        if let Some(limit) = self.failures.read_after {
            if read >= limit {
                return Err(PlayerError::ReadError("mock: connection reset".to_string()));
            }
        }
        let packet = match (self.next_audio_ms(), self.next_video_ms()) {
            (Some(a), Some(v)) if a <= v => self.audio_packet(),
            (Some(_), Some(_)) => self.video_packet(),
            (Some(_), None) => self.audio_packet(),
            (None, Some(_)) => self.video_packet(),
            (None, None) => return Ok(ReadOutcome::EndOfStream),
        };
        self.stats.packets_read.fetch_add(1, Ordering::SeqCst);
        Ok(ReadOutcome::Packet(packet))
    }

    fn seek(&mut self, target_us: i64) -> Result<()> {
        if self.failures.seek {
            return Err(PlayerError::SeekError("mock: not seekable".to_string()));
        }
        self.stats.seeks.lock().push(target_us);
        let target_ms = (target_us / 1000 - self.media.start_ms).max(0);
        // 落到目标之前最近的关键帧
        let key_index = (target_ms / FRAME_MS) / KEYFRAME_INTERVAL * KEYFRAME_INTERVAL;
        let landed_ms = if self.media.has_video {
            key_index * FRAME_MS
        } else {
            target_ms
        };
        self.video_index = key_index;
        self.audio_index = landed_ms * SAMPLE_RATE as i64 / 1000 / SAMPLES_PER_PACKET;
        Ok(())
    }

    fn description(&self) -> String {
        self.url.clone()
    }
}

impl Drop for MockDemux {
    fn drop(&mut self) {
        self.stats.demux_closed.store(true, Ordering::SeqCst);
    }
}

/// 每个包解出一帧；内部最多缓存两个包，之后要求先取帧
struct MockCodec {
    kind: MediaKind,
    pending: VecDeque<Packet>,
    stats: Arc<MockStats>,
}

impl CodecContext for MockCodec {
    fn send_packet(&mut self, packet: &Packet) -> Result<SendStatus> {
        if self.pending.len() >= 2 {
            return Ok(SendStatus::TryAgain);
        }
        self.pending.push_back(packet.clone());
        Ok(SendStatus::Accepted)
    }

    fn receive_video(&mut self, frame: &mut VideoFrame) -> Result<ReceiveStatus> {
        if self.kind != MediaKind::Video {
            return Err(PlayerError::DecodeError("not video".to_string()));
        }
        let Some(packet) = self.pending.pop_front() else {
            return Ok(ReceiveStatus::NeedsInput);
        };
        frame.reset();
        frame.width = 16;
        frame.height = 16;
        frame.format = PixelFormat::YUV420P;
        frame.fill_plane(0, &[16u8; 256], 16);
        frame.fill_plane(1, &[128u8; 64], 8);
        frame.fill_plane(2, &[128u8; 64], 8);
        frame.pts = packet.pts;
        frame.duration = packet.duration;
        frame.key_frame = packet.is_key;
        Ok(ReceiveStatus::Frame)
    }

    fn receive_audio(&mut self, frame: &mut AudioFrame) -> Result<ReceiveStatus> {
        if self.kind != MediaKind::Audio {
            return Err(PlayerError::DecodeError("not audio".to_string()));
        }
        let Some(packet) = self.pending.pop_front() else {
            return Ok(ReceiveStatus::NeedsInput);
        };
        frame.pts = packet.pts;
        frame.sample_rate = SAMPLE_RATE;
        frame.channels = 2;
        frame.format = SampleFormat::S16;
        frame.nb_samples = SAMPLES_PER_PACKET as usize;
        frame.planes = vec![vec![0u8; SAMPLES_PER_PACKET as usize * 4]];
        Ok(ReceiveStatus::Frame)
    }

    fn flush_buffers(&mut self) {
        self.pending.clear();
        self.stats.codec_flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> String {
        format!("mock-{}", self.kind.as_str())
    }
}

impl Drop for MockCodec {
    fn drop(&mut self) {
        self.stats.codecs_dropped.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockResampler {
    output: AudioParams,
}

impl Resampler for MockResampler {
    fn resample(&mut self, frame: &AudioFrame, out: &mut Vec<u8>) -> Result<usize> {
        out.clear();
        out.resize(frame.nb_samples * self.output.frame_bytes(), 0);
        Ok(frame.nb_samples)
    }
}

struct MockConverter {
    width: u32,
    height: u32,
}

impl FrameConverter for MockConverter {
    fn convert(&mut self, src: &VideoFrame, dst: &mut VideoFrame) -> Result<()> {
        dst.reset();
        dst.width = self.width;
        dst.height = self.height;
        dst.format = PixelFormat::RGBA;
        let stride = self.width as usize * 4;
        dst.fill_plane(0, &vec![0u8; stride * self.height as usize], stride);
        dst.pts = src.pts;
        Ok(())
    }
}

/// 记录每一帧渲染时间戳的视频输出
#[derive(Clone)]
pub struct RecordingVideoSink {
    pub rendered: Arc<Mutex<Vec<Option<i64>>>>,
    pub uninit_called: Arc<AtomicBool>,
    pub kind: RenderKind,
}

impl RecordingVideoSink {
    pub fn new(kind: RenderKind) -> Self {
        Self {
            rendered: Arc::new(Mutex::new(Vec::new())),
            uninit_called: Arc::new(AtomicBool::new(false)),
            kind,
        }
    }

    pub fn count(&self) -> usize {
        self.rendered.lock().len()
    }
}

impl VideoSink for RecordingVideoSink {
    fn init(&mut self, src_width: u32, src_height: u32) -> Result<(u32, u32)> {
        Ok((src_width * 2, src_height * 2))
    }

    fn render_frame(&mut self, image: &NativeImage<'_>) -> Result<()> {
        self.rendered.lock().push(image.pts_ms);
        Ok(())
    }

    fn render_kind(&self) -> RenderKind {
        self.kind
    }

    fn uninit(&mut self) {
        self.uninit_called.store(true, Ordering::SeqCst);
    }
}

/// 按数据时长阻塞写入的音频输出（`speed` 倍速）
pub struct PacedAudioSink {
    pub speed: f64,
    pub params: Mutex<Option<AudioParams>>,
    pub frames: AtomicU64,
    pub clears: AtomicU64,
    pub uninit_called: AtomicBool,
    pub fail_init: bool,
}

impl PacedAudioSink {
    pub fn new(speed: f64) -> Arc<Self> {
        Self::build(speed, false)
    }

    /// init 总是失败的输出
    pub fn failing() -> Arc<Self> {
        Self::build(1.0, true)
    }

    fn build(speed: f64, fail_init: bool) -> Arc<Self> {
        Arc::new(Self {
            speed,
            params: Mutex::new(None),
            frames: AtomicU64::new(0),
            clears: AtomicU64::new(0),
            uninit_called: AtomicBool::new(false),
            fail_init,
        })
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }
}

impl AudioSink for PacedAudioSink {
    fn init(&self, params: &AudioParams) -> Result<()> {
        if self.fail_init {
            return Err(PlayerError::AudioError("mock: no device".to_string()));
        }
        *self.params.lock() = Some(*params);
        Ok(())
    }

    fn render_frame(&self, data: &[u8]) -> Result<()> {
        let Some(params) = *self.params.lock() else {
            return Err(PlayerError::AudioError("not initialized".to_string()));
        };
        let samples = data.len() / params.frame_bytes().max(1);
        let seconds = samples as f64 / params.sample_rate as f64 / self.speed;
        thread::sleep(Duration::from_secs_f64(seconds));
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clear_cache(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }

    fn uninit(&self) {
        self.uninit_called.store(true, Ordering::SeqCst);
    }
}

/// 轮询直到条件成立或超时
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// 收集事件直到 Done（含）或超时
pub fn collect_until_done(rx: &Receiver<PlayerEvent>, timeout: Duration) -> Vec<PlayerEvent> {
    let deadline = Instant::now() + timeout;
    let mut events = Vec::new();
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(remaining) {
            Ok(event) => {
                let done = event == PlayerEvent::Done;
                events.push(event);
                if done {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    events
}

/// 等待某个事件出现（跳过其它事件）
pub fn wait_for_event(rx: &Receiver<PlayerEvent>, timeout: Duration, pred: impl Fn(&PlayerEvent) -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(remaining) {
            Ok(event) if pred(&event) => return true,
            Ok(_) => {}
            Err(_) => return false,
        }
    }
    false
}
