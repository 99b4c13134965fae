use crate::core::{log_ctx, AudioParams, MediaKind, PlayerConfig, Result, SessionState};
use crate::player::codec::{
    AudioFrame, CodecArena, CodecEngine, CodecHandle, Packet, ReceiveStatus, Resampler, SendStatus, StreamInfo,
    VideoFrame,
};
use crate::player::events::PlayerListener;
use crate::player::frame_queue::FrameQueue;
use crate::player::packet_queue::PacketQueue;
use crate::player::render::AudioSink;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// 解码线程与同步线程共用的会话资源
#[derive(Clone)]
pub struct PipelineShared {
    pub arena: Arc<CodecArena>,
    pub state: Arc<SessionState>,
    pub config: Arc<PlayerConfig>,
    pub engine: Arc<dyn CodecEngine>,
    pub listener: Arc<dyn PlayerListener>,
}

/// 解码器公共部分（持有者与解码线程共享）
///
/// codec 上下文只以句柄形式借用，由会话负责释放。
pub struct DecoderCore {
    stream: StreamInfo,
    handle: CodecHandle,
    queue: Arc<PacketQueue>,
    shared: PipelineShared,
    abort: AtomicBool,
    /// (序号, 毫秒)：该序号下早于目标时间的帧直接丢弃
    seek_floor: Mutex<Option<(u64, i64)>>,
}

impl DecoderCore {
    fn new(stream: StreamInfo, handle: CodecHandle, shared: PipelineShared) -> Self {
        Self {
            stream,
            handle,
            queue: Arc::new(PacketQueue::new()),
            shared,
            abort: AtomicBool::new(false),
            seek_floor: Mutex::new(None),
        }
    }

    pub fn stream(&self) -> &StreamInfo {
        &self.stream
    }

    pub fn handle(&self) -> CodecHandle {
        self.handle
    }

    pub fn queue(&self) -> &Arc<PacketQueue> {
        &self.queue
    }

    fn should_exit(&self) -> bool {
        self.abort.load(Ordering::SeqCst) || self.shared.state.is_aborted() || self.queue.is_aborted()
    }

    fn is_current(&self, serial: u64) -> bool {
        serial == self.queue.serial()
    }

    fn pts_to_ms(&self, pts: Option<i64>) -> Option<i64> {
        pts.map(|p| self.stream.time_base.to_millis(p))
    }

    /// 精确 seek：同一序号下第一帧到达目标之前的帧全部丢弃
    fn passes_seek_floor(&self, serial: u64, pts_ms: i64) -> bool {
        let mut floor = self.seek_floor.lock();
        match *floor {
            Some((floor_serial, floor_ms)) if floor_serial == serial => {
                if pts_ms < floor_ms {
                    return false;
                }
                *floor = None;
                true
            }
            _ => true,
        }
    }

    /// 清空数据包队列并重置 codec 内部状态，返回新的序号
    fn flush_codec(&self, seek_floor_ms: Option<i64>) -> u64 {
        let serial = self.queue.flush();
        *self.seek_floor.lock() = match seek_floor_ms {
            Some(ms) if self.shared.config.accurate_seek => Some((serial, ms)),
            _ => None,
        };
        if let Err(e) = self.shared.arena.with(self.handle, |codec| codec.flush_buffers()) {
            warn!("{} ⚠️  flush codec 失败: {}", log_ctx(), e);
        }
        serial
    }
}

/// 单帧输出结果
enum Drain {
    /// 取到一帧（或丢弃了一帧），继续取
    More,
    /// 解码器需要新的输入
    Done,
    /// 线程退出
    Exit,
}

/// 音频 / 视频各自的帧处理
trait FrameWorker: Send + 'static {
    fn on_start(&mut self, _core: &DecoderCore) {}

    /// 取出一帧并交给下游
    fn drain_one(&mut self, core: &DecoderCore, serial: u64) -> Drain;

    /// 序号变化（seek 之后），时间戳累加器失效
    fn reset_timeline(&mut self);

    fn on_exit(&mut self, _core: &DecoderCore) {}
}

/// 解码循环：取包 → 送包 → 取帧
fn decode_loop<W: FrameWorker>(core: Arc<DecoderCore>, mut worker: W) {
    let kind = kind_label(core.stream.kind);
    info!(
        "{} 🎬 {} 解码线程启动 (stream #{}, codec: {})",
        log_ctx(),
        kind,
        core.stream.index,
        core.stream.codec_name
    );
    let state = core.shared.state.clone();
    state.bind_current_thread();
    worker.on_start(&core);

    let poll = core.shared.config.poll_interval();
    let mut pending: Option<Packet> = None;
    let mut last_serial: Option<u64> = None;
    let mut packet_count: u64 = 0;

    'decode: while !core.should_exit() {
        // seek 挂起期间不处理任何数据
        if state.seek_pending() {
            pending = None;
            if !state.wait_seek_cleared(poll) {
                break;
            }
            continue;
        }
        if state.is_paused() {
            if !state.wait_while_paused(poll) {
                break;
            }
            continue;
        }

        let packet = match pending.take() {
            Some(packet) => packet,
            None => match core.queue.pop_timeout(poll) {
                Some(packet) => packet,
                None => continue,
            },
        };
        let serial = packet.serial;
        if !core.is_current(serial) {
            continue;
        }
        if last_serial != Some(serial) {
            worker.reset_timeline();
            last_serial = Some(serial);
        }

        // 序号检查与送包在同一把 codec 锁内，flush 不会插在两者之间
        let sent = core.shared.arena.with(core.handle, |codec| {
            if !core.is_current(serial) {
                return Ok(None);
            }
            codec.send_packet(&packet).map(Some)
        });
        let mut retry = false;
        match sent {
            Err(e) => {
                error!("{} ❌ {} 解码线程无法访问 codec: {}", log_ctx(), kind, e);
                break;
            }
            Ok(Err(e)) => {
                warn!("{} ⚠️  {} 解码错误（已跳过）: {}", log_ctx(), kind, e);
                continue;
            }
            Ok(Ok(None)) => continue,
            Ok(Ok(Some(SendStatus::TryAgain))) => {
                pending = Some(packet);
                retry = true;
            }
            Ok(Ok(Some(SendStatus::Accepted))) => {
                packet_count += 1;
            }
        }

        loop {
            match worker.drain_one(&core, serial) {
                Drain::More => {}
                Drain::Done => break,
                Drain::Exit => break 'decode,
            }
        }
        if retry {
            thread::yield_now();
        }
    }

    worker.on_exit(&core);
    info!(
        "{} ✅ {} 解码线程退出 (stream #{}, 已送包 {})",
        log_ctx(),
        kind,
        core.stream.index,
        packet_count
    );
}

fn spawn_decode_thread<W: FrameWorker>(core: &Arc<DecoderCore>, worker: W) -> Result<JoinHandle<()>> {
    let core = core.clone();
    let name = format!("myy-{}-dec", core.stream.kind.as_str());
    let handle = thread::Builder::new().name(name).spawn(move || decode_loop(core, worker))?;
    Ok(handle)
}

fn join_decode_thread(core: &DecoderCore, thread: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = thread.take() {
        if handle.join().is_err() {
            error!("{} ❌ {} 解码线程 panic", log_ctx(), kind_label(core.stream.kind));
        }
    }
}

/// 流解码器
pub trait StreamDecoder {
    fn core(&self) -> &DecoderCore;

    /// 启动解码线程（已启动则只重置中止标志）
    fn start(&mut self) -> Result<()>;

    /// 中止并等待解码线程退出，可重复调用
    fn stop(&mut self);

    /// seek 时清空队列并重置 codec；`seek_floor_ms` 为精确 seek 的目标
    fn flush(&self, seek_floor_ms: Option<i64>);

    /// 队列（以及帧队列）是否已经排空
    fn is_drained(&self) -> bool;

    fn stream(&self) -> &StreamInfo {
        self.core().stream()
    }

    fn queue(&self) -> &Arc<PacketQueue> {
        self.core().queue()
    }
}

// ==================== 音频 ====================

struct AudioWorker {
    sink: Arc<dyn AudioSink>,
    engine: Arc<dyn CodecEngine>,
    listener: Arc<dyn PlayerListener>,
    output: AudioParams,
    resampler: Option<Box<dyn Resampler>>,
    resampler_input: Option<AudioParams>,
    scratch: AudioFrame,
    out_buf: Vec<u8>,
    next_pts_ms: Option<i64>,
    sink_ready: bool,
    rendered: u64,
}

impl AudioWorker {
    fn ensure_resampler(&mut self) -> Result<()> {
        let input = self.scratch.params();
        if self.resampler.is_none() || self.resampler_input != Some(input) {
            debug!(
                "🔧 初始化音频重采样器: {}Hz/{}ch/{:?} → {}Hz/{}ch/{:?}",
                input.sample_rate,
                input.channels,
                input.format,
                self.output.sample_rate,
                self.output.channels,
                self.output.format
            );
            self.resampler = Some(self.engine.create_resampler(&input, &self.output)?);
            self.resampler_input = Some(input);
        }
        Ok(())
    }
}

impl FrameWorker for AudioWorker {
    fn on_start(&mut self, _core: &DecoderCore) {
        match self.sink.init(&self.output) {
            Ok(()) => self.sink_ready = true,
            Err(e) => {
                error!("{} ❌ 音频输出初始化失败，按帧时长静音播放: {}", log_ctx(), e);
                self.sink_ready = false;
            }
        }
    }

    fn drain_one(&mut self, core: &DecoderCore, serial: u64) -> Drain {
        let scratch = &mut self.scratch;
        let status = match core.shared.arena.with(core.handle, |codec| codec.receive_audio(scratch)) {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!("{} ⚠️  音频取帧失败: {}", log_ctx(), e);
                return Drain::Done;
            }
            Err(_) => return Drain::Exit,
        };
        if status != ReceiveStatus::Frame {
            return Drain::Done;
        }
        if !core.is_current(serial) {
            return Drain::More;
        }

        let pts_ms = core.pts_to_ms(self.scratch.pts).or(self.next_pts_ms);
        self.next_pts_ms = pts_ms.map(|p| p + self.scratch.duration_ms());
        if let Some(p) = pts_ms {
            if !core.passes_seek_floor(serial, p) {
                return Drain::More;
            }
        }

        // 暂停在解码之后、更新时钟之前生效
        let state = &core.shared.state;
        if !state.wait_while_paused(core.shared.config.poll_interval()) {
            return Drain::Exit;
        }

        if let Err(e) = self.ensure_resampler() {
            warn!("{} ⚠️  创建重采样器失败（丢弃该帧）: {}", log_ctx(), e);
            return Drain::More;
        }
        let resampled = match self.resampler.as_mut() {
            Some(resampler) => resampler.resample(&self.scratch, &mut self.out_buf),
            None => return Drain::More,
        };
        if let Err(e) = resampled {
            warn!("{} ⚠️  重采样失败（丢弃该帧）: {}", log_ctx(), e);
            return Drain::More;
        }

        let sink = &self.sink;
        let out_buf = &self.out_buf;
        let sink_ready = self.sink_ready;
        let delivered = core.shared.arena.with(core.handle, |_codec| {
            if !core.is_current(serial) {
                return false;
            }
            if let Some(p) = pts_ms {
                state.set_current_timestamp_ms(p);
            }
            if sink_ready {
                if let Err(e) = sink.render_frame(out_buf) {
                    warn!("{} ⚠️  音频输出失败: {}", log_ctx(), e);
                }
            }
            true
        });

        match delivered {
            Err(_) => Drain::Exit,
            Ok(false) => Drain::More,
            Ok(true) => {
                self.rendered += 1;
                if !self.sink_ready {
                    thread::sleep(Duration::from_millis(self.scratch.duration_ms().max(0) as u64));
                }
                if let Some(p) = pts_ms {
                    self.listener.on_update_time(p as f64 / 1000.0);
                }
                Drain::More
            }
        }
    }

    fn reset_timeline(&mut self) {
        self.next_pts_ms = None;
    }

    fn on_exit(&mut self, _core: &DecoderCore) {
        self.resampler = None;
        self.sink.uninit();
        info!("{} 🔊 音频输出已释放 (已播放 {} 帧)", log_ctx(), self.rendered);
    }
}

/// 音频流解码器 - 解码后直接重采样并写入音频输出
pub struct AudioStreamDecoder {
    core: Arc<DecoderCore>,
    sink: Arc<dyn AudioSink>,
    thread: Option<JoinHandle<()>>,
}

impl AudioStreamDecoder {
    pub fn new(stream: StreamInfo, handle: CodecHandle, shared: PipelineShared, sink: Arc<dyn AudioSink>) -> Self {
        Self {
            core: Arc::new(DecoderCore::new(stream, handle, shared)),
            sink,
            thread: None,
        }
    }
}

impl StreamDecoder for AudioStreamDecoder {
    fn core(&self) -> &DecoderCore {
        &self.core
    }

    fn start(&mut self) -> Result<()> {
        self.core.abort.store(false, Ordering::SeqCst);
        self.core.queue.start();
        if self.thread.is_none() {
            let shared = &self.core.shared;
            let worker = AudioWorker {
                sink: self.sink.clone(),
                engine: shared.engine.clone(),
                listener: shared.listener.clone(),
                output: shared.config.audio_output,
                resampler: None,
                resampler_input: None,
                scratch: AudioFrame::default(),
                out_buf: Vec::new(),
                next_pts_ms: None,
                sink_ready: false,
                rendered: 0,
            };
            self.thread = Some(spawn_decode_thread(&self.core, worker)?);
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.core.abort.store(true, Ordering::SeqCst);
        self.core.queue.abort();
        join_decode_thread(&self.core, &mut self.thread);
    }

    fn flush(&self, seek_floor_ms: Option<i64>) {
        self.core.flush_codec(seek_floor_ms);
        self.sink.clear_cache();
    }

    fn is_drained(&self) -> bool {
        self.core.queue.is_empty()
    }
}

impl Drop for AudioStreamDecoder {
    fn drop(&mut self) {
        self.stop();
    }
}

// ==================== 视频 ====================

struct VideoWorker {
    ring: Arc<FrameQueue>,
    scratch: VideoFrame,
    next_pts_ms: Option<i64>,
    /// 由帧率推出的单帧时长，帧本身没有时长时使用
    frame_duration_ms: i64,
    published: u64,
    discarded: u64,
}

impl FrameWorker for VideoWorker {
    fn drain_one(&mut self, core: &DecoderCore, serial: u64) -> Drain {
        let scratch = &mut self.scratch;
        let status = match core.shared.arena.with(core.handle, |codec| codec.receive_video(scratch)) {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!("{} ⚠️  视频取帧失败: {}", log_ctx(), e);
                return Drain::Done;
            }
            Err(_) => return Drain::Exit,
        };
        if status != ReceiveStatus::Frame {
            return Drain::Done;
        }
        if !core.is_current(serial) {
            return Drain::More;
        }

        let duration_ms = if self.scratch.duration > 0 {
            core.stream.time_base.to_millis(self.scratch.duration)
        } else {
            self.frame_duration_ms
        };
        let pts_ms = core.pts_to_ms(self.scratch.pts).or(self.next_pts_ms);
        self.next_pts_ms = pts_ms.map(|p| p + duration_ms);
        if let Some(p) = pts_ms {
            if !core.passes_seek_floor(serial, p) {
                self.discarded += 1;
                return Drain::More;
            }
        }

        let Some(mut slot) = self.ring.acquire_writable() else {
            return Drain::Exit;
        };
        // 交换缓冲区：槽位拿走新帧，旧缓冲区留给下一次取帧复用
        std::mem::swap(&mut slot.frame, &mut self.scratch);
        slot.pts_ms = pts_ms;
        slot.duration_ms = duration_ms;
        slot.serial = serial;
        slot.rendered = false;
        if slot.publish() {
            self.published += 1;
        } else {
            debug!("丢弃 flush 之前解码出的视频帧 (pts: {:?})", pts_ms);
        }
        Drain::More
    }

    fn reset_timeline(&mut self) {
        self.next_pts_ms = None;
    }

    fn on_exit(&mut self, _core: &DecoderCore) {
        info!(
            "{} 🎞️  视频帧统计: 入队 {}, 精确 seek 丢弃 {}",
            log_ctx(),
            self.published,
            self.discarded
        );
    }
}

/// 视频流解码器 - 解码后写入视频帧队列，由同步线程消费
pub struct VideoStreamDecoder {
    core: Arc<DecoderCore>,
    ring: Arc<FrameQueue>,
    rotation: i32,
    thread: Option<JoinHandle<()>>,
}

impl VideoStreamDecoder {
    pub fn new(stream: StreamInfo, handle: CodecHandle, shared: PipelineShared) -> Self {
        let rotation = stream.rotation();
        let ring = Arc::new(FrameQueue::new(shared.config.frame_capacity()));
        debug!(
            "视频解码器: {}x{}, {:?}, 旋转 {}°, 帧队列容量 {}",
            stream.width,
            stream.height,
            stream.pixel_format,
            rotation,
            ring.capacity()
        );
        Self {
            core: Arc::new(DecoderCore::new(stream, handle, shared)),
            ring,
            rotation,
            thread: None,
        }
    }

    pub fn frame_queue(&self) -> &Arc<FrameQueue> {
        &self.ring
    }

    /// 旋转角度（度）
    pub fn rotate_angle(&self) -> i32 {
        self.rotation
    }
}

impl StreamDecoder for VideoStreamDecoder {
    fn core(&self) -> &DecoderCore {
        &self.core
    }

    fn start(&mut self) -> Result<()> {
        self.core.abort.store(false, Ordering::SeqCst);
        self.core.queue.start();
        self.ring.start();
        if self.thread.is_none() {
            let worker = VideoWorker {
                ring: self.ring.clone(),
                scratch: VideoFrame::default(),
                next_pts_ms: None,
                frame_duration_ms: self.core.stream.frame_rate.frame_duration_ms(),
                published: 0,
                discarded: 0,
            };
            self.thread = Some(spawn_decode_thread(&self.core, worker)?);
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.core.abort.store(true, Ordering::SeqCst);
        self.core.queue.abort();
        self.ring.abort();
        join_decode_thread(&self.core, &mut self.thread);
    }

    fn flush(&self, seek_floor_ms: Option<i64>) {
        let serial = self.core.flush_codec(seek_floor_ms);
        self.ring.flush_to(serial);
    }

    fn is_drained(&self) -> bool {
        self.core.queue.is_empty() && self.ring.is_empty()
    }
}

impl Drop for VideoStreamDecoder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn kind_label(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => "音频",
        MediaKind::Video => "视频",
        _ => "其他",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PixelFormat, Rational};
    use crate::player::codec::{DemuxContext, FrameConverter};
    use crate::player::events::NoopListener;
    use std::collections::HashMap;

    struct NoEngine;

    impl CodecEngine for NoEngine {
        fn open_input(&self, url: &str) -> Result<Box<dyn DemuxContext>> {
            Err(crate::core::PlayerError::OpenError(url.to_string()))
        }

        fn create_resampler(&self, _i: &AudioParams, _o: &AudioParams) -> Result<Box<dyn Resampler>> {
            Err(crate::core::PlayerError::AudioError("unused".to_string()))
        }

        fn create_converter(
            &self,
            _sw: u32,
            _sh: u32,
            _sf: PixelFormat,
            _dw: u32,
            _dh: u32,
        ) -> Result<Box<dyn FrameConverter>> {
            Err(crate::core::PlayerError::RenderError("unused".to_string()))
        }

        fn name(&self) -> &str {
            "none"
        }
    }

    struct IdleCodec;

    impl crate::player::codec::CodecContext for IdleCodec {
        fn send_packet(&mut self, _packet: &Packet) -> Result<SendStatus> {
            Ok(SendStatus::Accepted)
        }

        fn flush_buffers(&mut self) {}

        fn name(&self) -> String {
            "idle".to_string()
        }
    }

    fn core(accurate_seek: bool) -> DecoderCore {
        let config = PlayerConfig {
            accurate_seek,
            ..Default::default()
        };
        let arena = Arc::new(CodecArena::new());
        let handle = arena.insert(Box::new(IdleCodec));
        let shared = PipelineShared {
            arena,
            state: Arc::new(SessionState::new(&config)),
            config: Arc::new(config),
            engine: Arc::new(NoEngine),
            listener: Arc::new(NoopListener),
        };
        let stream = StreamInfo {
            index: 0,
            kind: MediaKind::Video,
            codec_name: "test".to_string(),
            time_base: Rational::new(1, 1000),
            frame_rate: Rational::new(25, 1),
            width: 16,
            height: 16,
            pixel_format: PixelFormat::YUV420P,
            sample_rate: 0,
            channels: 0,
            metadata: HashMap::new(),
        };
        DecoderCore::new(stream, handle, shared)
    }

    #[test]
    fn test_seek_floor_drops_until_target() {
        let core = core(true);
        let serial = core.flush_codec(Some(5000));
        assert!(!core.passes_seek_floor(serial, 4000));
        assert!(!core.passes_seek_floor(serial, 4960));
        assert!(core.passes_seek_floor(serial, 5000));
        // 到达目标之后不再过滤
        assert!(core.passes_seek_floor(serial, 4990));
    }

    #[test]
    fn test_seek_floor_ignores_other_serials() {
        let core = core(true);
        let serial = core.flush_codec(Some(5000));
        assert!(core.passes_seek_floor(serial - 1, 100));
        assert!(!core.passes_seek_floor(serial, 100));
    }

    #[test]
    fn test_seek_floor_disabled() {
        let core = core(false);
        let serial = core.flush_codec(Some(5000));
        assert!(core.passes_seek_floor(serial, 0));
    }

    #[test]
    fn test_flush_invalidates_queued_packets() {
        let core = core(true);
        core.queue.start();
        core.queue.push(Packet::default());
        let before = core.queue.serial();
        let after = core.flush_codec(None);
        assert_eq!(after, before + 1);
        assert!(core.queue.is_empty());
        assert!(!core.is_current(before));
    }

    #[test]
    fn test_kind_label() {
        assert_eq!(kind_label(MediaKind::Audio), "音频");
    }
}
