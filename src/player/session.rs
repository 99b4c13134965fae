use crate::core::{
    log_ctx, BufferStatus, ClockSource, MediaInfo, MediaKind, MediaParam, PlaybackState, PlayerConfig, PlayerError,
    Result, SessionState, StateSnapshot,
};
use crate::player::codec::{CodecArena, CodecEngine, CodecHandle, DemuxContext, Packet, ReadOutcome, StreamInfo};
use crate::player::decoder::{AudioStreamDecoder, PipelineShared, StreamDecoder, VideoStreamDecoder};
use crate::player::events::PlayerListener;
use crate::player::frame_queue::FrameQueue;
use crate::player::packet_queue::PacketQueue;
use crate::player::render::RenderBackend;
use crate::player::sync::SyncScheduler;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// 前 N 个包逐个打日志，之后每 100 个打一次
const LOG_FIRST_N: u64 = 5;

/// 解封装循环的退出原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DemuxExit {
    Aborted,
    EndOfStream,
}

/// 查询接口使用的管线视图（解封装线程写入，任意线程读取）
#[derive(Default)]
struct PipelineView {
    prepared: bool,
    info: MediaInfo,
    audio_queue: Option<Arc<PacketQueue>>,
    video_queue: Option<Arc<PacketQueue>>,
    frames: Option<Arc<FrameQueue>>,
}

/// 会话持有的媒体资源
///
/// 释放顺序：同步线程 → 解码线程 → codec 上下文 → 解封装上下文。
struct MediaContext {
    demux: Option<Box<dyn DemuxContext>>,
    arena: Arc<CodecArena>,
    audio: Option<AudioStreamDecoder>,
    video: Option<VideoStreamDecoder>,
    scheduler: Option<SyncScheduler>,
}

impl MediaContext {
    fn new() -> Self {
        Self {
            demux: None,
            arena: Arc::new(CodecArena::new()),
            audio: None,
            video: None,
            scheduler: None,
        }
    }

    fn is_drained(&self) -> bool {
        self.audio.as_ref().map_or(true, |d| d.is_drained()) && self.video.as_ref().map_or(true, |d| d.is_drained())
    }

    fn flush_decoders(&self, seek_floor_ms: Option<i64>) {
        if let Some(audio) = self.audio.as_ref() {
            audio.flush(seek_floor_ms);
        }
        if let Some(video) = self.video.as_ref() {
            video.flush(seek_floor_ms);
        }
    }

    fn teardown(&mut self) {
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.stop();
            debug!("{} 同步线程已停止", log_ctx());
        }
        if let Some(mut video) = self.video.take() {
            video.stop();
            debug!("{} 视频解码器已停止", log_ctx());
        }
        if let Some(mut audio) = self.audio.take() {
            audio.stop();
            debug!("{} 音频解码器已停止", log_ctx());
        }
        self.arena.release_all();
        if let Some(demux) = self.demux.take() {
            debug!("{} 关闭解封装上下文: {}", log_ctx(), demux.description());
        }
    }
}

impl Drop for MediaContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// 播放会话
///
/// 单次使用：一次 `init`，一次 `uninit`。控制接口可以在任意线程调用。
pub struct PlaybackSession {
    engine: Arc<dyn CodecEngine>,
    config: Arc<PlayerConfig>,
    listener: Arc<dyn PlayerListener>,
    state: Arc<SessionState>,
    view: Arc<Mutex<PipelineView>>,
    lifecycle: Mutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl PlaybackSession {
    pub fn new(engine: Arc<dyn CodecEngine>, config: PlayerConfig, listener: Arc<dyn PlayerListener>) -> Self {
        info!("{} 🎮 创建播放会话 (引擎: {})", log_ctx(), engine.name());
        let state = Arc::new(SessionState::new(&config));
        Self {
            engine,
            config: Arc::new(config),
            listener,
            state,
            view: Arc::new(Mutex::new(PipelineView::default())),
            lifecycle: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    /// 打开媒体并启动播放管线
    ///
    /// 打开 / 探测 / 创建解码器都在会话线程中完成，结果通过
    /// `on_ready` 或 `on_error` + `on_done` 通知。
    pub fn init(&self, url: &str, backend: RenderBackend) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(PlayerError::InvalidState("会话只能初始化一次".to_string()));
        }
        info!("{} 🎬 初始化会话: {}", log_ctx(), url);
        self.state.set_url(url);
        self.state.set_phase(PlaybackState::Initializing);

        let worker = SessionWorker {
            engine: self.engine.clone(),
            config: self.config.clone(),
            listener: self.listener.clone(),
            state: self.state.clone(),
            view: self.view.clone(),
        };
        let url = url.to_string();
        let spawned = thread::Builder::new()
            .name("myy-session".to_string())
            .spawn(move || worker.run(&url, backend));
        match spawned {
            Ok(handle) => {
                *self.lifecycle.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!("{} ❌ 会话线程启动失败: {}", log_ctx(), e);
                self.state.set_phase(PlaybackState::Stopped);
                Err(e.into())
            }
        }
    }

    /// 停止并等待所有线程退出，可重复调用
    pub fn uninit(&self) {
        self.stop();
        if self.state.is_pipeline_thread() {
            // 在事件回调里调用：回调返回后会话线程自行完成清理，这里不能 join
            debug!("{} 管线线程内 uninit，只请求停止", log_ctx());
            return;
        }
        let mut lifecycle = self.lifecycle.lock();
        if let Some(handle) = lifecycle.take() {
            if handle.join().is_err() {
                error!("{} ❌ 会话线程 panic", log_ctx());
            }
            info!("{} ✅ 会话线程已回收", log_ctx());
        }
    }

    pub fn play(&self) {
        info!("{} ▶️  播放", log_ctx());
        self.state.request_play();
    }

    pub fn pause(&self) {
        info!("{} ⏸️  暂停", log_ctx());
        self.state.request_pause();
    }

    /// 请求停止（不等待），清理在会话线程中进行
    pub fn stop(&self) {
        if !self.state.is_aborted() {
            info!("{} ⏹️  停止", log_ctx());
        }
        self.state.request_abort();
    }

    /// 跳转到指定位置（秒，相对媒体起点）
    ///
    /// 上一次 seek 未完成时阻塞；不等待本次 seek 完成。
    pub fn seek_to(&self, position_s: f64) -> bool {
        if !position_s.is_finite() || position_s < 0.0 {
            warn!("{} ⚠️  忽略非法的 seek 位置: {}", log_ctx(), position_s);
            return false;
        }
        let Some(duration) = self.state.duration_s().filter(|d| *d > 0.0) else {
            warn!("{} ⚠️  时长未知，忽略 seek", log_ctx());
            return false;
        };
        if self.state.is_aborted() {
            return false;
        }
        let start = self.state.start_time_s().unwrap_or(0.0);
        let target_us = ((position_s + start) * 1_000_000.0) as i64;
        info!(
            "{} 🎯 Seek 到 {:.3}s / {:.3}s (目标 {}us)",
            log_ctx(),
            position_s,
            duration,
            target_us
        );
        self.state.request_seek(target_us)
    }

    /// 查询媒体参数，尚不可用时返回 0
    pub fn get_param(&self, param: MediaParam) -> f64 {
        let view = self.view.lock();
        match param {
            MediaParam::VideoWidth => view.info.width as f64,
            MediaParam::VideoHeight => view.info.height as f64,
            MediaParam::Duration => self.state.duration_s().unwrap_or(0.0),
            MediaParam::RotateAngle => view.info.rotation as f64,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state.playback_state()
    }

    /// 当前播放位置（秒）
    pub fn position_seconds(&self) -> f64 {
        self.state.master_clock_ms() as f64 / 1000.0
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.state.duration_s()
    }

    /// 媒体信息（会话就绪之前为 None）
    pub fn media_info(&self) -> Option<MediaInfo> {
        let view = self.view.lock();
        view.prepared.then(|| view.info.clone())
    }

    pub fn buffer_status(&self) -> BufferStatus {
        let view = self.view.lock();
        let audio_packets = view.audio_queue.as_ref().map_or(0, |q| q.len());
        let video_packets = view.video_queue.as_ref().map_or(0, |q| q.len());
        let queued_bytes = view.audio_queue.as_ref().map_or(0, |q| q.bytes())
            + view.video_queue.as_ref().map_or(0, |q| q.bytes());
        BufferStatus {
            video_packets,
            audio_packets,
            queued_bytes,
            video_frames: view.frames.as_ref().map_or(0, |f| f.len()),
            video_frame_capacity: view.frames.as_ref().map_or(0, |f| f.capacity()),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.state.snapshot()
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.uninit();
    }
}

/// 会话线程：准备 → 解封装循环 → 清理
struct SessionWorker {
    engine: Arc<dyn CodecEngine>,
    config: Arc<PlayerConfig>,
    listener: Arc<dyn PlayerListener>,
    state: Arc<SessionState>,
    view: Arc<Mutex<PipelineView>>,
}

impl SessionWorker {
    fn run(self, url: &str, backend: RenderBackend) {
        self.state.bind_current_thread();
        info!("{} 🎬 会话线程启动: {}", log_ctx(), url);
        let mut media = MediaContext::new();

        let result = match self.prepare(url, backend, &mut media) {
            Ok(()) => {
                self.state.set_phase(PlaybackState::Ready);
                self.listener.on_ready();
                self.state.set_phase(PlaybackState::Playing);
                self.demux_loop(&mut media)
            }
            Err(e) => Err(e),
        };

        self.state.set_phase(PlaybackState::Stopping);
        self.state.request_abort();
        media.teardown();
        {
            let mut view = self.view.lock();
            view.audio_queue = None;
            view.video_queue = None;
            view.frames = None;
        }
        self.state.set_phase(PlaybackState::Stopped);

        match result {
            Ok(DemuxExit::EndOfStream) => info!("{} 🏁 播放结束", log_ctx()),
            Ok(DemuxExit::Aborted) => info!("{} ⏹️  会话已停止", log_ctx()),
            Err(e) => {
                error!("{} ❌ 会话异常结束: {}", log_ctx(), e);
                self.listener.on_error(&e);
            }
        }
        self.listener.on_done();
        info!("{} ✅ 会话线程退出", log_ctx());
    }

    /// 打开容器、探测流、创建并启动解码器和同步线程
    fn prepare(&self, url: &str, backend: RenderBackend, media: &mut MediaContext) -> Result<()> {
        let mut demux = self.engine.open_input(url)?;
        demux.find_stream_info()?;

        let streams = demux.streams();
        let start_s = demux.start_time_us().map(|us| us as f64 / 1_000_000.0);
        let duration_s = demux.duration_us().filter(|us| *us > 0).map(|us| us as f64 / 1_000_000.0);
        self.state.set_timing(start_s, duration_s);
        info!(
            "{} 📦 {}: {} 路流, 时长 {:?}s, 起点 {:?}s",
            log_ctx(),
            demux.description(),
            streams.len(),
            duration_s,
            start_s
        );

        let audio_info = streams.iter().find(|s| s.kind == MediaKind::Audio).cloned();
        let video_info = streams.iter().find(|s| s.kind == MediaKind::Video).cloned();
        if audio_info.is_none() && video_info.is_none() {
            return Err(PlayerError::NoUsableStream);
        }

        let mut last_error = None;
        let mut open = |info: Option<StreamInfo>, demux: &mut Box<dyn DemuxContext>| -> Option<(StreamInfo, CodecHandle)> {
            let info = info?;
            match demux.open_decoder(info.index) {
                Ok(codec) => {
                    info!("{} ✓ 打开解码器: stream #{} {}", log_ctx(), info.index, codec.name());
                    Some((info, media.arena.insert(codec)))
                }
                Err(e) => {
                    warn!("{} ⚠️  stream #{} 解码器打开失败: {}", log_ctx(), info.index, e);
                    last_error = Some(match e {
                        PlayerError::DecoderInitError { .. } => e,
                        other => PlayerError::DecoderInitError {
                            stream_index: info.index,
                            reason: other.to_string(),
                        },
                    });
                    None
                }
            }
        };
        let audio = open(audio_info, &mut demux);
        let video = open(video_info, &mut demux);
        if audio.is_none() && video.is_none() {
            return Err(last_error.unwrap_or(PlayerError::NoUsableStream));
        }
        media.demux = Some(demux);

        self.state.set_clock_source(if audio.is_some() {
            ClockSource::Audio
        } else {
            ClockSource::System
        });

        let shared = PipelineShared {
            arena: media.arena.clone(),
            state: self.state.clone(),
            config: self.config.clone(),
            engine: self.engine.clone(),
            listener: self.listener.clone(),
        };

        let mut info = MediaInfo {
            duration_ms: duration_s.map_or(0, |s| (s * 1000.0) as i64),
            ..Default::default()
        };
        let RenderBackend {
            video: video_sink,
            audio: audio_sink,
        } = backend;

        if let Some((stream, handle)) = audio {
            info.audio_codec = stream.codec_name.clone();
            info.sample_rate = stream.sample_rate;
            info.channels = stream.channels;
            let decoder = media
                .audio
                .insert(AudioStreamDecoder::new(stream, handle, shared.clone(), audio_sink));
            decoder.start()?;
        }

        if let Some((stream, handle)) = video {
            info.video_codec = stream.codec_name.clone();
            info.width = stream.width;
            info.height = stream.height;
            info.fps = stream.frame_rate.as_f64();
            let decoder = media
                .video
                .insert(VideoStreamDecoder::new(stream.clone(), handle, shared.clone()));
            info.rotation = decoder.rotate_angle();
            decoder.start()?;
            let ring = decoder.frame_queue().clone();
            let video_only = media.audio.is_none();
            media.scheduler = Some(SyncScheduler::start(stream, ring, video_sink, shared, video_only)?);
        }

        let mut view = self.view.lock();
        view.prepared = true;
        view.info = info;
        view.audio_queue = media.audio.as_ref().map(|d| d.queue().clone());
        view.video_queue = media.video.as_ref().map(|d| d.queue().clone());
        view.frames = media.video.as_ref().map(|d| d.frame_queue().clone());
        Ok(())
    }

    /// 解封装循环：处理暂停 / seek，读包并按流分发
    fn demux_loop(&self, media: &mut MediaContext) -> Result<DemuxExit> {
        let state = &self.state;
        let config = &self.config;
        let audio_index = media.audio.as_ref().map(|d| d.stream().index);
        let video_index = media.video.as_ref().map(|d| d.stream().index);
        let start_us = (state.start_time_s().unwrap_or(0.0) * 1_000_000.0) as i64;

        let mut first_iteration = true;
        let mut packet_count: u64 = 0;
        let mut discarded: u64 = 0;

        info!("{} 🎬 解封装循环启动", log_ctx());
        loop {
            if state.is_aborted() {
                info!("{} ⏹️  解封装循环收到停止请求 (已读 {} 包)", log_ctx(), packet_count);
                return Ok(DemuxExit::Aborted);
            }
            // 暂停时仍然响应 seek
            if state.is_paused() && !state.seek_pending() {
                if !state.wait_while_paused_unless_seek(config.pause_poll()) {
                    return Ok(DemuxExit::Aborted);
                }
                continue;
            }
            if first_iteration {
                state.mark_time_base();
                first_iteration = false;
            }

            if let Some(target_us) = state.pending_seek() {
                self.perform_seek(media, target_us);
                continue;
            }

            if self.should_throttle(media) {
                state.sleep(config.read_retry());
                continue;
            }

            let Some(demux) = media.demux.as_mut() else {
                return Err(PlayerError::InvalidState("解封装上下文已释放".to_string()));
            };
            match demux.read_packet() {
                Ok(ReadOutcome::Packet(packet)) => {
                    packet_count += 1;
                    if packet_count <= LOG_FIRST_N || packet_count % 100 == 0 {
                        debug!(
                            "{} 📦 packet #{}: stream #{}, pts {:?}, {} bytes",
                            log_ctx(),
                            packet_count,
                            packet.stream_index,
                            packet.pts,
                            packet.size()
                        );
                    }
                    if !Self::route(media, audio_index, video_index, packet) {
                        discarded += 1;
                    }
                }
                Ok(ReadOutcome::EndOfStream) => {
                    if media.is_drained() && !state.is_paused() {
                        if state.loop_playback() {
                            info!("{} 🔁 播放到结尾，从头循环", log_ctx());
                            state.schedule_seek(start_us);
                            continue;
                        }
                        if state.auto_exit() {
                            info!(
                                "{} 🏁 播放到结尾 (已读 {} 包, 丢弃 {} 包)",
                                log_ctx(),
                                packet_count,
                                discarded
                            );
                            return Ok(DemuxExit::EndOfStream);
                        }
                    }
                    state.sleep(config.read_retry());
                }
                Ok(ReadOutcome::Retry) => {
                    state.sleep(config.read_retry());
                }
                Err(e) => {
                    error!("{} ❌ 读取数据包失败: {}", log_ctx(), e);
                    return Err(match e {
                        PlayerError::ReadError(_) => e,
                        other => PlayerError::ReadError(other.to_string()),
                    });
                }
            }
        }
    }

    /// 按流分发；未选中的流返回 false
    fn route(media: &MediaContext, audio_index: Option<usize>, video_index: Option<usize>, packet: Packet) -> bool {
        let index = Some(packet.stream_index);
        if index == audio_index {
            if let Some(audio) = media.audio.as_ref() {
                return audio.queue().push(packet);
            }
        } else if index == video_index {
            if let Some(video) = media.video.as_ref() {
                return video.queue().push(packet);
            }
        }
        false
    }

    /// 执行 seek；失败时保留已缓冲的数据，从原位置继续播放
    fn perform_seek(&self, media: &mut MediaContext, target_us: i64) {
        let Some(demux) = media.demux.as_mut() else {
            self.state.complete_seek(None);
            return;
        };
        match demux.seek(target_us) {
            Ok(()) => {
                let target_ms = target_us / 1000;
                media.flush_decoders(Some(target_ms));
                self.state.complete_seek(Some(target_ms));
                info!("{} ✅ Seek 完成: {}ms", log_ctx(), target_ms);
            }
            Err(e) => {
                warn!("{} ⚠️  Seek 失败，继续从当前位置播放: {}", log_ctx(), e);
                self.state.complete_seek(None);
            }
        }
    }

    /// 读包节流：压缩数据过多，或所有活动队列都已积压
    fn should_throttle(&self, media: &MediaContext) -> bool {
        let queues: Vec<&Arc<PacketQueue>> = media
            .audio
            .iter()
            .map(|d| d.queue())
            .chain(media.video.iter().map(|d| d.queue()))
            .collect();
        if queues.is_empty() {
            return false;
        }
        let bytes: usize = queues.iter().map(|q| q.bytes()).sum();
        bytes > self.config.max_buffered_bytes || queues.iter().all(|q| q.len() >= self.config.max_buffered_packets)
    }
}
