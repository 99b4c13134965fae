use crate::core::{log_ctx, PixelFormat, Result};
use crate::player::codec::{FrameConverter, StreamInfo, VideoFrame};
use crate::player::decoder::PipelineShared;
use crate::player::frame_queue::{FrameQueue, FrameSlot};
use crate::player::render::{NativeImage, RenderKind, VideoSink};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// 单帧的同步决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// 立即渲染
    Render,
    /// 帧还没到时间，先等待（毫秒，不超过同步阈值）
    Wait(i64),
    /// 已经落后，丢弃该帧
    Drop,
    /// 落后太多，清空整个帧队列
    DropAndFlush,
}

impl SyncDecision {
    /// `delay = master - frame`
    pub fn decide(master_ms: i64, frame_ms: Option<i64>, threshold_ms: i64, max_lag_ms: i64) -> Self {
        let Some(frame_ms) = frame_ms else {
            return SyncDecision::Render;
        };
        let delay = master_ms - frame_ms;
        if delay > max_lag_ms {
            SyncDecision::DropAndFlush
        } else if delay > threshold_ms {
            SyncDecision::Drop
        } else if delay < 0 {
            SyncDecision::Wait((-delay).min(threshold_ms))
        } else {
            SyncDecision::Render
        }
    }
}

/// 音视频同步线程 - 帧队列唯一的消费者
///
/// 以音频时间戳为主时钟（没有音频时用系统时钟），决定每一帧是等待、渲染还是丢弃。
pub struct SyncScheduler {
    abort: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SyncScheduler {
    pub fn start(
        video: StreamInfo,
        ring: Arc<FrameQueue>,
        sink: Box<dyn VideoSink>,
        shared: PipelineShared,
        video_only: bool,
    ) -> Result<Self> {
        let abort = Arc::new(AtomicBool::new(false));
        let sync_loop = SyncLoop {
            video,
            ring,
            sink,
            shared,
            video_only,
            abort: abort.clone(),
            converter: None,
            converter_key: None,
            rgba: VideoFrame::default(),
            out_size: (0, 0),
            rendered: 0,
            dropped: 0,
            flushed: 0,
        };
        let thread = thread::Builder::new()
            .name("myy-sync".to_string())
            .spawn(move || sync_loop.run())?;
        Ok(Self {
            abort,
            thread: Some(thread),
        })
    }

    /// 停止并等待线程退出，可重复调用
    pub fn stop(&mut self) {
        self.abort.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("{} ❌ 同步线程 panic", log_ctx());
            }
        }
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SyncLoop {
    video: StreamInfo,
    ring: Arc<FrameQueue>,
    sink: Box<dyn VideoSink>,
    shared: PipelineShared,
    video_only: bool,
    abort: Arc<AtomicBool>,
    converter: Option<Box<dyn FrameConverter>>,
    converter_key: Option<(u32, u32, PixelFormat)>,
    rgba: VideoFrame,
    out_size: (u32, u32),
    rendered: u64,
    dropped: u64,
    flushed: u64,
}

impl SyncLoop {
    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst) || self.shared.state.is_aborted()
    }

    fn run(mut self) {
        self.shared.state.bind_current_thread();
        info!("{} 🎬 同步线程启动 (视频 stream #{})", log_ctx(), self.video.index);
        self.out_size = match self.sink.init(self.video.width, self.video.height) {
            Ok(size) => size,
            Err(e) => {
                error!("{} ❌ 视频输出初始化失败: {}", log_ctx(), e);
                (self.video.width, self.video.height)
            }
        };
        debug!(
            "视频输出: {}x{} → {}x{} ({:?})",
            self.video.width,
            self.video.height,
            self.out_size.0,
            self.out_size.1,
            self.sink.render_kind()
        );

        let state = self.shared.state.clone();
        let config = self.shared.config.clone();
        let poll = config.poll_interval();
        let ring = self.ring.clone();

        while !self.aborted() {
            if state.is_paused() {
                if !state.wait_while_paused(poll) {
                    break;
                }
                continue;
            }
            // seek 挂起期间不渲染
            if state.seek_pending() || ring.is_flushing() {
                state.sleep(poll);
                continue;
            }
            if !ring.wait_for_frame(poll) {
                continue;
            }

            // 决策和渲染期间持有 flush 锁，队首帧不会被并发清空
            let flush_guard = ring.flush_guard();
            let frame_ms = match ring.front() {
                Some(slot) => slot.pts_ms,
                None => continue,
            };
            let master_ms = state.master_clock_ms();
            match SyncDecision::decide(master_ms, frame_ms, config.sync_threshold_ms, config.max_frame_lag_ms) {
                SyncDecision::Drop => {
                    ring.pop();
                    self.dropped += 1;
                    continue;
                }
                SyncDecision::DropAndFlush => {
                    drop(flush_guard);
                    debug!(
                        "视频落后主时钟过多，清空帧队列 (master: {}ms, frame: {:?}ms)",
                        master_ms, frame_ms
                    );
                    ring.flush();
                    self.flushed += 1;
                    continue;
                }
                SyncDecision::Wait(_) | SyncDecision::Render => {}
            }

            if let Some(frame_ms) = frame_ms {
                self.wait_until(frame_ms);
            }
            if self.interrupted() {
                continue;
            }

            self.render_front();
            ring.pop();
            drop(flush_guard);
            self.rendered += 1;

            self.shared.listener.on_request_render();
            if self.video_only {
                if let Some(frame_ms) = frame_ms {
                    state.set_current_timestamp_ms(frame_ms);
                    self.shared.listener.on_update_time(frame_ms as f64 / 1000.0);
                }
            }
        }

        self.sink.uninit();
        info!(
            "{} ✅ 同步线程退出 (渲染 {}, 丢弃 {}, 清空队列 {} 次)",
            log_ctx(),
            self.rendered,
            self.dropped,
            self.flushed
        );
    }

    /// 停止 / 暂停 / seek / flush 都会打断等待，随后释放 flush 锁
    fn interrupted(&self) -> bool {
        let state = &self.shared.state;
        self.aborted() || state.is_paused() || state.seek_pending() || self.ring.is_flushing()
    }

    /// 帧还在主时钟之前时按阈值分段睡眠；主时钟不再前进或被打断就立即返回
    fn wait_until(&self, frame_ms: i64) {
        let state = &self.shared.state;
        let threshold = self.shared.config.sync_threshold_ms;
        let mut master_ms = state.master_clock_ms();
        while frame_ms > master_ms && !self.interrupted() {
            let sleep_ms = (frame_ms - master_ms).min(threshold);
            thread::sleep(Duration::from_millis(sleep_ms as u64));
            let now_ms = state.master_clock_ms();
            if now_ms <= master_ms {
                break;
            }
            master_ms = now_ms;
        }
    }

    fn render_front(&mut self) {
        let Some(mut slot) = self.ring.front() else {
            return;
        };
        let direct = if self.sink.render_kind() == RenderKind::NativeWindow {
            None
        } else {
            NativeImage::from_frame(&slot.frame, slot.pts_ms)
        };
        let result = match direct {
            Some(image) => self.sink.render_frame(&image),
            None => Self::convert_and_render(
                &self.shared,
                &mut self.converter,
                &mut self.converter_key,
                &mut self.rgba,
                self.out_size,
                &mut *self.sink,
                &slot,
            ),
        };
        match result {
            Ok(()) => slot.rendered = true,
            Err(e) => warn!("{} ⚠️  视频渲染失败: {}", log_ctx(), e),
        }
    }

    /// 转换为 RGBA（缩放到协商尺寸）后渲染
    fn convert_and_render(
        shared: &PipelineShared,
        converter: &mut Option<Box<dyn FrameConverter>>,
        converter_key: &mut Option<(u32, u32, PixelFormat)>,
        rgba: &mut VideoFrame,
        out_size: (u32, u32),
        sink: &mut dyn VideoSink,
        slot: &FrameSlot,
    ) -> Result<()> {
        let frame = &slot.frame;
        let key = (frame.width, frame.height, frame.format);
        if converter.is_none() || *converter_key != Some(key) {
            debug!(
                "🔧 创建像素格式转换: {}x{} {:?} → {}x{} RGBA",
                frame.width, frame.height, frame.format, out_size.0, out_size.1
            );
            *converter = Some(shared.engine.create_converter(
                frame.width,
                frame.height,
                frame.format,
                out_size.0,
                out_size.1,
            )?);
            *converter_key = Some(key);
        }
        if let Some(converter) = converter.as_mut() {
            converter.convert(frame, rgba)?;
        }
        rgba.pts = frame.pts;
        match NativeImage::from_frame(rgba, slot.pts_ms) {
            Some(image) => sink.render_frame(&image),
            None => Ok(()),
        }
    }
}
