use crate::core::{PlaybackState, PlayerConfig};
use log::debug;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::cell::Cell;
use std::time::{Duration, Instant};

thread_local! {
    /// 当前线程所属会话的 SessionState 地址，非管线线程为 0
    static PIPELINE_OWNER: Cell<usize> = const { Cell::new(0) };
}

/// 主时钟来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockSource {
    /// 音频解码线程写入的当前时间戳
    Audio,
    /// 没有音频流时使用系统时钟（以 sys_time_base 为基准）
    System,
}

/// 会话共享状态 - 所有线程轮询或等待的唯一数据源
///
/// 一个互斥锁 + 一个条件变量。`play` / `pause` / `seek_to` / `stop`
/// 以及 seek 完成都会唤醒所有等待者。
pub struct SessionState {
    inner: Mutex<StateInner>,
    cond: Condvar,
    epoch: Instant,
}

struct StateInner {
    url: String,
    abort_requested: bool,
    pause_requested: bool,
    seek_requested: bool,
    seek_target_us: i64,
    current_timestamp_ms: i64,
    sys_time_base_ms: Option<i64>,
    start_time_s: Option<f64>,
    duration_s: Option<f64>,
    loop_playback: bool,
    auto_exit: bool,
    resume_on_seek: bool,
    clock_source: ClockSource,
    phase: PlaybackState,
}

/// 共享状态快照（调试 / 测试用）
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub url: String,
    pub abort_requested: bool,
    pub pause_requested: bool,
    pub seek_requested: bool,
    pub seek_target_us: i64,
    pub current_timestamp_ms: i64,
    pub sys_time_base_ms: Option<i64>,
    pub start_time_s: Option<f64>,
    pub duration_s: Option<f64>,
    pub loop_playback: bool,
    pub auto_exit: bool,
    pub clock_source: ClockSource,
    pub state: PlaybackState,
}

impl SessionState {
    pub fn new(config: &PlayerConfig) -> Self {
        Self {
            inner: Mutex::new(StateInner {
                url: String::new(),
                abort_requested: false,
                pause_requested: config.start_paused,
                seek_requested: false,
                seek_target_us: 0,
                current_timestamp_ms: 0,
                sys_time_base_ms: None,
                start_time_s: None,
                duration_s: None,
                loop_playback: config.loop_playback,
                auto_exit: config.auto_exit,
                resume_on_seek: config.resume_on_seek,
                clock_source: ClockSource::Audio,
                phase: PlaybackState::Uninitialized,
            }),
            cond: Condvar::new(),
            epoch: Instant::now(),
        }
    }

    /// 把当前线程登记为本会话的管线线程（会话 / 解码 / 同步）
    pub fn bind_current_thread(&self) {
        let owner = self as *const Self as usize;
        PIPELINE_OWNER.with(|cell| cell.set(owner));
    }

    /// 当前线程是否是本会话的管线线程（事件回调就在这些线程上触发）
    pub fn is_pipeline_thread(&self) -> bool {
        let owner = self as *const Self as usize;
        PIPELINE_OWNER.with(|cell| cell.get() == owner)
    }

    /// 单调系统时间（毫秒）
    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock()
    }

    // ==================== 控制请求 ====================

    pub fn request_play(&self) {
        let now = self.now_ms();
        let mut inner = self.lock();
        if inner.pause_requested && inner.sys_time_base_ms.is_some() {
            // 系统时钟从暂停位置继续走
            inner.sys_time_base_ms = Some(now - inner.current_timestamp_ms);
        }
        inner.pause_requested = false;
        self.cond.notify_all();
    }

    pub fn request_pause(&self) {
        let now = self.now_ms();
        let mut inner = self.lock();
        if !inner.pause_requested {
            if inner.clock_source == ClockSource::System {
                if let Some(base) = inner.sys_time_base_ms {
                    inner.current_timestamp_ms = now - base;
                }
            }
            inner.pause_requested = true;
        }
        self.cond.notify_all();
    }

    pub fn request_abort(&self) {
        let mut inner = self.lock();
        inner.abort_requested = true;
        self.cond.notify_all();
    }

    /// 提交 seek 请求，若上一次 seek 尚未完成则阻塞等待
    ///
    /// 返回 false 表示会话已中止，请求被丢弃。
    pub fn request_seek(&self, target_us: i64) -> bool {
        let mut inner = self.lock();
        while inner.seek_requested && !inner.abort_requested && !inner.phase.is_terminal() {
            self.cond.wait(&mut inner);
        }
        if inner.abort_requested || inner.phase.is_terminal() {
            return false;
        }
        inner.seek_requested = true;
        inner.seek_target_us = target_us;
        if inner.resume_on_seek {
            inner.pause_requested = false;
        }
        self.cond.notify_all();
        true
    }

    /// 解封装线程内部发起的 seek（循环播放），不等待
    pub fn schedule_seek(&self, target_us: i64) -> bool {
        let mut inner = self.lock();
        if inner.seek_requested || inner.abort_requested {
            return false;
        }
        inner.seek_requested = true;
        inner.seek_target_us = target_us;
        self.cond.notify_all();
        true
    }

    /// 当前挂起的 seek 目标（微秒）
    pub fn pending_seek(&self) -> Option<i64> {
        let inner = self.lock();
        inner.seek_requested.then_some(inner.seek_target_us)
    }

    /// 清除 seek 标志
    ///
    /// `landed_ms` 为 Some 时表示 seek 成功，主时钟立即对齐到目标位置。
    pub fn complete_seek(&self, landed_ms: Option<i64>) {
        let now = self.now_ms();
        let mut inner = self.lock();
        if let Some(ms) = landed_ms {
            inner.current_timestamp_ms = ms;
            if inner.sys_time_base_ms.is_some() {
                inner.sys_time_base_ms = Some(now - ms);
            }
        }
        inner.seek_requested = false;
        self.cond.notify_all();
    }

    // ==================== 查询 ====================

    pub fn is_aborted(&self) -> bool {
        self.lock().abort_requested
    }

    pub fn is_paused(&self) -> bool {
        self.lock().pause_requested
    }

    pub fn seek_pending(&self) -> bool {
        self.lock().seek_requested
    }

    pub fn current_timestamp_ms(&self) -> i64 {
        self.lock().current_timestamp_ms
    }

    /// 音频解码线程更新主时钟
    pub fn set_current_timestamp_ms(&self, ms: i64) {
        self.lock().current_timestamp_ms = ms;
    }

    /// 主时钟（毫秒）
    pub fn master_clock_ms(&self) -> i64 {
        let now = self.now_ms();
        let inner = self.lock();
        match (inner.clock_source, inner.sys_time_base_ms) {
            (ClockSource::System, Some(base)) if !inner.pause_requested => now - base,
            _ => inner.current_timestamp_ms,
        }
    }

    /// 首次进入读包循环时记录系统时间基准
    pub fn mark_time_base(&self) {
        let now = self.now_ms();
        let mut inner = self.lock();
        if inner.sys_time_base_ms.is_none() {
            inner.sys_time_base_ms = Some(now - inner.current_timestamp_ms);
            debug!("记录会话时间基准: {:?}", inner.sys_time_base_ms);
        }
    }

    pub fn set_clock_source(&self, source: ClockSource) {
        self.lock().clock_source = source;
    }

    pub fn clock_source(&self) -> ClockSource {
        self.lock().clock_source
    }

    pub fn set_url(&self, url: &str) {
        self.lock().url = url.to_string();
    }

    pub fn url(&self) -> String {
        self.lock().url.clone()
    }

    /// 记录媒体起点和时长；主时钟从起点开始计时
    pub fn set_timing(&self, start_time_s: Option<f64>, duration_s: Option<f64>) {
        let mut inner = self.lock();
        inner.start_time_s = start_time_s;
        inner.duration_s = duration_s;
        if let Some(start) = start_time_s {
            inner.current_timestamp_ms = (start * 1000.0) as i64;
        }
    }

    pub fn start_time_s(&self) -> Option<f64> {
        self.lock().start_time_s
    }

    pub fn duration_s(&self) -> Option<f64> {
        self.lock().duration_s
    }

    pub fn loop_playback(&self) -> bool {
        self.lock().loop_playback
    }

    pub fn auto_exit(&self) -> bool {
        self.lock().auto_exit
    }

    pub fn set_phase(&self, phase: PlaybackState) {
        let mut inner = self.lock();
        inner.phase = phase;
        self.cond.notify_all();
    }

    /// 对外可见的播放状态
    pub fn playback_state(&self) -> PlaybackState {
        let inner = self.lock();
        match inner.phase {
            PlaybackState::Playing | PlaybackState::Paused | PlaybackState::Seeking => {
                if inner.seek_requested {
                    PlaybackState::Seeking
                } else if inner.pause_requested {
                    PlaybackState::Paused
                } else {
                    PlaybackState::Playing
                }
            }
            other => other,
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let state = self.playback_state();
        let inner = self.lock();
        StateSnapshot {
            url: inner.url.clone(),
            abort_requested: inner.abort_requested,
            pause_requested: inner.pause_requested,
            seek_requested: inner.seek_requested,
            seek_target_us: inner.seek_target_us,
            current_timestamp_ms: inner.current_timestamp_ms,
            sys_time_base_ms: inner.sys_time_base_ms,
            start_time_s: inner.start_time_s,
            duration_s: inner.duration_s,
            loop_playback: inner.loop_playback,
            auto_exit: inner.auto_exit,
            clock_source: inner.clock_source,
            state,
        }
    }

    // ==================== 等待 ====================

    /// 暂停期间挂起（按时间片轮询，可被 play/stop 立即唤醒）
    ///
    /// 返回 false 表示会话已中止。
    pub fn wait_while_paused(&self, slice: Duration) -> bool {
        let mut inner = self.lock();
        while inner.pause_requested && !inner.abort_requested {
            self.cond.wait_for(&mut inner, slice);
        }
        !inner.abort_requested
    }

    /// 暂停期间挂起，但 seek 请求会打断等待（解封装线程在暂停时也要处理 seek）
    pub fn wait_while_paused_unless_seek(&self, slice: Duration) -> bool {
        let mut inner = self.lock();
        while inner.pause_requested && !inner.abort_requested && !inner.seek_requested {
            self.cond.wait_for(&mut inner, slice);
        }
        !inner.abort_requested
    }

    /// 等待 seek 完成（解码线程在 seek 挂起期间不处理任何数据）
    pub fn wait_seek_cleared(&self, slice: Duration) -> bool {
        let mut inner = self.lock();
        while inner.seek_requested && !inner.abort_requested {
            self.cond.wait_for(&mut inner, slice);
        }
        !inner.abort_requested
    }

    /// 可被状态变化打断的睡眠
    pub fn sleep(&self, duration: Duration) {
        let mut inner = self.lock();
        if !inner.abort_requested {
            self.cond.wait_for(&mut inner, duration);
        }
    }
}
