use crate::core::PlayerError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;

/// 播放事件监听
///
/// 回调可能来自任意内部线程，实现方不能假设调用线程。
pub trait PlayerListener: Send + Sync {
    fn on_ready(&self) {}

    fn on_done(&self) {}

    fn on_error(&self, _error: &PlayerError) {}

    /// 新的一帧视频已经交给输出
    fn on_request_render(&self) {}

    /// 播放位置（秒）
    fn on_update_time(&self, _seconds: f64) {}
}

/// 忽略所有事件
pub struct NoopListener;

impl PlayerListener for NoopListener {}

/// 播放事件（通道形式）
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Ready,
    Done,
    Error(String),
    RequestRender,
    UpdateTime(f64),
}

/// 把回调转发到 crossbeam 通道
pub struct ChannelListener {
    tx: Sender<PlayerEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, Receiver<PlayerEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }

    fn send(&self, event: PlayerEvent) {
        if self.tx.send(event).is_err() {
            debug!("事件接收端已关闭");
        }
    }
}

impl PlayerListener for ChannelListener {
    fn on_ready(&self) {
        self.send(PlayerEvent::Ready);
    }

    fn on_done(&self) {
        self.send(PlayerEvent::Done);
    }

    fn on_error(&self, error: &PlayerError) {
        self.send(PlayerEvent::Error(error.to_string()));
    }

    fn on_request_render(&self) {
        self.send(PlayerEvent::RequestRender);
    }

    fn on_update_time(&self, seconds: f64) {
        self.send(PlayerEvent::UpdateTime(seconds));
    }
}
