//! MYY 播放引擎
//!
//! 解封装线程把压缩包分发到音频 / 视频包队列，两个解码线程各自消费；
//! 音频直接写入音频输出并推进主时钟，视频帧进入环形帧队列，
//! 由同步线程按主时钟决定渲染、等待或丢弃。

pub mod core;
pub mod player;

pub use crate::core::{
    BufferStatus, MediaInfo, MediaParam, PlaybackState, PlayerConfig, PlayerError, Result, StateSnapshot,
};
pub use crate::player::{
    AudioSink, ChannelListener, CodecEngine, NullAudioSink, NullVideoSink, PlaybackSession, PlayerEvent,
    PlayerListener, RenderBackend, VideoSink,
};
