// 播放引擎核心模块

pub mod codec;
pub mod decoder;
pub mod events;
pub mod frame_queue;
pub mod packet_queue;
pub mod render;
pub mod session;
pub mod sync;

#[cfg(feature = "cpal-output")]
pub mod audio_output;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_engine;

pub use codec::{
    AudioFrame, CodecArena, CodecContext, CodecEngine, CodecHandle, DemuxContext, FrameConverter, Packet,
    ReadOutcome, ReceiveStatus, Resampler, SendStatus, StreamInfo, VideoFrame,
};
pub use decoder::{AudioStreamDecoder, PipelineShared, StreamDecoder, VideoStreamDecoder};
pub use events::{ChannelListener, NoopListener, PlayerEvent, PlayerListener};
pub use frame_queue::{FrameQueue, FrameSlot};
pub use packet_queue::PacketQueue;
pub use render::{AudioSink, ImageFormat, NativeImage, NullAudioSink, NullVideoSink, RenderBackend, RenderKind, VideoSink};
pub use session::PlaybackSession;
pub use sync::{SyncDecision, SyncScheduler};

#[cfg(feature = "cpal-output")]
pub use audio_output::CpalAudioSink;
#[cfg(feature = "ffmpeg")]
pub use ffmpeg_engine::FfmpegEngine;
