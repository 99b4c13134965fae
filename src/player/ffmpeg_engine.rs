use crate::core::{log_ctx, AudioParams, MediaKind, PixelFormat, PlayerError, Rational, Result, SampleFormat};
use crate::player::codec::{
    AudioFrame, CodecContext, CodecEngine, DemuxContext, FrameConverter, Packet, ReadOutcome, ReceiveStatus,
    Resampler, SendStatus, StreamInfo, VideoFrame,
};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::util::channel_layout::ChannelLayout;
use ffmpeg_next::util::format::{sample::Type as SampleType, Pixel, Sample};
use ffmpeg_next::{codec, format, media, software, util};
use log::{debug, info, warn};

const EAGAIN: i32 = 11;

/// 基于 FFmpeg 的编解码引擎
pub struct FfmpegEngine;

impl FfmpegEngine {
    pub fn new() -> Result<Self> {
        ffmpeg::init()?;
        info!("{} ✅ FFmpeg 初始化完成", log_ctx());
        Ok(Self)
    }

    fn is_network(url: &str) -> bool {
        url.starts_with("http://")
            || url.starts_with("https://")
            || url.starts_with("rtsp://")
            || url.starts_with("rtmp://")
            || url.contains(".m3u8")
    }
}

impl CodecEngine for FfmpegEngine {
    fn open_input(&self, url: &str) -> Result<Box<dyn DemuxContext>> {
        info!("正在打开: {}", url);
        let input = if Self::is_network(url) {
            info!("🌐 检测到网络流，应用网络选项");
            let mut options = ffmpeg::Dictionary::new();
            options.set("fflags", "+discardcorrupt+genpts");
            options.set("analyzeduration", "5000000");
            options.set("probesize", "10000000");
            options.set("timeout", "15000000");
            options.set("rw_timeout", "8000000");
            options.set("reconnect", "1");
            options.set("reconnect_streamed", "1");
            options.set("reconnect_delay_max", "4");
            format::input_with_dictionary(&url, options)
                .map_err(|e| PlayerError::OpenError(format!("无法打开网络流: {}", e)))?
        } else {
            format::input(&url).map_err(|e| PlayerError::OpenError(format!("无法打开文件: {}", e)))?
        };
        Ok(Box::new(FfmpegInput {
            input,
            url: url.to_string(),
            streams: Vec::new(),
        }))
    }

    fn create_resampler(&self, input: &AudioParams, output: &AudioParams) -> Result<Box<dyn Resampler>> {
        Ok(Box::new(FfmpegResampler::new(input, output)?))
    }

    fn create_converter(
        &self,
        src_width: u32,
        src_height: u32,
        src_format: PixelFormat,
        dst_width: u32,
        dst_height: u32,
    ) -> Result<Box<dyn FrameConverter>> {
        let pixel = pixel_to_ffmpeg(src_format)
            .ok_or_else(|| PlayerError::RenderError(format!("无法转换的像素格式: {:?}", src_format)))?;
        let context = software::scaling::Context::get(
            pixel,
            src_width,
            src_height,
            Pixel::RGBA,
            dst_width,
            dst_height,
            software::scaling::Flags::BILINEAR,
        )?;
        Ok(Box::new(FfmpegConverter { context, pixel }))
    }

    fn name(&self) -> &str {
        "ffmpeg"
    }
}

/// 解封装上下文
struct FfmpegInput {
    input: format::context::Input,
    url: String,
    streams: Vec<StreamInfo>,
}

// AVFormatContext 只在会话的解封装线程中使用
unsafe impl Send for FfmpegInput {}

impl FfmpegInput {
    fn describe_stream(stream: &format::stream::Stream) -> StreamInfo {
        let params = stream.parameters();
        let kind = match params.medium() {
            media::Type::Video => MediaKind::Video,
            media::Type::Audio => MediaKind::Audio,
            media::Type::Subtitle => MediaKind::Subtitle,
            _ => MediaKind::Data,
        };
        let time_base = stream.time_base();
        let frame_rate = stream.avg_frame_rate();
        let mut info = StreamInfo {
            index: stream.index(),
            kind,
            codec_name: params.id().name().to_string(),
            time_base: Rational::new(time_base.numerator(), time_base.denominator()),
            frame_rate: Rational::new(frame_rate.numerator(), frame_rate.denominator()),
            width: 0,
            height: 0,
            pixel_format: PixelFormat::Unknown,
            sample_rate: 0,
            channels: 0,
            metadata: stream
                .metadata()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };

        // 打开一次解码器只为读取参数，失败时保持默认值
        let Ok(context) = codec::context::Context::from_parameters(params) else {
            return info;
        };
        match kind {
            MediaKind::Video => {
                if let Ok(video) = context.decoder().video() {
                    info.width = video.width();
                    info.height = video.height();
                    info.pixel_format = pixel_from_ffmpeg(video.format());
                }
            }
            MediaKind::Audio => {
                if let Ok(audio) = context.decoder().audio() {
                    info.sample_rate = audio.rate();
                    info.channels = audio.channels();
                }
            }
            _ => {}
        }
        info
    }
}

impl DemuxContext for FfmpegInput {
    fn find_stream_info(&mut self) -> Result<()> {
        self.streams = self.input.streams().map(|s| Self::describe_stream(&s)).collect();
        if self.streams.is_empty() {
            return Err(PlayerError::StreamInfoError(format!("{} 中没有任何流", self.url)));
        }
        for stream in &self.streams {
            debug!(
                "stream #{}: {} {} {}x{} {}Hz/{}ch",
                stream.index,
                stream.kind.as_str(),
                stream.codec_name,
                stream.width,
                stream.height,
                stream.sample_rate,
                stream.channels
            );
        }
        Ok(())
    }

    fn streams(&self) -> Vec<StreamInfo> {
        self.streams.clone()
    }

    fn duration_us(&self) -> Option<i64> {
        let duration = self.input.duration();
        (duration > 0).then_some(duration)
    }

    fn start_time_us(&self) -> Option<i64> {
        let start = unsafe { (*self.input.as_ptr()).start_time };
        (start != ffmpeg::ffi::AV_NOPTS_VALUE).then_some(start)
    }

    fn open_decoder(&mut self, stream_index: usize) -> Result<Box<dyn CodecContext>> {
        let stream = self.input.stream(stream_index).ok_or_else(|| PlayerError::DecoderInitError {
            stream_index,
            reason: "流不存在".to_string(),
        })?;
        let medium = stream.parameters().medium();
        let context = codec::context::Context::from_parameters(stream.parameters())?;
        match medium {
            media::Type::Video => {
                let decoder = context.decoder().video()?;
                debug!(
                    "视频解码器: {}x{}, 格式: {:?}",
                    decoder.width(),
                    decoder.height(),
                    decoder.format()
                );
                Ok(Box::new(FfmpegVideoCodec {
                    decoder,
                    decoded: util::frame::Video::empty(),
                    fallback: None,
                }))
            }
            media::Type::Audio => {
                let decoder = context.decoder().audio()?;
                debug!(
                    "音频解码器: {}Hz, {} 声道, 格式: {:?}",
                    decoder.rate(),
                    decoder.channels(),
                    decoder.format()
                );
                Ok(Box::new(FfmpegAudioCodec {
                    decoder,
                    decoded: util::frame::Audio::empty(),
                    fallback: None,
                }))
            }
            other => Err(PlayerError::DecoderInitError {
                stream_index,
                reason: format!("不支持的流类型: {:?}", other),
            }),
        }
    }

    fn read_packet(&mut self) -> Result<ReadOutcome> {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(ReadOutcome::EndOfStream),
            Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => return Ok(ReadOutcome::Retry),
            Err(e) => return Err(PlayerError::ReadError(e.to_string())),
        }
        Ok(ReadOutcome::Packet(Packet {
            stream_index: packet.stream(),
            pts: packet.pts(),
            dts: packet.dts(),
            duration: packet.duration(),
            is_key: packet.is_key(),
            data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
            serial: 0,
        }))
    }

    fn seek(&mut self, target_us: i64) -> Result<()> {
        self.input
            .seek(target_us, ..target_us)
            .map_err(|e| PlayerError::SeekError(e.to_string()))
    }

    fn description(&self) -> String {
        self.url.clone()
    }
}

fn to_ffmpeg_packet(packet: &Packet) -> ffmpeg::Packet {
    let mut out = ffmpeg::Packet::copy(&packet.data);
    out.set_stream(packet.stream_index);
    out.set_pts(packet.pts);
    out.set_dts(packet.dts);
    out.set_duration(packet.duration);
    if packet.is_key {
        out.set_flags(ffmpeg::packet::Flags::KEY);
    }
    out
}

fn send_status(result: std::result::Result<(), ffmpeg::Error>) -> Result<SendStatus> {
    match result {
        Ok(()) => Ok(SendStatus::Accepted),
        Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => Ok(SendStatus::TryAgain),
        // 解码器已经收到过 EOF，丢弃该包
        Err(ffmpeg::Error::Eof) => Ok(SendStatus::Accepted),
        Err(e) => Err(PlayerError::DecodeError(e.to_string())),
    }
}

fn receive_status(result: std::result::Result<(), ffmpeg::Error>) -> Result<Option<ReceiveStatus>> {
    match result {
        Ok(()) => Ok(None),
        Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => Ok(Some(ReceiveStatus::NeedsInput)),
        Err(ffmpeg::Error::Eof) => Ok(Some(ReceiveStatus::EndOfStream)),
        Err(e) => Err(PlayerError::DecodeError(e.to_string())),
    }
}

struct FfmpegVideoCodec {
    decoder: codec::decoder::Video,
    decoded: util::frame::Video,
    /// 无法直接表示的像素格式先转为 RGBA
    fallback: Option<(Pixel, u32, u32, software::scaling::Context)>,
}

unsafe impl Send for FfmpegVideoCodec {}

impl FfmpegVideoCodec {
    fn convert_fallback(&mut self, out: &mut VideoFrame) -> Result<()> {
        let (format, width, height) = (self.decoded.format(), self.decoded.width(), self.decoded.height());
        let stale = !matches!(&self.fallback, Some((f, w, h, _)) if *f == format && *w == width && *h == height);
        if stale {
            debug!("🔧 像素格式 {:?} 先转换为 RGBA", format);
            let context = software::scaling::Context::get(
                format,
                width,
                height,
                Pixel::RGBA,
                width,
                height,
                software::scaling::Flags::BILINEAR,
            )?;
            self.fallback = Some((format, width, height, context));
        }
        let mut rgba = util::frame::Video::empty();
        if let Some((_, _, _, context)) = self.fallback.as_mut() {
            context.run(&self.decoded, &mut rgba)?;
        }
        out.format = PixelFormat::RGBA;
        out.fill_plane(0, rgba.data(0), rgba.stride(0));
        Ok(())
    }
}

impl CodecContext for FfmpegVideoCodec {
    fn send_packet(&mut self, packet: &Packet) -> Result<SendStatus> {
        send_status(self.decoder.send_packet(&to_ffmpeg_packet(packet)))
    }

    fn receive_video(&mut self, out: &mut VideoFrame) -> Result<ReceiveStatus> {
        if let Some(status) = receive_status(self.decoder.receive_frame(&mut self.decoded))? {
            return Ok(status);
        }
        out.reset();
        out.width = self.decoded.width();
        out.height = self.decoded.height();
        out.pts = self.decoded.timestamp().or(self.decoded.pts());
        out.key_frame = self.decoded.is_key();

        let format = pixel_from_ffmpeg(self.decoded.format());
        if format == PixelFormat::Unknown {
            self.convert_fallback(out)?;
        } else {
            out.format = format;
            for i in 0..self.decoded.planes().min(3) {
                out.fill_plane(i, self.decoded.data(i), self.decoded.stride(i));
            }
        }
        Ok(ReceiveStatus::Frame)
    }

    fn flush_buffers(&mut self) {
        self.decoder.flush();
    }

    fn name(&self) -> String {
        self.decoder
            .codec()
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| "video".to_string())
    }
}

struct FfmpegAudioCodec {
    decoder: codec::decoder::Audio,
    decoded: util::frame::Audio,
    /// 无法直接表示的采样格式先转为 F32 交错
    fallback: Option<(Sample, u32, u16, software::resampling::Context)>,
}

unsafe impl Send for FfmpegAudioCodec {}

impl FfmpegAudioCodec {
    fn convert_fallback(&mut self, out: &mut AudioFrame) -> Result<()> {
        let (format, rate, channels) = (self.decoded.format(), self.decoded.rate(), self.decoded.channels());
        let layout = layout_of(&self.decoded);
        let stale = !matches!(&self.fallback, Some((f, r, c, _)) if *f == format && *r == rate && *c == channels);
        if stale {
            debug!("🔧 采样格式 {:?} 先转换为 F32", format);
            let context = software::resampling::Context::get(
                format,
                layout,
                rate,
                Sample::F32(SampleType::Packed),
                layout,
                rate,
            )?;
            self.fallback = Some((format, rate, channels, context));
        }
        let mut converted = util::frame::Audio::empty();
        if let Some((_, _, _, context)) = self.fallback.as_mut() {
            context.run(&self.decoded, &mut converted)?;
        }
        out.format = SampleFormat::F32;
        out.nb_samples = converted.samples();
        let len = out.nb_samples * channels as usize * SampleFormat::F32.bytes_per_sample();
        let data = converted.data(0);
        out.planes.clear();
        out.planes.push(data[..len.min(data.len())].to_vec());
        Ok(())
    }
}

impl CodecContext for FfmpegAudioCodec {
    fn send_packet(&mut self, packet: &Packet) -> Result<SendStatus> {
        send_status(self.decoder.send_packet(&to_ffmpeg_packet(packet)))
    }

    fn receive_audio(&mut self, out: &mut AudioFrame) -> Result<ReceiveStatus> {
        if let Some(status) = receive_status(self.decoder.receive_frame(&mut self.decoded))? {
            return Ok(status);
        }
        out.pts = self.decoded.timestamp().or(self.decoded.pts());
        out.sample_rate = self.decoded.rate();
        out.channels = self.decoded.channels();

        match sample_from_ffmpeg(self.decoded.format()) {
            Some(format) => {
                out.format = format;
                out.nb_samples = self.decoded.samples();
                let plane_len = if format.is_planar() {
                    out.nb_samples * format.bytes_per_sample()
                } else {
                    out.nb_samples * out.channels as usize * format.bytes_per_sample()
                };
                out.planes.resize_with(self.decoded.planes(), Vec::new);
                for (i, plane) in out.planes.iter_mut().enumerate() {
                    let data = self.decoded.data(i);
                    plane.clear();
                    plane.extend_from_slice(&data[..plane_len.min(data.len())]);
                }
            }
            None => self.convert_fallback(out)?,
        }
        Ok(ReceiveStatus::Frame)
    }

    fn flush_buffers(&mut self) {
        self.decoder.flush();
    }

    fn name(&self) -> String {
        self.decoder
            .codec()
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| "audio".to_string())
    }
}

/// swr 重采样：解码格式 → 输出设备格式
struct FfmpegResampler {
    context: software::resampling::Context,
    src_format: Sample,
    src_layout: ChannelLayout,
    output: AudioParams,
}

unsafe impl Send for FfmpegResampler {}

impl FfmpegResampler {
    fn new(input: &AudioParams, output: &AudioParams) -> Result<Self> {
        debug!(
            "🔧 初始化音频重采样器: {}Hz/{}ch/{:?} → {}Hz/{}ch/{:?}",
            input.sample_rate, input.channels, input.format, output.sample_rate, output.channels, output.format
        );
        let src_format = sample_to_ffmpeg(input.format);
        let src_layout = ChannelLayout::default(input.channels as i32);
        let context = software::resampling::Context::get(
            src_format,
            src_layout,
            input.sample_rate,
            sample_to_ffmpeg(output.format),
            ChannelLayout::default(output.channels as i32),
            output.sample_rate,
        )?;
        Ok(Self {
            context,
            src_format,
            src_layout,
            output: *output,
        })
    }
}

impl Resampler for FfmpegResampler {
    fn resample(&mut self, frame: &AudioFrame, out: &mut Vec<u8>) -> Result<usize> {
        let mut input = util::frame::Audio::new(self.src_format, frame.nb_samples, self.src_layout);
        input.set_rate(frame.sample_rate);
        for (i, plane) in frame.planes.iter().enumerate().take(input.planes()) {
            let dst = input.data_mut(i);
            let n = plane.len().min(dst.len());
            dst[..n].copy_from_slice(&plane[..n]);
        }

        let mut resampled = util::frame::Audio::empty();
        self.context.run(&input, &mut resampled)?;
        let samples = resampled.samples();
        let len = samples * self.output.frame_bytes();
        let data = resampled.data(0);
        out.clear();
        out.extend_from_slice(&data[..len.min(data.len())]);
        Ok(samples)
    }
}

/// sws 像素格式转换：任意格式 → RGBA
struct FfmpegConverter {
    context: software::scaling::Context,
    pixel: Pixel,
}

unsafe impl Send for FfmpegConverter {}

impl FrameConverter for FfmpegConverter {
    fn convert(&mut self, src: &VideoFrame, dst: &mut VideoFrame) -> Result<()> {
        let mut input = util::frame::Video::new(self.pixel, src.width, src.height);
        for i in 0..input.planes().min(3) {
            let rows = input.plane_height(i) as usize;
            let dst_stride = input.stride(i);
            let src_stride = src.strides[i];
            let plane = &src.planes[i];
            let row_len = dst_stride.min(src_stride);
            let data = input.data_mut(i);
            for y in 0..rows {
                let (s, d) = (y * src_stride, y * dst_stride);
                if s + row_len > plane.len() || d + row_len > data.len() {
                    break;
                }
                data[d..d + row_len].copy_from_slice(&plane[s..s + row_len]);
            }
        }

        let mut rgba = util::frame::Video::empty();
        self.context.run(&input, &mut rgba)?;
        dst.reset();
        dst.width = rgba.width();
        dst.height = rgba.height();
        dst.format = PixelFormat::RGBA;
        dst.fill_plane(0, rgba.data(0), rgba.stride(0));
        Ok(())
    }
}

fn layout_of(frame: &util::frame::Audio) -> ChannelLayout {
    let layout = frame.channel_layout();
    if layout.is_empty() {
        ChannelLayout::default(frame.channels() as i32)
    } else {
        layout
    }
}

fn pixel_from_ffmpeg(pixel: Pixel) -> PixelFormat {
    match pixel {
        Pixel::YUV420P => PixelFormat::YUV420P,
        Pixel::YUVJ420P => PixelFormat::YUVJ420P,
        Pixel::YUV422P => PixelFormat::YUV422P,
        Pixel::YUV444P => PixelFormat::YUV444P,
        Pixel::NV12 => PixelFormat::NV12,
        Pixel::NV21 => PixelFormat::NV21,
        Pixel::RGBA => PixelFormat::RGBA,
        Pixel::BGRA => PixelFormat::BGRA,
        Pixel::RGB24 => PixelFormat::RGB24,
        other => {
            if other != Pixel::None {
                debug!("未映射的像素格式: {:?}", other);
            }
            PixelFormat::Unknown
        }
    }
}

fn pixel_to_ffmpeg(format: PixelFormat) -> Option<Pixel> {
    match format {
        PixelFormat::YUV420P => Some(Pixel::YUV420P),
        PixelFormat::YUVJ420P => Some(Pixel::YUVJ420P),
        PixelFormat::YUV422P => Some(Pixel::YUV422P),
        PixelFormat::YUV444P => Some(Pixel::YUV444P),
        PixelFormat::NV12 => Some(Pixel::NV12),
        PixelFormat::NV21 => Some(Pixel::NV21),
        PixelFormat::RGBA => Some(Pixel::RGBA),
        PixelFormat::BGRA => Some(Pixel::BGRA),
        PixelFormat::RGB24 => Some(Pixel::RGB24),
        PixelFormat::Unknown => None,
    }
}

fn sample_from_ffmpeg(sample: Sample) -> Option<SampleFormat> {
    match sample {
        Sample::I16(SampleType::Packed) => Some(SampleFormat::S16),
        Sample::I16(SampleType::Planar) => Some(SampleFormat::S16P),
        Sample::F32(SampleType::Packed) => Some(SampleFormat::F32),
        Sample::F32(SampleType::Planar) => Some(SampleFormat::F32P),
        other => {
            warn!("采样格式 {:?} 需要额外转换", other);
            None
        }
    }
}

fn sample_to_ffmpeg(format: SampleFormat) -> Sample {
    match format {
        SampleFormat::S16 => Sample::I16(SampleType::Packed),
        SampleFormat::S16P => Sample::I16(SampleType::Planar),
        SampleFormat::F32 => Sample::F32(SampleType::Packed),
        SampleFormat::F32P => Sample::F32(SampleType::Planar),
    }
}
