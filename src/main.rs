use anyhow::{Context, Result};
use crossbeam_channel::{never, select, unbounded, Receiver};
use log::{info, warn};
use myy_engine::core::{MediaParam, PlayerConfig};
use myy_engine::player::{ChannelListener, CpalAudioSink, FfmpegEngine, NullVideoSink, PlaybackSession, PlayerEvent};
use myy_engine::{AudioSink, RenderBackend};
use std::io::BufRead;
use std::sync::Arc;
use std::thread;

/// 终端命令
enum Command {
    Play,
    Pause,
    Seek(f64),
    Info,
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    let mut parts = line.split_whitespace();
    match parts.next()? {
        "p" | "pause" => Some(Command::Pause),
        "r" | "play" => Some(Command::Play),
        "s" | "seek" => parts.next()?.parse().ok().map(Command::Seek),
        "i" | "info" => Some(Command::Info),
        "q" | "quit" => Some(Command::Quit),
        _ => None,
    }
}

fn spawn_stdin_reader() -> Receiver<Command> {
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match parse_command(&line) {
                Some(cmd) => {
                    if tx.send(cmd).is_err() {
                        break;
                    }
                }
                None => println!("命令: p(暂停) r(播放) s <秒>(跳转) i(信息) q(退出)"),
            }
        }
    });
    rx
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let mut args = std::env::args().skip(1);
    let url = args.next().context("用法: myy_play <url> [config.json]")?;
    let mut config = match args.next() {
        Some(path) => PlayerConfig::load(&path).with_context(|| format!("无法加载配置 {}", path))?,
        None => PlayerConfig::default(),
    };

    info!("🎬 MYY 播放引擎启动");
    let engine = Arc::new(FfmpegEngine::new().context("FFmpeg 初始化失败")?);

    let audio: Arc<dyn AudioSink> = match CpalAudioSink::new() {
        Ok(sink) => {
            config.audio_output = sink.negotiate(&config.audio_output)?;
            Arc::new(sink)
        }
        Err(e) => {
            warn!("⚠️  音频设备不可用，静音播放: {}", e);
            Arc::new(myy_engine::NullAudioSink)
        }
    };
    let backend = RenderBackend::new(Box::new(NullVideoSink::default()), audio);

    let (listener, events) = ChannelListener::new();
    let session = PlaybackSession::new(engine, config, Arc::new(listener));
    session.init(&url, backend)?;

    let mut commands = spawn_stdin_reader();
    let mut last_second = -1i64;
    loop {
        select! {
            recv(events) -> event => match event {
                Ok(PlayerEvent::Ready) => {
                    if let Some(info) = session.media_info() {
                        println!("{}", serde_json::to_string_pretty(&info)?);
                    }
                }
                Ok(PlayerEvent::UpdateTime(seconds)) => {
                    if seconds as i64 != last_second {
                        last_second = seconds as i64;
                        let duration = session.get_param(MediaParam::Duration);
                        println!("⏱  {:.1}s / {:.1}s", seconds, duration);
                    }
                }
                Ok(PlayerEvent::Error(message)) => eprintln!("❌ {}", message),
                Ok(PlayerEvent::Done) | Err(_) => break,
                Ok(PlayerEvent::RequestRender) => {}
            },
            recv(commands) -> cmd => match cmd {
                Ok(Command::Play) => session.play(),
                Ok(Command::Pause) => session.pause(),
                Ok(Command::Seek(seconds)) => {
                    if !session.seek_to(seconds) {
                        warn!("⚠️  无法跳转到 {}s", seconds);
                    }
                }
                Ok(Command::Info) => {
                    println!("{}", serde_json::to_string_pretty(&session.snapshot())?);
                    println!("{}", serde_json::to_string_pretty(&session.buffer_status())?);
                }
                Ok(Command::Quit) => session.stop(),
                // 标准输入关闭后只等待播放结束
                Err(_) => commands = never(),
            },
        }
    }

    session.uninit();
    info!("👋 播放结束");
    Ok(())
}
