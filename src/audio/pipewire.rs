//! PipeWire microphone and speaker
//!
//! Each stream runs its own PipeWire main loop on a dedicated thread and is
//! stopped through a PipeWire channel.

use super::capture::SharedCaptureState;
use super::device::{InputDevice, InputStream, OutputDevice, OutputStream, PlaybackDone};
use super::wav::Clip;
use crate::error::{CaptureError, PlaybackError};
use log::{debug, error, warn};
use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const APP_NAME: &str = "Yeti Talki";

/// How long to wait for PipeWire to accept a stream before giving up
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

enum StreamCommand {
    Stop,
}

/// Thread plus stop channel for one running PipeWire stream
struct StreamThread {
    sender: Option<pw::channel::Sender<StreamCommand>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn stop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(StreamCommand::Stop);
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("PipeWire stream thread panicked");
            }
        }
    }
}

impl InputStream for StreamThread {
    fn stop(&mut self) {
        StreamThread::stop(self);
    }
}

impl OutputStream for StreamThread {
    fn stop(&mut self) {
        StreamThread::stop(self);
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn a stream thread and wait until it reports that the stream connected
fn spawn_stream<F>(name: &str, run: F) -> Result<StreamThread, String>
where
    F: FnOnce(pw::channel::Receiver<StreamCommand>, mpsc::Sender<Result<(), String>>)
        + Send
        + 'static,
{
    let (sender, receiver) = pw::channel::channel::<StreamCommand>();
    let (ready_tx, ready_rx) = mpsc::channel();

    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || run(receiver, ready_tx))
        .map_err(|e| format!("Failed to spawn {} thread: {}", name, e))?;

    let mut stream = StreamThread {
        sender: Some(sender),
        handle: Some(handle),
    };

    match ready_rx.recv_timeout(OPEN_TIMEOUT) {
        Ok(Ok(())) => Ok(stream),
        Ok(Err(e)) => {
            stream.stop();
            Err(e)
        }
        Err(_) => {
            stream.stop();
            Err("Timed out waiting for PipeWire stream".to_string())
        }
    }
}

/// Serialize an F32LE raw audio EnumFormat pod
fn f32_format_pod(channels: Option<u32>, rate: Option<u32>) -> Result<Vec<u8>, String> {
    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    if let Some(channels) = channels {
        audio_info.set_channels(channels);
    }
    if let Some(rate) = rate {
        audio_info.set_rate(rate);
    }

    let obj = spa::pod::Object {
        type_: spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
        id: spa::param::ParamType::EnumFormat.as_raw(),
        properties: audio_info.into(),
    };

    Ok(spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(obj),
    )
    .map_err(|e| format!("Failed to serialize audio format: {:?}", e))?
    .0
    .into_inner())
}

/// Update `format` if `param` is a raw audio format
fn parse_raw_format(
    format: &mut spa::param::audio::AudioInfoRaw,
    id: u32,
    param: Option<&Pod>,
) {
    let Some(param) = param else { return };
    if id != spa::param::ParamType::Format.as_raw() {
        return;
    }

    let Ok((media_type, media_subtype)) = format_utils::parse_format(param) else {
        return;
    };
    if media_type != MediaType::Audio || media_subtype != MediaSubtype::Raw {
        return;
    }

    if let Err(e) = format.parse(param) {
        warn!("Failed to parse negotiated audio format: {:?}", e);
    }
}

/// Default PipeWire capture source
#[derive(Debug, Default, Clone)]
pub struct PipeWireMicrophone;

impl PipeWireMicrophone {
    pub fn new() -> Self {
        Self
    }
}

impl InputDevice for PipeWireMicrophone {
    fn open(&self, state: SharedCaptureState) -> Result<Box<dyn InputStream>, CaptureError> {
        let stream = spawn_stream("talki-capture", move |receiver, ready| {
            let thread_state = state.clone();
            if let Err(e) = run_capture_loop(thread_state, receiver, ready.clone()) {
                // Either setup failed (reported through `ready`) or the loop died
                let _ = ready.send(Err(e.clone()));
                state.set_error(e);
            }
        })
        .map_err(CaptureError::DeviceUnavailable)?;
        Ok(Box::new(stream))
    }
}

fn run_capture_loop(
    state: SharedCaptureState,
    receiver: pw::channel::Receiver<StreamCommand>,
    ready: mpsc::Sender<Result<(), String>>,
) -> Result<(), String> {
    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| format!("Failed to create PipeWire main loop: {}", e))?;

    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| format!("Failed to create PipeWire context: {}", e))?;

    let core = context
        .connect_rc(None)
        .map_err(|e| format!("Failed to connect to PipeWire: {}", e))?;

    let mainloop_weak = mainloop.downgrade();
    let _receiver = receiver.attach(mainloop.loop_(), move |cmd| match cmd {
        StreamCommand::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        state: SharedCaptureState,
    }

    let user_data = UserData {
        format: Default::default(),
        state,
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::MEDIA_ROLE => "Communication",
        *pw::keys::APP_NAME => APP_NAME,
    };

    let stream = pw::stream::StreamBox::new(&core, "talki-capture", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .param_changed(|_, user_data, id, param| {
            parse_raw_format(&mut user_data.format, id, param);
        })
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };

            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let n_channels = user_data.format.channels().max(1) as usize;
            let sample_rate = user_data.format.rate();
            let n_bytes = data.chunk().size() as usize;

            if let Some(raw) = data.data() {
                let raw = &raw[..n_bytes.min(raw.len())];
                // Keep the first channel of each frame
                let mono: Vec<f32> = raw
                    .chunks_exact(std::mem::size_of::<f32>() * n_channels)
                    .map(|frame| f32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]))
                    .collect();
                user_data.state.process_samples(&mono, sample_rate);
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    let values = f32_format_pod(Some(1), None)?;
    let pod = Pod::from_bytes(&values).ok_or("Failed to build audio format pod")?;
    let mut params = [pod];

    stream
        .connect(
            spa::utils::Direction::Input,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect capture stream: {}", e))?;

    let _ = ready.send(Ok(()));
    debug!("PipeWire capture loop running");
    mainloop.run();
    Ok(())
}

/// Default PipeWire playback sink
#[derive(Debug, Default, Clone)]
pub struct PipeWireSpeaker;

impl PipeWireSpeaker {
    pub fn new() -> Self {
        Self
    }
}

impl OutputDevice for PipeWireSpeaker {
    fn play(&self, clip: Clip, done: PlaybackDone) -> Result<Box<dyn OutputStream>, PlaybackError> {
        let done = Arc::new(Mutex::new(Some(done)));
        let stream = spawn_stream("talki-playback", move |receiver, ready| {
            let result = run_playback_loop(clip, receiver, ready.clone());
            if let Err(e) = &result {
                let _ = ready.send(Err(e.clone()));
            }
            let done = done.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(done) = done {
                let _ = done.send(result);
            }
        })
        .map_err(PlaybackError::DeviceUnavailable)?;
        Ok(Box::new(stream))
    }
}

fn run_playback_loop(
    clip: Clip,
    receiver: pw::channel::Receiver<StreamCommand>,
    ready: mpsc::Sender<Result<(), String>>,
) -> Result<(), String> {
    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| format!("Failed to create PipeWire main loop: {}", e))?;

    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| format!("Failed to create PipeWire context: {}", e))?;

    let core = context
        .connect_rc(None)
        .map_err(|e| format!("Failed to connect to PipeWire: {}", e))?;

    let mainloop_weak = mainloop.downgrade();
    let _receiver = receiver.attach(mainloop.loop_(), move |cmd| match cmd {
        StreamCommand::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        samples: Vec<f32>,
        position: usize,
        mainloop_weak: pw::main_loop::MainLoopWeak,
    }

    let sample_rate = clip.sample_rate;
    let sample_count = clip.samples.len();
    let user_data = UserData {
        format: Default::default(),
        samples: clip.samples,
        position: 0,
        mainloop_weak: mainloop.downgrade(),
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Playback",
        *pw::keys::MEDIA_ROLE => "Communication",
        *pw::keys::APP_NAME => APP_NAME,
    };

    let stream = pw::stream::StreamBox::new(&core, "talki-playback", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .param_changed(|_, user_data, id, param| {
            parse_raw_format(&mut user_data.format, id, param);
        })
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };

            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let n_channels = user_data.format.channels().max(1) as usize;
            let stride = std::mem::size_of::<f32>() * n_channels;

            let Some(slice) = data.data() else {
                return;
            };

            let remaining = user_data.samples.len() - user_data.position;
            if remaining == 0 {
                if let Some(mainloop) = user_data.mainloop_weak.upgrade() {
                    mainloop.quit();
                }
                return;
            }

            let n_frames = (slice.len() / stride).min(remaining);
            let start = user_data.position;
            for (i, &sample) in user_data.samples[start..start + n_frames].iter().enumerate() {
                let bytes = sample.to_le_bytes();
                // Same sample on every channel
                for ch in 0..n_channels {
                    let offset = i * stride + ch * 4;
                    slice[offset..offset + 4].copy_from_slice(&bytes);
                }
            }
            user_data.position += n_frames;

            let written = n_frames * stride;
            slice[written..].fill(0);

            let chunk = data.chunk_mut();
            *chunk.offset_mut() = 0;
            *chunk.stride_mut() = stride as i32;
            *chunk.size_mut() = written as u32;
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    debug!("Playing {} samples at {} Hz", sample_count, sample_rate);
    let values = f32_format_pod(None, Some(sample_rate))?;
    let pod = Pod::from_bytes(&values).ok_or("Failed to build audio format pod")?;
    let mut params = [pod];

    stream
        .connect(
            spa::utils::Direction::Output,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect playback stream: {}", e))?;

    let _ = ready.send(Ok(()));
    mainloop.run();
    Ok(())
}
