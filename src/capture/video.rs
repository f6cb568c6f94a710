//! PipeWire stream adapter.
//!
//! Connects to the media server over the portal-provided file descriptor,
//! negotiates pixel format / size / framerate, and converts every received
//! buffer into a pool frame on the PipeWire loop thread.

use std::os::fd::OwnedFd;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use pipewire::{
    self as pw,
    context::Context,
    main_loop::MainLoop,
    spa::{
        self,
        buffer::DataType,
        param::format::{MediaSubtype, MediaType},
        param::video::VideoFormat,
        param::ParamType,
        pod::{self as pod, ChoiceValue, Object, Pod, Property, PropertyFlags},
        utils::{Choice, ChoiceEnum, ChoiceFlags, Direction, Id, SpaTypes},
    },
    stream::{Stream, StreamFlags, StreamState},
};
use pw::properties::properties;

use libspa_sys as spa_sys;

use crate::capture::pool::{clamp_crop, copy_frame, CropRegion, FramePool};
use crate::capture::Terminate;
use crate::types::config::CaptureOptions;
use crate::types::error::{CaptureError, CaptureResult};
use crate::types::video_frame::{Codec, Interlacing, VideoFrame};

const DEFAULT_EXPECTING_FPS: u64 = 30;

pub struct VideoCapture {
    options: CaptureOptions,
    pool: FramePool,
    init_tx: mpsc::Sender<CaptureResult<()>>,
}

struct StreamData {
    format: spa::param::video::VideoInfoRaw,
    crop_enabled: bool,
    configured: bool,
    expecting_fps: u64,
    frame_count: u32,
    window_start: Instant,
}

impl VideoCapture {
    pub fn new(
        options: CaptureOptions,
        pool: FramePool,
        init_tx: mpsc::Sender<CaptureResult<()>>,
    ) -> Self {
        Self {
            options,
            pool,
            init_tx,
        }
    }

    /// Run the stream loop until terminated. Blocks the calling thread.
    pub fn run(
        self,
        fd: OwnedFd,
        stream_node: u32,
        termination_recv: pw::channel::Receiver<Terminate>,
    ) -> CaptureResult<()> {
        pw::init();

        let pw_loop = MainLoop::new(None)?;
        let terminate_loop = pw_loop.clone();

        let _recv = termination_recv.attach(pw_loop.loop_(), move |_| {
            log::debug!("terminating screen capture loop");
            terminate_loop.quit();
        });

        let pw_context = Context::new(&pw_loop)?;
        let core = pw_context.connect_fd(fd, None)?;

        let stream = Stream::new(
            &core,
            "uv-screen",
            properties! {
                *pw::keys::MEDIA_TYPE => "Video",
                *pw::keys::MEDIA_CATEGORY => "Capture",
                *pw::keys::MEDIA_ROLE => "Screen",
            },
        )?;

        let data = StreamData {
            format: Default::default(),
            crop_enabled: self.options.crop,
            configured: false,
            expecting_fps: self
                .options
                .fps
                .map(u64::from)
                .filter(|fps| *fps > 0)
                .unwrap_or(DEFAULT_EXPECTING_FPS),
            frame_count: 0,
            window_start: Instant::now(),
        };

        let pool_params = self.pool.clone();
        let init_tx = self.init_tx.clone();
        let init_tx_state = self.init_tx.clone();
        let pool_process = self.pool.clone();

        let _listener = stream
            .add_local_listener_with_user_data(data)
            .state_changed(move |_, _, old, new| {
                log::info!("stream state changed: {:?} -> {:?}", old, new);
                if let StreamState::Error(err) = &new {
                    log::error!("stream error: '{}'", err);
                    // only reaches the facade while init is still pending
                    let _ = init_tx_state.send(Err(CaptureError::MediaNegotiation(err.clone())));
                }
            })
            .param_changed(move |stream, user_data, id, param| {
                let Some(param) = param else {
                    return;
                };
                if id != ParamType::Format.as_raw() {
                    return;
                }

                let (media_type, media_subtype) = match spa::param::format_utils::parse_format(param)
                {
                    Ok(v) => v,
                    Err(_) => return,
                };
                if media_type != MediaType::Video || media_subtype != MediaSubtype::Raw {
                    return;
                }

                user_data
                    .format
                    .parse(param)
                    .expect("failed to parse video format");

                let width = user_data.format.size().width;
                let height = user_data.format.size().height;
                log::debug!(
                    "negotiated {:?} {}x{} @ {}/{}",
                    user_data.format.format(),
                    width,
                    height,
                    user_data.format.framerate().num,
                    user_data.format.framerate().denom
                );

                let linesize = width as i32 * 4;
                let size = linesize * height as i32;

                let buffers_bytes = serialize_pod(&pod::Value::Object(buffers_param(size, linesize)));
                let meta_bytes = serialize_pod(&pod::Value::Object(video_crop_param()));
                let mut params = Vec::with_capacity(2);
                params.push(Pod::from_bytes(&buffers_bytes).unwrap());
                if user_data.crop_enabled {
                    params.push(Pod::from_bytes(&meta_bytes).unwrap());
                }
                if let Err(err) = stream.update_params(&mut params) {
                    log::error!("updating stream params failed: {}", err);
                    let _ = init_tx.send(Err(CaptureError::MediaNegotiation(err.to_string())));
                    return;
                }

                if !user_data.configured {
                    pool_params.seed(width, height, user_data.expecting_fps as f64);
                    user_data.configured = true;
                    let _ = init_tx.send(Ok(()));
                }
            })
            .process(move |stream, user_data| {
                let mut buffers_from_pw = 0;
                while let Some(mut buffer) = stream.dequeue_buffer() {
                    buffers_from_pw += 1;

                    // the VideoCrop meta lives on the underlying spa buffer,
                    // which the safe wrapper does not surface
                    let crop = if user_data.crop_enabled {
                        unsafe { find_video_crop((*buffer.as_raw()).buffer) }
                    } else {
                        None
                    };

                    let datas = buffer.datas_mut();
                    assert_eq!(datas.len(), 1, "expected a single data block");
                    let block = &mut datas[0];

                    let chunk_size = block.chunk().size() as usize;
                    let chunk_offset = block.chunk().offset() as usize;
                    if chunk_size == 0 {
                        log::debug!("dropping empty buffer");
                        continue;
                    }

                    let timeout =
                        Duration::from_millis(1000 / user_data.expecting_fps.max(1));
                    let Some(mut frame) = pool_process.take_blank(timeout) else {
                        log::debug!("dropping frame (blank frame dequeue timed out)");
                        continue;
                    };

                    let width = user_data.format.size().width;
                    let height = user_data.format.size().height;
                    let needed = width as usize * height as usize * 4;

                    // frames seeded before a renegotiation may have stale
                    // geometry
                    if frame.width != width
                        || frame.height != height
                        || frame.buffer_len() < needed
                    {
                        frame = VideoFrame::alloc(
                            width,
                            height,
                            Codec::Rgba,
                            user_data.expecting_fps as f64,
                            Interlacing::Progressive,
                        );
                    }
                    frame.fps = user_data.expecting_fps as f64;

                    let Some(bytes) = block.data() else {
                        log::warn!("buffer without mapped data");
                        pool_process.recycle(frame);
                        continue;
                    };
                    if bytes.len() < chunk_offset + chunk_size || chunk_size < needed {
                        log::warn!("short buffer from server: {} < {}", chunk_size, needed);
                        pool_process.recycle(frame);
                        continue;
                    }
                    let src = &bytes[chunk_offset..][..chunk_size];

                    let crop = crop.and_then(|region| clamp_crop(region, width, height));
                    let swap_red_blue = matches!(
                        user_data.format.format(),
                        VideoFormat::BGRA | VideoFormat::BGRx
                    );
                    copy_frame(swap_red_blue, src, width, height, crop, &mut frame);

                    pool_process.send_filled(frame);

                    user_data.frame_count += 1;
                    let elapsed = user_data.window_start.elapsed();
                    if elapsed >= Duration::from_secs(5) {
                        let average = f64::from(user_data.frame_count) / elapsed.as_secs_f64();
                        log::debug!("average fps in the last 5 seconds: {:.2}", average);
                        user_data.expecting_fps = (average as u64).max(1);
                        user_data.frame_count = 0;
                        user_data.window_start = Instant::now();
                    }
                }
                log::debug!(
                    "from pw: {}\t sending: {}\t blank: {}",
                    buffers_from_pw,
                    pool_process.sending_len(),
                    pool_process.blank_len()
                );
            })
            .register()?;

        let format_obj = pod::object!(
            SpaTypes::ObjectParamFormat,
            ParamType::EnumFormat,
            pod::property!(
                spa::param::format::FormatProperties::MediaType,
                Id,
                MediaType::Video
            ),
            pod::property!(
                spa::param::format::FormatProperties::MediaSubtype,
                Id,
                MediaSubtype::Raw
            ),
            pod::property!(
                spa::param::format::FormatProperties::VideoFormat,
                Choice,
                Enum,
                Id,
                VideoFormat::BGRA,
                VideoFormat::RGBA,
                VideoFormat::BGRx,
                VideoFormat::RGBx,
            ),
            pod::property!(
                spa::param::format::FormatProperties::VideoSize,
                Choice,
                Range,
                Rectangle,
                spa::utils::Rectangle {
                    width: 640,
                    height: 480
                },
                spa::utils::Rectangle {
                    width: 1,
                    height: 1
                },
                spa::utils::Rectangle {
                    width: 3840,
                    height: 2160
                }
            ),
            pod::property!(
                spa::param::format::FormatProperties::VideoFramerate,
                Choice,
                Range,
                Fraction,
                spa::utils::Fraction {
                    num: self.options.fps.filter(|fps| *fps > 0).unwrap_or(30),
                    denom: 1
                },
                spa::utils::Fraction { num: 0, denom: 1 },
                spa::utils::Fraction { num: 600, denom: 1 }
            ),
        );
        let format_bytes = serialize_pod(&pod::Value::Object(format_obj));
        let mut connect_params = [Pod::from_bytes(&format_bytes).unwrap()];

        stream.connect(
            Direction::Input,
            Some(stream_node),
            StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS,
            &mut connect_params,
        )?;

        log::debug!("stream connected: {:?}", stream);

        pw_loop.run();
        Ok(())
    }
}

fn serialize_pod(value: &pod::Value) -> Vec<u8> {
    pod::serialize::PodSerializer::serialize(std::io::Cursor::new(Vec::new()), value)
        .expect("pod serialization cannot fail")
        .0
        .into_inner()
}

/// Buffer layout announced back to the server once the format is known:
/// 2..10 single-block buffers of `stride * height` bytes in plain memory.
fn buffers_param(size: i32, stride: i32) -> Object {
    Object {
        type_: SpaTypes::ObjectParamBuffers.as_raw(),
        id: ParamType::Buffers.as_raw(),
        properties: vec![
            Property {
                key: spa_sys::SPA_PARAM_BUFFERS_buffers,
                flags: PropertyFlags::empty(),
                value: pod::Value::Choice(ChoiceValue::Int(Choice(
                    ChoiceFlags::empty(),
                    ChoiceEnum::Range {
                        default: 2,
                        min: 2,
                        max: 10,
                    },
                ))),
            },
            Property {
                key: spa_sys::SPA_PARAM_BUFFERS_blocks,
                flags: PropertyFlags::empty(),
                value: pod::Value::Int(1),
            },
            Property {
                key: spa_sys::SPA_PARAM_BUFFERS_size,
                flags: PropertyFlags::empty(),
                value: pod::Value::Int(size),
            },
            Property {
                key: spa_sys::SPA_PARAM_BUFFERS_stride,
                flags: PropertyFlags::empty(),
                value: pod::Value::Int(stride),
            },
            Property {
                key: spa_sys::SPA_PARAM_BUFFERS_dataType,
                flags: PropertyFlags::empty(),
                value: pod::Value::Int(1 << DataType::MemPtr.as_raw()),
            },
        ],
    }
}

/// Ask the server to attach VideoCrop metadata to buffers so window
/// captures can drop their empty background.
fn video_crop_param() -> Object {
    Object {
        type_: SpaTypes::ObjectParamMeta.as_raw(),
        id: ParamType::Meta.as_raw(),
        properties: vec![
            Property {
                key: spa_sys::SPA_PARAM_META_type,
                flags: PropertyFlags::empty(),
                value: pod::Value::Id(Id(spa_sys::SPA_META_VideoCrop)),
            },
            Property {
                key: spa_sys::SPA_PARAM_META_size,
                flags: PropertyFlags::empty(),
                value: pod::Value::Int(std::mem::size_of::<spa_sys::spa_meta_region>() as i32),
            },
        ],
    }
}

/// Scan the spa buffer's metas for a valid VideoCrop rectangle. The only
/// raw access in the capture path: buffer metas have no safe API surface.
unsafe fn find_video_crop(buffer: *mut spa_sys::spa_buffer) -> Option<CropRegion> {
    if buffer.is_null() || (*buffer).metas.is_null() || (*buffer).n_metas == 0 {
        return None;
    }
    let metas = std::slice::from_raw_parts((*buffer).metas, (*buffer).n_metas as usize);
    for meta in metas {
        if meta.type_ != spa_sys::SPA_META_VideoCrop {
            continue;
        }
        if (meta.size as usize) < std::mem::size_of::<spa_sys::spa_meta_region>()
            || meta.data.is_null()
        {
            continue;
        }
        let region = (*(meta.data as *const spa_sys::spa_meta_region)).region;
        // a zero-sized rectangle marks the meta as unset
        if region.size.width == 0 || region.size.height == 0 {
            return None;
        }
        return Some(CropRegion {
            x: region.position.x.max(0) as u32,
            y: region.position.y.max(0) as u32,
            width: region.size.width,
            height: region.size.height,
        });
    }
    None
}
