//! H.264/H.265 decoder built on FFmpeg, writing straight into pool frames.
//!
//! Hardware acceleration is probed in platform order and the first working
//! device type is cached per codec, so only the first session pays for
//! detection. A failed probe or a failed hardware open falls back to
//! software decoding; the session reports that as a soft error and keeps
//! streaming.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Once, OnceLock};
use std::time::Instant;

use ffmpeg_next as ffmpeg;

use ffmpeg::ffi;
use ffmpeg::format::Pixel;

use crate::demux::EncodedPacket;
use crate::frame::{copy_plane, deinterleave_uv};
use crate::mailbox::Mailbox;
use crate::metrics::Metrics;
use crate::queue::FrameQueue;
use crate::MediaError;

#[cfg(unix)]
use libc::EAGAIN;
#[cfg(not(unix))]
const EAGAIN: i32 = 11;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    pub fn from_name(name: &str) -> Self {
        match name {
            "h265" | "hevc" => VideoCodec::H265,
            _ => VideoCodec::H264,
        }
    }

    fn id(self) -> ffmpeg::codec::Id {
        match self {
            VideoCodec::H264 => ffmpeg::codec::Id::H264,
            VideoCodec::H265 => ffmpeg::codec::Id::HEVC,
        }
    }

    fn label(self) -> &'static str {
        match self {
            VideoCodec::H264 => "H.264",
            VideoCodec::H265 => "H.265",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DecoderConfig {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub prefer_hardware: bool,
    /// Keep NV12 output interleaved and let the renderer sample UV as a
    /// two-channel texture instead of splitting planes on the CPU.
    pub semi_planar_passthrough: bool,
}

#[cfg(windows)]
const HW_DEVICE_PRIORITY: &[ffi::AVHWDeviceType] = &[
    ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_D3D11VA,
    ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_DXVA2,
    ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA,
];
#[cfg(target_os = "macos")]
const HW_DEVICE_PRIORITY: &[ffi::AVHWDeviceType] =
    &[ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VIDEOTOOLBOX];
#[cfg(all(unix, not(target_os = "macos")))]
const HW_DEVICE_PRIORITY: &[ffi::AVHWDeviceType] = &[
    ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
    ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VDPAU,
    ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA,
];
#[cfg(not(any(unix, windows)))]
const HW_DEVICE_PRIORITY: &[ffi::AVHWDeviceType] = &[];

#[derive(Clone)]
struct CachedProbe {
    device_type: ffi::AVHWDeviceType,
    pix_fmt: ffi::AVPixelFormat,
    name: String,
}

/// One probe per codec per process; subsequent sessions reuse the result.
fn probe_cache() -> &'static Mutex<HashMap<i32, Option<CachedProbe>>> {
    static CACHE: OnceLock<Mutex<HashMap<i32, Option<CachedProbe>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Pixel format negotiated with the codec, read by the get_format callback.
static HW_PIX_FMT: AtomicI32 = AtomicI32::new(ffi::AVPixelFormat::AV_PIX_FMT_NONE as i32);

unsafe extern "C" fn select_hw_format(
    _ctx: *mut ffi::AVCodecContext,
    mut formats: *const ffi::AVPixelFormat,
) -> ffi::AVPixelFormat {
    let wanted = HW_PIX_FMT.load(Ordering::Relaxed);
    while *formats as i32 != ffi::AVPixelFormat::AV_PIX_FMT_NONE as i32 {
        if *formats as i32 == wanted {
            return *formats;
        }
        formats = formats.add(1);
    }
    log::warn!("decoder: negotiated formats exclude the probed hardware format");
    ffi::AVPixelFormat::AV_PIX_FMT_NONE
}

fn ffmpeg_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        if let Err(err) = ffmpeg::init() {
            log::error!("ffmpeg init failed: {err}");
        }
        // Frame-level chatter from the codec is too loud for session logs.
        ffmpeg::log::set_level(ffmpeg::log::Level::Warning);
    });
}

fn probe_hardware(kind: VideoCodec, codec: &ffmpeg::Codec) -> Option<CachedProbe> {
    let key = match kind {
        VideoCodec::H264 => 0,
        VideoCodec::H265 => 1,
    };
    let mut cache = probe_cache().lock().expect("probe cache");
    if let Some(entry) = cache.get(&key) {
        return entry.clone();
    }

    let mut found = None;
    'outer: for &device_type in HW_DEVICE_PRIORITY {
        let mut index = 0;
        loop {
            let config = unsafe { ffi::avcodec_get_hw_config(codec.as_ptr(), index) };
            if config.is_null() {
                break;
            }
            index += 1;
            let config = unsafe { &*config };
            let supports_device_ctx = config.methods
                & ffi::AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX as i32
                != 0;
            if !supports_device_ctx || config.device_type != device_type {
                continue;
            }

            let mut device_ref: *mut ffi::AVBufferRef = std::ptr::null_mut();
            let rc = unsafe {
                ffi::av_hwdevice_ctx_create(
                    &mut device_ref,
                    device_type,
                    std::ptr::null(),
                    std::ptr::null_mut(),
                    0,
                )
            };
            let name = unsafe {
                let raw = ffi::av_hwdevice_get_type_name(device_type);
                if raw.is_null() {
                    String::from("unknown")
                } else {
                    std::ffi::CStr::from_ptr(raw).to_string_lossy().into_owned()
                }
            };
            if rc >= 0 {
                unsafe { ffi::av_buffer_unref(&mut device_ref) };
                log::info!("decoder: hardware backend {name} available");
                found = Some(CachedProbe {
                    device_type,
                    pix_fmt: config.pix_fmt,
                    name,
                });
                break 'outer;
            }
            log::debug!("decoder: hardware backend {name} rejected ({rc})");
        }
    }

    if found.is_none() {
        log::info!("decoder: no hardware backend, using software decode");
    }
    cache.insert(key, found.clone());
    found
}

pub struct VideoDecoder {
    decoder: ffmpeg::decoder::Video,
    hw_device: *mut ffi::AVBufferRef,
    hw_pix_fmt: Option<Pixel>,
    hw_backend: Option<String>,
    fell_back: bool,

    queue: Arc<FrameQueue>,
    mailbox: Arc<Mailbox>,
    metrics: Arc<Metrics>,
    semi_planar_passthrough: bool,

    hw_frame: ffmpeg::frame::Video,
    sw_frame: ffmpeg::frame::Video,
    sequence: u64,
    last_size: (u32, u32),
    fps_window_start: Instant,
    fps_frames: u32,
}

// The raw hardware-device ref is only touched from the demuxer thread that
// owns the decoder; it is moved, never shared.
unsafe impl Send for VideoDecoder {}

impl VideoDecoder {
    pub fn open(
        cfg: DecoderConfig,
        queue: Arc<FrameQueue>,
        mailbox: Arc<Mailbox>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, MediaError> {
        ffmpeg_init();
        let codec = ffmpeg::decoder::find(cfg.codec.id())
            .ok_or(MediaError::CodecNotFound(cfg.codec.label()))?;

        let probe = if cfg.prefer_hardware {
            probe_hardware(cfg.codec, &codec)
        } else {
            None
        };

        match Self::open_with(&cfg, &codec, probe.as_ref(), &queue, &mailbox, &metrics) {
            Ok(decoder) => Ok(decoder),
            Err(err) if probe.is_some() => {
                // Soft failure: hardware looked usable but would not open.
                log::warn!("decoder: hardware open failed ({err}), falling back to software");
                let mut sw = Self::open_with(&cfg, &codec, None, &queue, &mailbox, &metrics)?;
                sw.fell_back = true;
                Ok(sw)
            }
            Err(err) => Err(err),
        }
    }

    fn open_with(
        cfg: &DecoderConfig,
        codec: &ffmpeg::Codec,
        probe: Option<&CachedProbe>,
        queue: &Arc<FrameQueue>,
        mailbox: &Arc<Mailbox>,
        metrics: &Arc<Metrics>,
    ) -> Result<Self, MediaError> {
        let mut context = ffmpeg::codec::Context::new_with_codec(*codec);
        let mut hw_device: *mut ffi::AVBufferRef = std::ptr::null_mut();

        unsafe {
            let raw = context.as_mut_ptr();
            (*raw).flags |= ffi::AV_CODEC_FLAG_LOW_DELAY as i32;
            (*raw).flags2 |= ffi::AV_CODEC_FLAG2_FAST as i32;
            (*raw).width = cfg.width as i32;
            (*raw).height = cfg.height as i32;
            // H.264 single-threaded keeps reorder latency at zero; HEVC is
            // heavy enough to need slice threads.
            if cfg.codec == VideoCodec::H265 {
                (*raw).thread_count = 4;
            } else {
                (*raw).thread_count = 1;
                (*raw).thread_type = 0;
            }

            if let Some(probe) = probe {
                let rc = ffi::av_hwdevice_ctx_create(
                    &mut hw_device,
                    probe.device_type,
                    std::ptr::null(),
                    std::ptr::null_mut(),
                    0,
                );
                if rc < 0 {
                    return Err(MediaError::DecoderOpenFailed(format!(
                        "hwdevice create failed ({rc})"
                    )));
                }
                HW_PIX_FMT.store(probe.pix_fmt as i32, Ordering::Relaxed);
                (*raw).hw_device_ctx = ffi::av_buffer_ref(hw_device);
                (*raw).get_format = Some(select_hw_format);
            }
        }

        let decoder = context.decoder().video().map_err(|err| {
            unsafe {
                if !hw_device.is_null() {
                    ffi::av_buffer_unref(&mut hw_device);
                }
            }
            MediaError::DecoderOpenFailed(err.to_string())
        })?;

        let hw_pix_fmt = probe.map(|p| Pixel::from(p.pix_fmt));
        let hw_backend = probe.map(|p| p.name.clone());
        log::info!(
            "decoder: opened {} with {}",
            cfg.codec.label(),
            hw_backend.as_deref().unwrap_or("software")
        );

        Ok(Self {
            decoder,
            hw_device,
            hw_pix_fmt,
            hw_backend,
            fell_back: false,
            queue: queue.clone(),
            mailbox: mailbox.clone(),
            metrics: metrics.clone(),
            semi_planar_passthrough: cfg.semi_planar_passthrough,
            hw_frame: ffmpeg::frame::Video::empty(),
            sw_frame: ffmpeg::frame::Video::empty(),
            sequence: 0,
            last_size: (0, 0),
            fps_window_start: Instant::now(),
            fps_frames: 0,
        })
    }

    pub fn hardware_backend(&self) -> Option<&str> {
        self.hw_backend.as_deref()
    }

    pub fn fell_back_to_software(&self) -> bool {
        self.fell_back
    }

    /// Feed one encoded packet and drain every frame the codec has ready.
    pub fn decode(&mut self, packet: &EncodedPacket) -> Result<(), MediaError> {
        let started = Instant::now();

        let mut av_packet = ffmpeg::Packet::copy(&packet.data);
        av_packet.set_pts(Some(packet.pts));
        av_packet.set_dts(Some(packet.pts));
        if packet.key_frame {
            av_packet.set_flags(ffmpeg::packet::Flags::KEY);
        }

        self.decoder
            .send_packet(&av_packet)
            .map_err(|err| MediaError::FrameDecodeFailed(err.to_string()))?;

        loop {
            let is_hw = self.hw_pix_fmt.is_some();
            let receive = if is_hw {
                self.decoder.receive_frame(&mut self.hw_frame)
            } else {
                self.decoder.receive_frame(&mut self.sw_frame)
            };

            match receive {
                Ok(()) => {
                    if is_hw && self.hw_frame.format() == self.hw_pix_fmt.unwrap_or(Pixel::None) {
                        self.transfer_hw_frame()?;
                    } else if is_hw {
                        // Codec negotiated software output despite the
                        // device context; the frame is already CPU-visible.
                        std::mem::swap(&mut self.sw_frame, &mut self.hw_frame);
                    }
                    // Latency includes the GPU readback, which is the part
                    // that actually hurts.
                    self.metrics
                        .report_decode_latency(started.elapsed().as_secs_f64() * 1000.0);
                    self.deliver_frame(packet.pts);
                }
                Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => break,
                Err(ffmpeg::Error::Eof) => break,
                Err(err) => {
                    return Err(MediaError::FrameDecodeFailed(err.to_string()));
                }
            }
        }
        Ok(())
    }

    fn transfer_hw_frame(&mut self) -> Result<(), MediaError> {
        unsafe {
            ffi::av_frame_unref(self.sw_frame.as_mut_ptr());
            let rc = ffi::av_hwframe_transfer_data(self.sw_frame.as_mut_ptr(), self.hw_frame.as_ptr(), 0);
            if rc < 0 {
                return Err(MediaError::FrameDecodeFailed(format!(
                    "hardware frame transfer failed ({rc})"
                )));
            }
            (*self.sw_frame.as_mut_ptr()).pts = (*self.hw_frame.as_ptr()).pts;
            (*self.sw_frame.as_mut_ptr()).width = (*self.hw_frame.as_ptr()).width;
            (*self.sw_frame.as_mut_ptr()).height = (*self.hw_frame.as_ptr()).height;
        }
        Ok(())
    }

    fn deliver_frame(&mut self, fallback_pts: i64) {
        let width = self.sw_frame.width();
        let height = self.sw_frame.height();
        if width == 0 || height == 0 {
            return;
        }
        let format = self.sw_frame.format();
        let is_nv12 = format == Pixel::NV12;
        if !is_nv12 && format != Pixel::YUV420P {
            log::warn!("decoder: unsupported pixel format {format:?}");
            return;
        }

        if self.last_size != (0, 0) && self.last_size != (width, height) {
            log::info!(
                "decoder: resolution changed {}x{} -> {width}x{height}",
                self.last_size.0,
                self.last_size.1
            );
        }
        self.last_size = (width, height);

        self.metrics.report_frame_decoded();
        self.update_fps();

        if self.queue.pool().dimensions() != (width, height) {
            // Old-size frames still queued would reach the renderer after
            // the switch; drain them first, then republish dimensions.
            self.queue.clear();
            self.queue.resize(width, height);
        }

        let Some(mut pool_frame) = self.queue.acquire() else {
            self.metrics.report_frame_dropped();
            return;
        };
        let geometry = pool_frame.geometry();
        if (geometry.width, geometry.height) != (width, height) {
            // A slot released after the resize still carrying the old
            // allocation; skip this frame rather than mix dimensions.
            log::warn!("decoder: stale pool frame after resize, skipping");
            self.metrics.report_frame_dropped();
            return;
        }

        let rows = height as usize;
        let chroma_rows = rows / 2;
        let row_bytes = width as usize;
        let chroma_bytes = row_bytes / 2;
        let semi_planar = is_nv12 && self.semi_planar_passthrough;

        {
            let src_stride_y = self.sw_frame.stride(0);
            let src_y = self.sw_frame.data(0);
            let buffer = pool_frame.buffer_mut();
            copy_plane(
                buffer.plane_y_mut(),
                geometry.stride_y,
                src_y,
                src_stride_y,
                row_bytes,
                rows,
            );
        }

        if is_nv12 {
            let src_stride_uv = self.sw_frame.stride(1);
            let src_uv = self.sw_frame.data(1);
            let buffer = pool_frame.buffer_mut();
            if semi_planar {
                copy_plane(
                    buffer.plane_uv_mut(),
                    geometry.stride_uv,
                    src_uv,
                    src_stride_uv,
                    row_bytes,
                    chroma_rows,
                );
            } else {
                // Split interleaved UV so the planar render path works.
                let (u, rest) = buffer_split_u_v(buffer);
                deinterleave_uv(
                    u,
                    rest,
                    geometry.stride_u,
                    src_uv,
                    src_stride_uv,
                    chroma_bytes,
                    chroma_rows,
                );
            }
        } else {
            let src_stride_u = self.sw_frame.stride(1);
            let src_stride_v = self.sw_frame.stride(2);
            let src_u = self.sw_frame.data(1);
            let src_v = self.sw_frame.data(2);
            let buffer = pool_frame.buffer_mut();
            copy_plane(
                buffer.plane_u_mut(),
                geometry.stride_u,
                src_u,
                src_stride_u,
                chroma_bytes,
                chroma_rows,
            );
            copy_plane(
                buffer.plane_v_mut(),
                geometry.stride_v,
                src_v,
                src_stride_v,
                chroma_bytes,
                chroma_rows,
            );
        }

        self.sequence += 1;
        let meta = pool_frame.meta_mut();
        meta.pts = self.sw_frame.pts().unwrap_or(fallback_pts);
        meta.sequence = self.sequence;
        meta.layout_is_semi_planar = semi_planar;

        if !self.queue.push(pool_frame) {
            log::debug!("decoder: frame queue full, frame returned to pool");
            self.metrics.report_frame_dropped();
        }

        // Hand the renderer the newest frame; the ring absorbs jitter and
        // the mailbox displaces anything the renderer has not drawn yet.
        if let Some(newest) = self.queue.pop_adaptive() {
            self.mailbox.publish(newest);
        }

        self.metrics.report_queue_depth(self.queue.depth() as i64);
        self.metrics.report_pool_usage(
            self.queue.pool().used() as i64,
            self.queue.pool().pool_size() as i64,
        );
    }

    fn update_fps(&mut self) {
        self.fps_frames += 1;
        let elapsed = self.fps_window_start.elapsed();
        if elapsed.as_secs_f64() >= 1.0 {
            let fps = (self.fps_frames as f64 / elapsed.as_secs_f64()).round() as u64;
            self.metrics.report_fps(fps);
            self.fps_frames = 0;
            self.fps_window_start = Instant::now();
        }
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        unsafe {
            if !self.hw_device.is_null() {
                ffi::av_buffer_unref(&mut self.hw_device);
            }
        }
    }
}

/// Borrow the U and V planes of one buffer simultaneously.
fn buffer_split_u_v(buffer: &mut crate::frame::FrameBuffer) -> (&mut [u8], &mut [u8]) {
    let geometry = buffer.geometry();
    let size_u = geometry.size_u();
    let joined = buffer_u_through_v(buffer);
    joined.split_at_mut(size_u)
}

fn buffer_u_through_v(buffer: &mut crate::frame::FrameBuffer) -> &mut [u8] {
    // U and V are contiguous in the slot layout.
    let geometry = buffer.geometry();
    let len = geometry.size_u() + geometry.size_v();
    let u = buffer.plane_u_mut();
    unsafe { std::slice::from_raw_parts_mut(u.as_mut_ptr(), len) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_names_map_to_variants() {
        assert_eq!(VideoCodec::from_name("h264"), VideoCodec::H264);
        assert_eq!(VideoCodec::from_name("hevc"), VideoCodec::H265);
        assert_eq!(VideoCodec::from_name("h265"), VideoCodec::H265);
        assert_eq!(VideoCodec::from_name(""), VideoCodec::H264);
    }

    #[test]
    fn probe_priority_is_platform_specific() {
        // The table must exist and never be empty on desktop targets.
        #[cfg(any(unix, windows))]
        assert!(!HW_DEVICE_PRIORITY.is_empty());
    }
}
