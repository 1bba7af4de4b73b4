//! Capture session lifecycle
//!
//! `Idle -> Configuring -> Streaming -> Stopping -> Idle`. Starting programs
//! the tuner, builds the pool, queue and assembler, starts the consumer
//! thread and then the isochronous stream. Any failure on the way unwinds
//! everything already started. Reconfiguring a streaming session is always
//! stop-then-start.

use crate::capture::assembler::FrameAssembler;
use crate::capture::pool::{CapturedFrame, FramePool, MIN_POOL_SIZE, OutputQueue, output_queue};
use crate::usb::transfers::write_registers;
use crate::usb::{IsoConfig, RegisterWriteError, TransportError, UrbTransport, UsbFs};
use common::{CaptureStats, StatsSnapshot};
use nix::errno::Errno;
use protocol::registers::{
    USBTV_ISOC_PACKETS_PER_REQUEST, USBTV_ISOC_TRANSFERS, USBTV_VIDEO_EP, VIDEO_INIT, input_registers,
    norm_registers,
};
use protocol::{FieldGeometry, PACKET_SIZE, ProtocolError, ScanType, TvInput, TvNorm};
use serde::Serialize;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Receives every finished frame on the consumer thread
///
/// The frame's pool slot is released when the frame is dropped.
pub trait FrameConsumer: Send + 'static {
    fn on_frame(&mut self, frame: CapturedFrame);
}

impl<F> FrameConsumer for F
where
    F: FnMut(CapturedFrame) + Send + 'static,
{
    fn on_frame(&mut self, frame: CapturedFrame) {
        self(frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Configuring,
    Streaming,
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Configuring => "configuring",
            SessionState::Streaming => "streaming",
            SessionState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is {actual}, expected {expected}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    #[error(transparent)]
    Register(#[from] RegisterWriteError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("invalid session parameters: {0}")]
    InvalidParams(String),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: io::Error,
    },

    #[error("failed to select alternate setting: {0}")]
    Interface(Errno),

    #[error("frame consumer was lost in an earlier failure")]
    ConsumerLost,
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Everything a session needs to know about the device and the picture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    pub norm: TvNorm,
    pub input: TvInput,
    pub scan: ScanType,
    pub frame_pool_size: usize,
    pub interface: u32,
    /// Alternate setting that carries the isochronous video endpoint
    pub alt_setting: u32,
    pub endpoint: u8,
    pub max_packet_size: usize,
    pub iso_transfers: usize,
    pub packets_per_transfer: usize,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            norm: TvNorm::Ntsc,
            input: TvInput::Composite,
            scan: ScanType::Progressive,
            frame_pool_size: 4,
            interface: 0,
            alt_setting: 1,
            endpoint: USBTV_VIDEO_EP,
            max_packet_size: 3 * PACKET_SIZE,
            iso_transfers: USBTV_ISOC_TRANSFERS,
            packets_per_transfer: USBTV_ISOC_PACKETS_PER_REQUEST,
        }
    }
}

impl SessionParams {
    pub fn validate(&self) -> Result<()> {
        if self.frame_pool_size < MIN_POOL_SIZE {
            return Err(SessionError::InvalidParams(format!(
                "frame pool size must be at least {}, got {}",
                MIN_POOL_SIZE, self.frame_pool_size
            )));
        }
        if self.endpoint & 0x80 == 0 {
            return Err(SessionError::InvalidParams(format!(
                "video endpoint {:#04x} is not an IN endpoint",
                self.endpoint
            )));
        }
        if self.max_packet_size == 0 || self.max_packet_size % PACKET_SIZE != 0 {
            return Err(SessionError::InvalidParams(format!(
                "max packet size {} is not a multiple of {}",
                self.max_packet_size, PACKET_SIZE
            )));
        }
        if self.iso_transfers == 0 || self.packets_per_transfer == 0 {
            return Err(SessionError::InvalidParams(
                "isochronous transfer and packet counts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    fn iso_config(&self) -> IsoConfig {
        IsoConfig {
            count: self.iso_transfers,
            endpoint: self.endpoint,
            packet_size: self.max_packet_size,
            packets_per_transfer: self.packets_per_transfer,
        }
    }
}

/// Counters reported when a session stops
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StopSummary {
    pub frames_emitted: u64,
    pub dropped_frames: u64,
    pub incomplete_frames: u64,
    pub pool_spins: u64,
    /// Pool slots still claimed after teardown; always 0 unless a consumer leaked a frame
    pub locked_slots: usize,
}

const CONSUMER_THREAD: &str = "frame-consumer";

/// Joins to the consumer, unless the thread never got hold of it
type ConsumerHandle = JoinHandle<Option<Box<dyn FrameConsumer>>>;

/// Pieces that only exist while streaming
struct Streaming {
    geometry: FieldGeometry,
    pool: Arc<FramePool>,
    queue: OutputQueue,
    consumer_running: Arc<AtomicBool>,
    consumer: ConsumerHandle,
}

/// One capture device and its streaming state
pub struct CaptureSession {
    transport: UrbTransport,
    params: SessionParams,
    stats: Arc<CaptureStats>,
    state: SessionState,
    consumer: Option<Box<dyn FrameConsumer>>,
    streaming: Option<Streaming>,
}

impl CaptureSession {
    /// Wrap an opened device; nothing is sent to it until [`CaptureSession::start`]
    pub fn new(fs: Arc<dyn UsbFs>, params: SessionParams, consumer: impl FrameConsumer) -> Self {
        let stats = Arc::new(CaptureStats::new());
        Self {
            transport: UrbTransport::new(fs, Arc::clone(&stats)),
            params,
            stats,
            state: SessionState::Idle,
            consumer: Some(Box::new(consumer)),
            streaming: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Streaming with the device still attached
    ///
    /// [`CaptureSession::state`] stays `Streaming` after a device loss until
    /// [`CaptureSession::poll_device`] or [`CaptureSession::stop`] tears down.
    pub fn is_streaming(&self) -> bool {
        self.state == SessionState::Streaming && !self.transport.is_stopped()
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn stats(&self) -> &Arc<CaptureStats> {
        &self.stats
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn transport(&self) -> &UrbTransport {
        &self.transport
    }

    /// Geometry of the running stream
    pub fn geometry(&self) -> Option<FieldGeometry> {
        self.streaming.as_ref().map(|s| s.geometry)
    }

    /// Pool slots currently claimed, if streaming
    pub fn locked_slots(&self) -> Option<usize> {
        self.streaming.as_ref().map(|s| s.pool.locked_count())
    }

    /// The transport hit a fatal error
    pub fn is_device_lost(&self) -> bool {
        self.transport.is_stopped()
    }

    /// Check the transport once and tear down if the device went away
    ///
    /// Meant to be called once per iteration of the owner's loop. Returns the
    /// summary of the session that ended, or `None` while streaming is fine.
    pub fn poll_device(&mut self) -> Option<StopSummary> {
        if self.state != SessionState::Streaming || !self.transport.is_stopped() {
            return None;
        }
        error!("Device lost while streaming");
        self.stop()
    }

    /// Program the tuner and start streaming
    ///
    /// On failure the session is back in `Idle` with nothing left running.
    pub fn start(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(SessionError::InvalidState {
                expected: SessionState::Idle,
                actual: self.state,
            });
        }
        self.params.validate()?;

        self.state = SessionState::Configuring;
        info!(
            "Starting capture: {} {} {}, pool of {}",
            self.params.norm, self.params.input, self.params.scan, self.params.frame_pool_size
        );

        match self.configure() {
            Ok(()) => {
                self.state = SessionState::Streaming;
                self.stats.mark_started();
                info!("Capture streaming");
                Ok(())
            }
            Err(e) => {
                error!("Capture start failed: {}", e);
                self.teardown();
                self.state = SessionState::Idle;
                Err(e)
            }
        }
    }

    fn configure(&mut self) -> Result<()> {
        self.stats.reset();
        let fs = Arc::clone(self.transport.device());
        let params = self.params;

        fs.set_interface(params.interface, 0)
            .map_err(SessionError::Interface)?;
        write_registers(&*fs, VIDEO_INIT)?;
        write_registers(&*fs, norm_registers(params.norm))?;
        write_registers(&*fs, input_registers(params.input))?;

        let geometry = FieldGeometry::for_norm(params.norm, params.scan)?;
        debug!(
            "Field geometry: {}x{}, {} packets per field",
            geometry.width, geometry.height, geometry.packets_per_field
        );

        let pool = Arc::new(FramePool::new(
            params.frame_pool_size,
            geometry,
            Arc::clone(&self.stats),
        ));
        let queue = output_queue(pool.size());
        let mut assembler = FrameAssembler::new(Arc::clone(&pool), queue.clone(), Arc::clone(&self.stats));

        let consumer = self.consumer.take().ok_or(SessionError::ConsumerLost)?;
        let consumer_running = Arc::new(AtomicBool::new(true));
        let builder = thread::Builder::new().name(CONSUMER_THREAD.into());
        let running = Arc::clone(&consumer_running);
        let handle = match spawn_consumer(builder, queue.clone(), running, consumer) {
            Ok(handle) => handle,
            Err((source, consumer)) => {
                self.consumer = consumer;
                return Err(SessionError::Spawn {
                    name: CONSUMER_THREAD,
                    source,
                });
            }
        };
        self.streaming = Some(Streaming {
            geometry,
            pool,
            queue,
            consumer_running,
            consumer: handle,
        });

        fs.set_interface(params.interface, params.alt_setting)
            .map_err(SessionError::Interface)?;
        self.transport
            .init_isochronous(params.iso_config(), move |transfer| {
                assembler.on_iso_transfer(transfer)
            })?;
        self.transport.start_async_reap()?;
        Ok(())
    }

    /// Stop streaming and report the session's counters
    ///
    /// Returns `None` if the session was not streaming.
    pub fn stop(&mut self) -> Option<StopSummary> {
        if self.state != SessionState::Streaming {
            return None;
        }
        self.state = SessionState::Stopping;
        info!("Stopping capture");

        let locked_slots = self.teardown();
        self.state = SessionState::Idle;

        let summary = StopSummary {
            frames_emitted: self.stats.frames_emitted(),
            dropped_frames: self.stats.dropped_frames(),
            incomplete_frames: self.stats.incomplete_frames(),
            pool_spins: self.stats.pool_spins(),
            locked_slots,
        };
        info!(
            "Capture stopped: {} frames, {} dropped, {} incomplete, {} pool spins",
            summary.frames_emitted, summary.dropped_frames, summary.incomplete_frames, summary.pool_spins
        );
        Some(summary)
    }

    /// Undo whatever part of `configure` ran; returns slots left claimed
    fn teardown(&mut self) -> usize {
        if let Some(streaming) = &self.streaming {
            streaming.pool.begin_stop();
            streaming.consumer_running.store(false, Ordering::Release);
            if streaming.queue.try_push(None).is_err() {
                streaming.queue.close();
            }
        }

        // joins the reap thread and drops the assembler
        self.transport.free_all();

        let mut locked_slots = 0;
        if let Some(streaming) = self.streaming.take() {
            match streaming.consumer.join() {
                Ok(consumer) => self.consumer = consumer,
                Err(_) => error!("Frame consumer thread panicked"),
            }

            let discarded = streaming.queue.drain().flatten().count();
            if discarded > 0 {
                debug!("Released {} queued frames", discarded);
            }
            locked_slots = streaming.pool.locked_count();
            if locked_slots > 0 {
                warn!("{} frame slots still claimed after stop", locked_slots);
            }
        }

        let fs = self.transport.device();
        if let Err(e) = fs.set_interface(self.params.interface, 0) {
            debug!("Failed to reset alternate setting: {}", e);
        }
        locked_slots
    }

    fn reconfigure(&mut self, apply: impl FnOnce(&mut SessionParams)) -> Result<()> {
        let restart = self.stop().is_some();
        apply(&mut self.params);
        if restart { self.start() } else { Ok(()) }
    }

    pub fn set_tv_norm(&mut self, norm: TvNorm) -> Result<()> {
        self.reconfigure(|p| p.norm = norm)
    }

    pub fn set_input(&mut self, input: TvInput) -> Result<()> {
        self.reconfigure(|p| p.input = input)
    }

    pub fn set_scan_type(&mut self, scan: ScanType) -> Result<()> {
        self.reconfigure(|p| p.scan = scan)
    }

    pub fn set_frame_pool_size(&mut self, size: usize) -> Result<()> {
        if size < MIN_POOL_SIZE {
            return Err(SessionError::InvalidParams(format!(
                "frame pool size must be at least {}, got {}",
                MIN_POOL_SIZE, size
            )));
        }
        self.reconfigure(|p| p.frame_pool_size = size)
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSession")
            .field("state", &self.state)
            .field("params", &self.params)
            .field("transport", &self.transport)
            .finish()
    }
}

/// Start the consumer thread
///
/// The consumer travels through a shared slot so it is handed back if the
/// thread cannot be created.
fn spawn_consumer(
    builder: thread::Builder,
    queue: OutputQueue,
    running: Arc<AtomicBool>,
    consumer: Box<dyn FrameConsumer>,
) -> std::result::Result<ConsumerHandle, (io::Error, Option<Box<dyn FrameConsumer>>)> {
    let slot = Arc::new(Mutex::new(Some(consumer)));
    let handoff = Arc::clone(&slot);
    builder
        .spawn(move || {
            let consumer = handoff.lock().unwrap_or_else(PoisonError::into_inner).take();
            consumer.map(|consumer| consume(queue, running, consumer))
        })
        .map_err(|e| (e, slot.lock().unwrap_or_else(PoisonError::into_inner).take()))
}

/// Consumer thread body; hands the consumer back when done
fn consume(
    queue: OutputQueue,
    running: Arc<AtomicBool>,
    mut consumer: Box<dyn FrameConsumer>,
) -> Box<dyn FrameConsumer> {
    debug!("Frame consumer started");
    while running.load(Ordering::Acquire) {
        match queue.pop() {
            Some(Some(frame)) => {
                // a no-op under `panic = "abort"`, which the release profile sets
                if panic::catch_unwind(AssertUnwindSafe(|| consumer.on_frame(frame))).is_err() {
                    error!("Frame consumer panicked");
                }
            }
            // sentinel, or the queue was closed
            Some(None) | None => break,
        }
    }
    debug!("Frame consumer stopped");
    consumer
}
