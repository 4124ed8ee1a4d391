// =============================================================================
// VIDEO PRESENTER DEMO - test pattern through the transfer-image pool
// =============================================================================
//
// Drives the presentation pipeline the way a capture application would:
// a producer thread writes frames into host-visible transfer images, the
// winit event loop presents the newest one on every redraw.
//
// THREADS:
// ┌─────────────────────────────────────────────────────────────────┐
// │  Producer thread                                                │
// │    └── acquire_image → write test card → queue_image            │
// │                         │ filled queue                          │
// │  Event loop (render thread)                                     │
// │    └── display_queued_image → swapchain                         │
// │                         │ available queue (fence-gated)         │
// │  Producer thread again                                          │
// └─────────────────────────────────────────────────────────────────┘
//
// KEYS:
// D        - toggle deinterlacing (preprocess callback)
// F / F11  - toggle fullscreen
// Q / ESC  - quit
//
// =============================================================================

mod testcard;

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use video_presenter::backend::{VulkanDevice, VulkanPresenter};
use video_presenter::{Config, Display, ImageDescription, VulkanDisplay, VulkanProducer, WindowParameters};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

use testcard::TestCard;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting video presenter");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );

    let source = ImageDescription::new(config.source.width, config.source.height, config.source.vk_format()?);
    log::info!("Source: {} at {} fps", source, config.source.fps);
    log::info!("Present mode: {:?}", config.display.present_mode());

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config, source);
    event_loop.run_app(&mut app)?;

    app.shutdown();
    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Log level from config.toml; RUST_LOG still wins when set.
fn init_logging(config: &Config) {
    use env_logger::Builder;

    let mut builder = Builder::new();
    builder.parse_filters(&config.debug.log_level);
    builder.parse_default_env();
    builder.init();
}

// =============================================================================
// WINDOW SOURCE
// =============================================================================

/// Window size as seen from the render thread. Minimized reads as 0x0.
struct WinitWindow(Arc<Window>);

impl video_presenter::WindowSource for WinitWindow {
    fn window_parameters(&self) -> WindowParameters {
        window_parameters(&self.0)
    }
}

fn window_parameters(window: &Window) -> WindowParameters {
    if window.is_minimized() == Some(true) {
        return WindowParameters::default();
    }
    let size = window.inner_size();
    WindowParameters::new(size.width, size.height)
}

// =============================================================================
// PRODUCER THREAD
// =============================================================================

struct ProducerThread {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

impl ProducerThread {
    fn spawn(
        producer: VulkanProducer,
        card: TestCard,
        description: ImageDescription,
        fps: f64,
        deinterlace: Arc<AtomicBool>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = thread::Builder::new()
            .name("producer".into())
            .spawn({
                let stop = Arc::clone(&stop);
                move || run_producer(producer, card, description, fps, deinterlace, stop)
            })
            .context("Failed to spawn producer thread")?;
        Ok(Self { handle, stop })
    }

    fn join(self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.handle.join().is_err() {
            log::error!("Producer thread panicked");
        }
    }
}

/// Paced at the source frame rate. Frames are discardable, so a slow
/// display drops old frames instead of stalling the producer.
fn run_producer(
    mut producer: VulkanProducer,
    mut card: TestCard,
    description: ImageDescription,
    fps: f64,
    deinterlace: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
) {
    let frame_time = Duration::from_secs_f64(1.0 / fps.max(1.0));
    let mut next_frame = Instant::now();
    let mut superseded = 0u64;

    while !stop.load(Ordering::Relaxed) {
        let mut image = match producer.acquire_image(description) {
            Ok(image) => image,
            Err(e) => {
                log::error!("Producer stopped: {}", e);
                return;
            }
        };

        let row_pitch = image.row_pitch();
        card.render(image.pixels_mut(), row_pitch);
        if deinterlace.load(Ordering::Relaxed) {
            image.set_preprocess(testcard::deinterlace);
        }
        if producer.queue_image(image, true) {
            superseded += 1;
        }

        next_frame += frame_time;
        let now = Instant::now();
        if next_frame > now {
            thread::sleep(next_frame - now);
        } else {
            next_frame = now;
        }
    }

    log::info!(
        "Producer finished: {} transfer images, {} frames superseded",
        producer.image_count(),
        superseded
    );
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the producer thread stops before the
/// display goes, and the display before the window.
struct App {
    // ─────────────────────────────────────────────────────────────────────────
    // CONFIGURATION
    // ─────────────────────────────────────────────────────────────────────────
    config: Config,
    source: ImageDescription,

    // ─────────────────────────────────────────────────────────────────────────
    // PIPELINE
    // ─────────────────────────────────────────────────────────────────────────
    producer: Option<ProducerThread>,
    display: Option<VulkanDisplay>,
    deinterlace: Arc<AtomicBool>,

    // ─────────────────────────────────────────────────────────────────────────
    // WINDOW
    // ─────────────────────────────────────────────────────────────────────────
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // FPS TRACKING
    // ─────────────────────────────────────────────────────────────────────────
    presented: u32,
    idle_cycles: u32,
    last_fps_report: Instant,

    /// First unrecoverable error; returned from main.
    fatal: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config, source: ImageDescription) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let deinterlace = Arc::new(AtomicBool::new(config.source.deinterlace));
        Self {
            config,
            source,
            producer: None,
            display: None,
            deinterlace,
            window: None,
            is_fullscreen,
            presented: 0,
            idle_cycles: 0,
            last_fps_report: Instant::now(),
            fatal: None,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    /// Bring up the device, presenter, display and producer thread for `window`.
    fn init_pipeline(&mut self, window: &Arc<Window>) -> Result<()> {
        let card = TestCard::new(self.source)?;

        let device = VulkanDevice::new(
            &self.config.window.title,
            self.config.debug.validation_layers,
            self.config.display.gpu_index,
            &**window,
        )?;

        let presenter = VulkanPresenter::new(Arc::clone(&device), &self.config.display, window_parameters(window))?;
        let (display, producer) = Display::new(
            device,
            presenter,
            Box::new(WinitWindow(Arc::clone(window))),
            &self.config.display,
        )?;

        if !producer.is_image_description_supported(self.source)? {
            anyhow::bail!("Source format {} cannot be displayed on this GPU", self.source);
        }
        log::info!(
            "Vulkan {}.{}, YCbCr conversion {}",
            ash::vk::api_version_major(producer.vulkan_version()),
            ash::vk::api_version_minor(producer.vulkan_version()),
            if producer.is_ycbcr_supported() { "available" } else { "unavailable" }
        );

        self.producer = Some(ProducerThread::spawn(
            producer,
            card,
            self.source,
            self.config.source.fps,
            Arc::clone(&self.deinterlace),
        )?);
        self.display = Some(display);
        Ok(())
    }

    // =========================================================================
    // FRAME
    // =========================================================================

    fn present_next(&mut self, event_loop: &ActiveEventLoop) {
        let Some(display) = self.display.as_mut() else {
            return;
        };

        match display.display_queued_image() {
            Ok(true) => self.presented += 1,
            Ok(false) => self.idle_cycles += 1,
            Err(e) => {
                log::error!("Display failed: {}", e);
                self.fail(event_loop, e.into());
                return;
            }
        }
        self.report_fps();
    }

    fn report_fps(&mut self) {
        let interval = self.config.debug.fps_report_secs;
        if interval == 0 {
            return;
        }

        let elapsed = self.last_fps_report.elapsed();
        if elapsed < Duration::from_secs(interval) {
            return;
        }

        let fps = self.presented as f64 / elapsed.as_secs_f64();
        let in_flight = self.display.as_ref().map_or(0, |d| d.in_flight_count());
        log::info!(
            "{:.1} fps presented, {} empty cycles, {} frames in flight",
            fps,
            self.idle_cycles,
            in_flight
        );

        if let Some(ref window) = self.window {
            let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
            window.set_title(&format!("{} - {:.0} FPS [{}]", self.config.window.title, fps, mode));
        }

        self.presented = 0;
        self.idle_cycles = 0;
        self.last_fps_report = Instant::now();
    }

    // =========================================================================
    // CONTROLS
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // The resulting Resized event recreates the swapchain.
        }
    }

    fn toggle_deinterlace(&mut self) {
        let enabled = !self.deinterlace.fetch_xor(true, Ordering::Relaxed);
        log::info!("Deinterlacing {}", if enabled { "on" } else { "off" });
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        event_loop.exit();
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================

    /// Stop the producer, then release every GPU object. Safe to call twice.
    fn shutdown(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.join();
        }
        if let Some(mut display) = self.display.take() {
            log::info!("Cleaning up Vulkan resources...");
            if let Err(e) = display.destroy() {
                log::error!("Display teardown failed: {}", e);
            }
        }
        self.window = None;
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ))
            .with_resizable(!self.config.window.fixed_size);

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                self.fail(event_loop, anyhow::anyhow!("Failed to create window: {}", e));
                return;
            }
        };

        if let Err(e) = self.init_pipeline(&window) {
            log::error!("Failed to initialize video pipeline: {:#}", e);
            self.fail(event_loop, e);
            return;
        }

        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: winit::window::WindowId, event: WindowEvent) {
        match event {
            // ─────────────────────────────────────────────────────────────────
            // CLOSE REQUEST
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            // ─────────────────────────────────────────────────────────────────
            // WINDOW RESIZED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                let parameters = WindowParameters::new(size.width, size.height);
                if let Some(display) = self.display.as_mut() {
                    if let Err(e) = display.window_parameters_changed(parameters) {
                        log::error!("Swapchain recreation failed: {}", e);
                        self.fail(event_loop, e.into());
                    }
                }
            }

            // ─────────────────────────────────────────────────────────────────
            // REDRAW REQUESTED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::RedrawRequested => self.present_next(event_loop),

            // ─────────────────────────────────────────────────────────────────
            // KEYBOARD INPUT
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && !event.repeat {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape | KeyCode::KeyQ => {
                                log::info!("Quit requested, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 | KeyCode::KeyF => self.toggle_fullscreen(),
                            KeyCode::KeyD => self.toggle_deinterlace(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Keep redrawing; the display blocks briefly on the filled queue.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        self.shutdown();
        log::info!("Cleanup complete");
    }
}
