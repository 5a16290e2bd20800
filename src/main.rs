//! kinescope player: plays a motion-JPEG file or stream on an SDL2 window
//! or a headless framebuffer.
//!
//! Usage: `kinescope [config.toml]`, with `KINESCOPE__*` overrides.

use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use kinescope::display::{DisplaySurface, FrameBuffer};
use kinescope::transport::HttpTransport;
use kinescope::{Config, PlaybackSettings, StepOutcome, VideoPlayer};

/// Host tick period.
const TICK: Duration = Duration::from_millis(5);
const INTERVAL_STEP_MS: u32 = 10;

enum Input {
    Continue,
    Quit,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("kinescope=info"));
    let fmt = tracing_subscriber::fmt::layer()
        .with_timer(tracing_subscriber::fmt::time::uptime());
    let registry = tracing_subscriber::registry().with(filter).with(fmt);

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    info!("kinescope launching...");

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    #[cfg(feature = "sdl-display")]
    if !config.display.headless {
        return run_window(config).await;
    }

    let display = FrameBuffer::new(config.display.width, config.display.height);
    let player = build_player(config, display)?;
    drive(player, |_| Input::Continue, shutdown_signal()).await
}

/// Resolves on Ctrl-C. Without a signal handler it never resolves.
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("interrupted");
}

fn build_player<S: DisplaySurface>(config: Config, display: S) -> Result<VideoPlayer<S>> {
    let transport = HttpTransport::new(
        Duration::from_millis(config.player.connect_timeout_ms as u64),
        config.player.queue_depth,
    )?
    .with_handle(tokio::runtime::Handle::current());
    Ok(VideoPlayer::new(config, display)?.with_transport(transport))
}

async fn drive<S: DisplaySurface>(
    mut player: VideoPlayer<S>,
    mut poll_input: impl FnMut(&mut VideoPlayer<S>) -> Input,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let started = Instant::now();
    let now_ms = || started.elapsed().as_millis() as u32;

    player.init(now_ms())?;
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }

        if let Input::Quit = poll_input(&mut player) {
            info!("quit requested");
            break;
        }

        match player.step(now_ms()) {
            Ok(StepOutcome::Stopped) => {
                info!("playback finished");
                break;
            }
            Ok(StepOutcome::Disabled) => break,
            Ok(_) => {}
            Err(err) => warn!(error = %err, "step failed"),
        }
    }

    info!(stats = ?player.stats(), "kinescope shutting down");
    Ok(())
}

/// Flip looping or nudge the frame interval.
fn adjust(
    player: &VideoPlayer<impl DisplaySurface>,
    change: impl FnOnce(&mut PlaybackSettings, u32),
) {
    let settings = player.settings();
    let mut next = **settings.load();
    change(&mut next, player.frame_interval_ms());
    info!(
        looping = next.looping,
        interval_ms = next.update_interval_ms,
        "playback settings"
    );
    settings.store(std::sync::Arc::new(next));
}

#[cfg(feature = "sdl-display")]
async fn run_window(config: Config) -> Result<()> {
    use color_eyre::eyre::eyre;
    use kinescope::display::Sdl2Display;
    use sdl2::event::Event;
    use sdl2::keyboard::Scancode;

    let sdl_context = sdl2::init().map_err(|e| eyre!(e))?;
    let display = Sdl2Display::new(
        &sdl_context,
        config.display.width,
        config.display.height,
        config.display.zoom,
    )?;
    let mut events = sdl_context.event_pump().map_err(|e| eyre!(e))?;
    let player = build_player(config, display)?;

    let on_event = move |player: &mut VideoPlayer<Sdl2Display>| {
        for event in events.poll_iter() {
            match event {
                Event::Quit { .. }
                | Event::KeyDown {
                    scancode: Some(Scancode::Escape),
                    ..
                } => return Input::Quit,
                Event::KeyDown {
                    scancode: Some(Scancode::L),
                    ..
                } => adjust(player, |s, _| s.looping = !s.looping),
                Event::KeyDown {
                    scancode: Some(Scancode::Equals | Scancode::KpPlus),
                    ..
                } => adjust(player, |s, current| {
                    s.update_interval_ms = current + INTERVAL_STEP_MS
                }),
                Event::KeyDown {
                    scancode: Some(Scancode::Minus | Scancode::KpMinus),
                    ..
                } => adjust(player, |s, current| {
                    s.update_interval_ms = current.saturating_sub(INTERVAL_STEP_MS).max(1)
                }),
                _ => {}
            }
        }
        Input::Continue
    };
    drive(player, on_event, shutdown_signal()).await
}
