//! physics-sandbox binary
//!
//! Drops a row of marbles onto a static platform and logs what the host
//! observes. Drives the coordinator the way a render loop would: one
//! `poll` + `frame` per display refresh.
//!
//! ## Configuration (TOML file < env < CLI)
//!
//! | Key                        | Default | Description                         |
//! |----------------------------|---------|-------------------------------------|
//! | `PHYSICS_CONFIG`           | –       | Optional TOML file                  |
//! | `PHYSICS_MARBLES`          | `8`     | Marbles in the instanced group      |
//! | `PHYSICS_SECONDS`          | `5`     | Run time before exiting             |
//! | `PHYSICS_FPS`              | `60`    | Display refresh rate                |
//! | `PHYSICS_GRAVITY_Y`        | `-9.81` | Vertical gravity                    |
//! | `PHYSICS_XR_AFTER`         | –       | Seconds until a simulated XR session starts presenting |
//!
//! The TOML file may hold `[physics]` (`PhysicsConfig`) and `[coordinator]`
//! (`CoordinatorConfig`) tables.

use anyhow::{Context, Result};
use clap::Parser;
use physics_offload::{
    Body, BodyProps, BodyType, Coordinator, CoordinatorConfig, PhysicsConfig, Quat, ShapeKind,
    Vec3,
};
use serde::Deserialize;
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "physics-sandbox", about = "Physics offload sandbox", version)]
struct Args {
    /// TOML file with [physics] and [coordinator] tables
    #[arg(long, env = "PHYSICS_CONFIG")]
    config: Option<String>,

    /// Marbles in the instanced group
    #[arg(long, env = "PHYSICS_MARBLES", default_value_t = 8)]
    marbles: usize,

    /// Run time in seconds
    #[arg(long, env = "PHYSICS_SECONDS", default_value_t = 5.0)]
    seconds: f32,

    /// Display refresh rate (Hz)
    #[arg(long, env = "PHYSICS_FPS", default_value_t = 60.0)]
    fps: f32,

    /// Vertical gravity; overrides the config file
    #[arg(long, env = "PHYSICS_GRAVITY_Y")]
    gravity_y: Option<f32>,

    /// Start presenting a simulated XR session after this many seconds
    #[arg(long, env = "PHYSICS_XR_AFTER")]
    xr_after: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    physics: PhysicsConfig,
    coordinator: CoordinatorConfig,
}

fn load_file(path: Option<&str>) -> Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    config::Config::builder()
        .add_source(config::File::with_name(path))
        .build()
        .and_then(|c| c.try_deserialize())
        .with_context(|| format!("reading config file {}", path))
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("physics_offload=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut file = load_file(args.config.as_deref())?;
    if let Some(y) = args.gravity_y {
        file.physics.gravity.y = y;
    }

    log::info!(
        "Starting physics-sandbox (marbles={}, gravity={}, fps={})",
        args.marbles,
        file.physics.gravity,
        args.fps,
    );

    let coordinator = Coordinator::new(file.physics, file.coordinator)
        .context("starting physics worker")?;

    let redraws = Rc::new(Cell::new(0u64));
    let counter = redraws.clone();
    coordinator.set_render_surface(move || counter.set(counter.get() + 1));

    let _platform = Body::create(&coordinator, ShapeKind::Box, || BodyProps {
        body_type: BodyType::Static,
        args: Some(vec![5.0, 0.25, 5.0]),
        ..Default::default()
    })?;

    let marbles = Body::instanced_with_collide(
        &coordinator,
        ShapeKind::Sphere,
        args.marbles,
        |i| BodyProps {
            args: Some(vec![0.2]),
            position: Vec3::new(i as f32 * 0.5 - args.marbles as f32 * 0.25, 3.0 + i as f32, 0.0),
            restitution: Some(0.4),
            ..Default::default()
        },
        |event| {
            log::debug!(
                "{} hit {} at {:.2} m/s",
                event.target,
                event.body,
                event.contact.impact_velocity
            );
        },
    )?;

    let first = marbles.at(0).context("empty marble group")?;
    let _watch = first.position.subscribe(|p| log::trace!("marble 0 at {}", p))?;

    let mut transforms: Vec<(Vec3, Quat)> = Vec::new();
    let mut refresh = tokio::time::interval(Duration::from_secs_f32(1.0 / args.fps.max(1.0)));
    let started = Instant::now();
    let run_for = Duration::from_secs_f32(args.seconds.max(0.0));
    let mut presenting = false;
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            _ = refresh.tick() => {
                coordinator.poll().context("physics worker")?;

                let elapsed = started.elapsed();
                if !presenting && args.xr_after.is_some_and(|t| elapsed.as_secs_f32() >= t) {
                    log::info!("XR session presenting");
                    coordinator.set_xr_presenting(true);
                    presenting = true;
                }

                marbles.apply_transforms(&mut transforms);
                coordinator.frame(coordinator.frame_source())?;

                if elapsed >= run_for {
                    break;
                }
            }
            _ = &mut interrupted => {
                log::info!("Interrupted");
                break;
            }
        }
    }

    let stats = coordinator.stats();
    log::info!(
        "Done: {} frames, worker tick {}, {} bodies, {} subscriptions, {} redraws",
        stats.frames_received,
        stats.last_worker_tick,
        stats.registered_bodies,
        stats.live_subscriptions,
        redraws.get(),
    );
    if let Some((position, _)) = transforms.first() {
        log::info!("Marble 0 settled at {}", position);
    }
    Ok(())
}
