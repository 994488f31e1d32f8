use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::info;
use nalgebra::{Point3, Vector2};

use carve::{
    compiler::compile,
    config::RendererConfig,
    gpu::{FrameOutcome, Renderer, read_texture},
    tape::Tape,
    view::{Camera3, View2},
};

/// Renders an implicit surface to a PNG image
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    cmd: Command,

    /// Expression to render, e.g. `x^2 + y^2 - 4`
    #[clap(short, long, conflicts_with = "tape")]
    expr: Option<String>,

    /// Binary tape file to render
    #[clap(short, long)]
    tape: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    Render2d {
        #[clap(flatten)]
        settings: ImageSettings,

        /// Center of the view, in evaluation coordinates
        #[clap(long, num_args = 2, default_values_t = [0.0, 0.0])]
        center: Vec<f32>,

        /// Half-width of the view, in evaluation units
        #[clap(long, default_value_t = 16.0)]
        scale: f32,
    },

    Render3d {
        #[clap(flatten)]
        settings: ImageSettings,

        /// Camera position
        #[clap(long, num_args = 3, default_values_t = [0.0, 0.0, 48.0])]
        eye: Vec<f32>,

        /// Point at the center of the image
        #[clap(long, num_args = 3, default_values_t = [0.0, 0.0, 0.0])]
        target: Vec<f32>,
    },
}

#[derive(Parser)]
struct ImageSettings {
    /// Name of a `.png` file to write
    #[clap(short, long)]
    out: Option<PathBuf>,

    /// Number of times to render (for benchmarking)
    #[clap(short = 'N', default_value_t = 1)]
    n: usize,

    /// Image size
    #[clap(short, long, default_value_t = 512)]
    size: u32,

    /// Cells per axis when subdividing a region
    #[clap(long)]
    split: Option<u32>,

    /// Number of region generations
    #[clap(short, long)]
    generations: Option<usize>,
}

impl ImageSettings {
    fn apply(&self, mut config: RendererConfig) -> RendererConfig {
        config.width = self.size;
        config.height = self.size;
        if let Some(split) = self.split {
            config.split = split;
        }
        if let Some(generations) = self.generations {
            config.generations = generations;
        }
        config
    }
}

////////////////////////////////////////////////////////////////////////////////

fn load_tape(args: &Args) -> Result<Tape> {
    let start = Instant::now();
    let tape = match (&args.expr, &args.tape) {
        (Some(expr), None) => compile(expr)?,
        (None, Some(path)) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed to read {path:?}"))?;
            Tape::from_bytes(&bytes)?
        }
        _ => bail!("exactly one of --expr or --tape is required"),
    };
    info!("Loaded {}-instruction tape in {:?}", tape.len(), start.elapsed());
    Ok(tape)
}

/// Renders `settings.n` frames, returning the last one as RGBA
fn run(mut renderer: Renderer, settings: &ImageSettings) -> Result<Vec<u8>> {
    let size = settings.size;
    let target = renderer.create_target(size, size);
    let view = target.create_view(&wgpu::TextureViewDescriptor::default());

    let start = Instant::now();
    for _ in 0..settings.n {
        if renderer.evaluate_and_render(&view, size, size)?
            == FrameOutcome::Skipped
        {
            bail!("renderer skipped the frame");
        }
    }
    let image = read_texture(renderer.device(), renderer.queue(), &target)?;
    info!(
        "Rendered {}x at {:?} ms/frame",
        settings.n,
        start.elapsed().as_micros() as f64 / 1000.0 / (settings.n as f64)
    );
    Ok(image)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .init();

    let args = Args::parse();
    let tape = load_tape(&args)?;

    let (buffer, settings) = match &args.cmd {
        Command::Render2d {
            settings,
            center,
            scale,
        } => {
            let config = settings.apply(RendererConfig::new_2d());
            let mut renderer = pollster::block_on(Renderer::init(config))?;
            renderer.set_tape(&tape)?;
            renderer.set_view2(View2::from_center_and_scale(
                Vector2::new(center[0], center[1]),
                *scale,
            ))?;
            (run(renderer, settings)?, settings)
        }
        Command::Render3d {
            settings,
            eye,
            target,
        } => {
            let config = settings.apply(RendererConfig::new_3d());
            let mut renderer = pollster::block_on(Renderer::init(config))?;
            renderer.set_tape(&tape)?;
            renderer.set_camera3(Camera3::look_at(
                Point3::new(eye[0], eye[1], eye[2]),
                Point3::new(target[0], target[1], target[2]),
            ))?;
            (run(renderer, settings)?, settings)
        }
    };

    if let Some(out) = &settings.out {
        info!("Writing image to {out:?}");
        image::save_buffer(
            out,
            &buffer,
            settings.size,
            settings.size,
            image::ColorType::Rgba8,
        )?;
    }
    Ok(())
}
