use std::num::NonZeroIsize;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use fixvk_bridge::{Bridge, ClearFlags, D3dColor, Fvf, PrimitiveType};
use fixvk_core::config::default_config_path;
use fixvk_core::FixvkConfig;
use fixvk_driver::{HeadlessDriver, VulkanDriver};
use fixvk_protocol::descriptors::InstanceDesc;
use fixvk_protocol::{Driver, WindowTarget};

#[derive(Parser)]
#[command(name = "fixvk")]
#[command(about = "fixvk - fixed-function Direct3D 8 calls on Vulkan")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a Vulkan instance and list the adapters it sees
    Probe {
        /// Request the Khronos validation layer
        #[arg(long)]
        validation: bool,
    },

    /// Render scripted frames against the headless driver and print counters
    Replay {
        /// Number of frames to render
        #[arg(short, long, default_value_t = 60)]
        frames: u32,

        /// Back buffer width (defaults to the config value)
        #[arg(long)]
        width: Option<u32>,

        /// Back buffer height (defaults to the config value)
        #[arg(long)]
        height: Option<u32>,

        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file path
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    fixvk_common::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Probe { validation } => probe(validation),
        Commands::Replay {
            frames,
            width,
            height,
            config,
        } => {
            let config = load_config(config)?;
            let width = width.unwrap_or(config.renderer.width);
            let height = height.unwrap_or(config.renderer.height);
            replay(config, frames, width, height)
        }
        Commands::Config { path } => {
            let config = load_config(path)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

/// An explicit path must parse; the default path falls back to defaults.
fn load_config(path: Option<PathBuf>) -> anyhow::Result<FixvkConfig> {
    match path {
        Some(path) => FixvkConfig::load(&path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(FixvkConfig::load_or_default(default_config_path())),
    }
}

fn probe(validation: bool) -> anyhow::Result<()> {
    let mut driver = VulkanDriver::new().context("Vulkan loader not available")?;
    let info = driver
        .create_instance(&InstanceDesc {
            application_name: "fixvk-probe".into(),
            enable_validation: validation,
            display: None,
        })
        .context("vkCreateInstance failed")?;
    if validation && !info.validation_enabled {
        println!("validation layer requested but not installed");
    }

    let adapters = driver.enumerate_adapters(info.instance, None);
    match adapters {
        Ok(adapters) if adapters.is_empty() => println!("no Vulkan adapters found"),
        Ok(adapters) => {
            for (i, adapter) in adapters.iter().enumerate() {
                println!(
                    "[{}] {} ({:?}) Vulkan {}.{}.{}",
                    i,
                    adapter.name,
                    adapter.kind,
                    ash::vk::api_version_major(adapter.api_version),
                    ash::vk::api_version_minor(adapter.api_version),
                    ash::vk::api_version_patch(adapter.api_version),
                );
                match adapter.queue_family {
                    Some(family) => println!("    graphics queue family: {}", family),
                    None => println!("    no graphics queue family"),
                }
                println!(
                    "    max sampler anisotropy: {}",
                    adapter.max_sampler_anisotropy
                );
            }
        }
        Err(e) => {
            driver.destroy(info.instance);
            return Err(e).context("adapter enumeration failed");
        }
    }

    driver.destroy(info.instance);
    Ok(())
}

/// One untransformed XYZ|DIFFUSE vertex.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ColoredVertex {
    position: [f32; 3],
    color: u32,
}

const TRIANGLE: [ColoredVertex; 3] = [
    ColoredVertex {
        position: [0.0, 0.5, 0.5],
        color: 0xffff_0000,
    },
    ColoredVertex {
        position: [0.5, -0.5, 0.5],
        color: 0xff00_ff00,
    },
    ColoredVertex {
        position: [-0.5, -0.5, 0.5],
        color: 0xff00_00ff,
    },
];

fn replay(config: FixvkConfig, frames: u32, width: u32, height: u32) -> anyhow::Result<()> {
    info!("replaying {} frames at {}x{}", frames, width, height);

    let window = WindowTarget::win32(NonZeroIsize::MIN);
    let mut bridge = Bridge::new(HeadlessDriver::new(), config);
    bridge
        .initialize(&window, width, height)
        .context("initialize failed")?;

    let result = run_frames(&mut bridge, frames);

    let stats = bridge.stats();
    let pipelines = bridge.pipeline_stats();
    println!("frames submitted:  {}", stats.frames_submitted);
    println!("frames presented:  {}", stats.frames_presented);
    println!("draws recorded:    {}", stats.draws_recorded);
    println!("draws skipped:     {}", stats.draws_skipped);
    println!("surface rebuilds:  {}", stats.surface_rebuilds);
    println!(
        "pipelines:         {} ({} hits, {} misses, {} failures)",
        bridge.pipeline_count(),
        pipelines.hits,
        pipelines.misses,
        pipelines.failures
    );
    println!("driver submits:    {}", bridge.driver().submissions().len());
    println!("driver presents:   {}", bridge.driver().presents().len());

    bridge.shutdown();
    println!("objects leaked:    {}", bridge.driver().live_objects());
    result
}

fn run_frames(bridge: &mut Bridge<HeadlessDriver>, frames: u32) -> anyhow::Result<()> {
    bridge.set_vertex_format(Fvf::XYZ | Fvf::DIFFUSE)?;
    let vertices: &[u8] = bytemuck::cast_slice(&TRIANGLE);
    let stride = std::mem::size_of::<ColoredVertex>() as u32;

    for frame in 0..frames {
        bridge.clear(
            &[],
            ClearFlags::TARGET | ClearFlags::ZBUFFER,
            D3dColor::argb(0xff, 0x20, 0x20, 0x40),
            1.0,
            0,
        )?;
        bridge
            .begin_scene()
            .with_context(|| format!("BeginScene failed at frame {}", frame))?;
        bridge.draw_primitive_up(PrimitiveType::TriangleList, 1, vertices, stride)?;
        bridge.end_scene()?;
        bridge
            .present()
            .with_context(|| format!("Present failed at frame {}", frame))?;
    }
    Ok(())
}
