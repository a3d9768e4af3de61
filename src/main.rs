use clap::{Args, Parser, Subcommand};
use octx::codec::IntensityTransform;
use octx::config::{ReadOptions, DEFAULT_ZEISS_COLS, DEFAULT_ZEISS_ROWS};
use octx::container::{Container, FormatKind};
use octx::formats::zeiss;
use octx::frames::Buffering;
use serde_json::json;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "octx", about = "Extract OCT volumes and fundus images from vendor files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the chunks of a file without reading pixel data
    Catalog {
        input: PathBuf,
        #[command(flatten)]
        read: ReadArgs,
    },
    /// Assemble volumes and print a JSON summary
    Inspect {
        input: PathBuf,
        /// Map Heidelberg OCT pixels with 256·v^(1/2.4) instead of the log transform
        #[arg(long)]
        legacy_intensity: bool,
        #[command(flatten)]
        read: ReadArgs,
    },
    /// Dump every decodable Topcon metadata record as JSON
    Metadata {
        input: PathBuf,
    },
    /// Load a Bioptigen frame stack and report its geometry
    Frames {
        input: PathBuf,
        /// Buffer frames in a temporary file instead of memory
        #[arg(long)]
        disk: bool,
    },
    /// Restore the JPEG 2000 codestream of one scrambled Zeiss CZM frame
    Unscramble {
        input:  PathBuf,
        output: PathBuf,
    },
}

#[derive(Args)]
struct ReadArgs {
    /// Zeiss slice rows
    #[arg(long, default_value_t = DEFAULT_ZEISS_ROWS)]
    rows: usize,
    /// Zeiss slice columns
    #[arg(long, default_value_t = DEFAULT_ZEISS_COLS)]
    cols: usize,
    /// De-interlace Zeiss slices
    #[arg(long)]
    interlaced: bool,
}

impl ReadArgs {
    fn options(&self) -> ReadOptions {
        ReadOptions::default()
            .with_zeiss_shape(self.rows, self.cols)
            .with_zeiss_interlaced(self.interlaced)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    match Cli::parse().command {

        // ── Catalog ──────────────────────────────────────────────────────────
        Commands::Catalog { input, read } => {
            let container = Container::open_with_options(&input, read.options())?;
            let catalog = container.catalog()?;
            println!("{} ({})", input.display(), container.kind().name());
            println!("{:<40} {:>12} {:>12}", "Chunk", "Offset", "Size");
            for entry in catalog.entries() {
                println!("{:<40} {:>12} {:>12}", entry.tag, entry.offset, entry.size);
            }
            println!("{} chunks", catalog.len());
        }

        // ── Inspect ──────────────────────────────────────────────────────────
        Commands::Inspect { input, legacy_intensity, read } => {
            let intensity = if legacy_intensity { IntensityTransform::Legacy } else { IntensityTransform::Current };
            let container = Container::open_with_options(&input, read.options().with_intensity(intensity))?;
            let (volumes, fundus) = container.read_volumes()?;
            let report = json!({
                "path":    input,
                "format":  container.kind(),
                "volumes": volumes.iter().map(|v| v.summary()).collect::<Vec<_>>(),
                "fundus":  fundus.iter().map(|f| f.summary()).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        // ── Metadata ─────────────────────────────────────────────────────────
        Commands::Metadata { input } => {
            let container = Container::open(&input)?;
            let records = container.read_all_metadata()?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }

        // ── Frames ───────────────────────────────────────────────────────────
        Commands::Frames { input, disk } => {
            let container = Container::open(&input)?;
            if container.kind() != FormatKind::BioptigenOct {
                return Err(format!("{} is {}, not a frame stack", input.display(), container.kind().name()).into());
            }
            let buffering = if disk { Buffering::Disk } else { Buffering::Memory };
            let catalog = container.catalog()?;
            let buffer = container.load_frames(&catalog, buffering)?;
            println!("{}", serde_json::to_string_pretty(&buffer.summary())?);
        }

        // ── Unscramble ───────────────────────────────────────────────────────
        Commands::Unscramble { input, output } => {
            let frame = std::fs::read(&input)?;
            let plain = zeiss::unscramble(&frame)?;
            std::fs::write(&output, &plain)?;
            println!("{} -> {} ({} bytes)", input.display(), output.display(), plain.len());
        }
    }

    Ok(())
}
