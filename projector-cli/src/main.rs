mod eeprom;
mod hex;
mod preview;
mod sim;

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use projector_core::calibration::CALIBRATION_VERSION;
use projector_core::clock::{micros_to_ticks, ticks_to_micros, TICKS_PER_MICROSECOND};
use projector_core::frame::draw_test_card;
use projector_core::{CalibrationTable, FacetMap, FrameBuffer, RevolutionTiming, RigConfig, Ticks};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::eeprom::EepromImage;
use crate::sim::DrumModel;

#[derive(Parser)]
#[command(name = "projector-cli")]
#[command(about = "Laser projector scan-timing tools")]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scan engine against a simulated drum
    Simulate {
        #[command(flatten)]
        rig: RigArgs,
        /// Revolutions to simulate
        #[arg(long, default_value_t = 200)]
        revolutions: u32,
        /// Nominal revolution period in microseconds
        #[arg(long, default_value_t = 40_000)]
        period_us: u32,
        /// Peak per-revolution jitter in microseconds
        #[arg(long, default_value_t = 0)]
        jitter_us: u32,
        /// Add a sensor bounce after every Nth pulse
        #[arg(long)]
        bounce_every: Option<u32>,
        /// Revolutions without a sensor pulse, as START..END
        #[arg(long, value_parser = parse_range)]
        dropout: Option<std::ops::Range<u32>>,
        /// Change speed at a revolution, as REV:PERIOD_US
        #[arg(long, value_parser = parse_speed_step)]
        speed_step: Option<(u32, u32)>,
        #[arg(long, default_value_t = 0x2545_F491)]
        seed: u32,
    },
    /// Print busy-wait counts across illumination times
    DelayMap {
        #[arg(long, default_value_t = 500)]
        from_us: u32,
        #[arg(long, default_value_t = 11_000)]
        to_us: u32,
        #[arg(long, default_value_t = 500)]
        step_us: u32,
    },
    /// Read or write EEPROM calibration images (Intel HEX)
    Calibration {
        #[command(subcommand)]
        action: CalibrationCommand,
    },
    /// Write an HTML/SVG preview of what each facet paints
    Preview {
        #[command(flatten)]
        rig: RigArgs,
        /// Output file
        #[arg(short, long, default_value = "preview.html")]
        output: PathBuf,
        /// Text for the test card
        #[arg(long, default_value = "SCAN")]
        text: String,
        /// Per-facet offsets in ticks, comma separated
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        offsets: Vec<i16>,
        /// Revolution period used to convert offsets to pixels
        #[arg(long, default_value_t = 40_000)]
        period_us: u32,
    },
}

#[derive(Subcommand)]
enum CalibrationCommand {
    /// Build an image from per-facet offsets
    Encode {
        /// Offsets in ticks, comma separated, one per facet
        #[arg(value_delimiter = ',', allow_hyphen_values = true, required = true)]
        offsets: Vec<i16>,
        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the offsets stored in an image
    Decode {
        image: PathBuf,
        #[arg(long, default_value_t = 8)]
        facets: usize,
    },
}

/// Rig geometry shared by the commands that build an engine.
#[derive(Args)]
struct RigArgs {
    /// Facet to raster-row map, comma separated; the reference drum if omitted
    #[arg(long, value_delimiter = ',')]
    facet_map: Vec<u8>,
    /// Laser planes sharing the drum
    #[arg(long, default_value_t = 1)]
    planes: usize,
    /// Sync tolerance in microseconds
    #[arg(long)]
    tolerance_us: Option<u32>,
}

impl RigArgs {
    fn config(&self) -> Result<RigConfig> {
        let mut config = RigConfig::reference();
        if !self.facet_map.is_empty() {
            config.facet_map = FacetMap::new(&self.facet_map).context("facet map")?;
            config.plane_stride = config.facet_count();
        }
        config.laser_planes = self.planes;
        if let Some(us) = self.tolerance_us {
            config.sync_tolerance = micros_to_ticks(us);
        }
        config.validate().context("rig configuration")?;
        Ok(config)
    }
}

fn parse_range(s: &str) -> Result<std::ops::Range<u32>, String> {
    let (start, end) = s
        .split_once("..")
        .ok_or_else(|| format!("expected START..END, got {s}"))?;
    let start: u32 = start.parse().map_err(|e| format!("{e}"))?;
    let end: u32 = end.parse().map_err(|e| format!("{e}"))?;
    Ok(start..end)
}

fn parse_speed_step(s: &str) -> Result<(u32, u32), String> {
    let (rev, period) = s
        .split_once(':')
        .ok_or_else(|| format!("expected REV:PERIOD_US, got {s}"))?;
    Ok((
        rev.parse().map_err(|e| format!("{e}"))?,
        period.parse().map_err(|e| format!("{e}"))?,
    ))
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Simulate {
            rig,
            revolutions,
            period_us,
            jitter_us,
            bounce_every,
            dropout,
            speed_step,
            seed,
        } => {
            let config = rig.config()?;
            let table = CalibrationTable::defaults(config.facet_count(), config.default_offset);
            let drum = DrumModel {
                period: micros_to_ticks(period_us),
                jitter: micros_to_ticks(jitter_us),
                bounce_every,
                dropout,
                speed_step: speed_step.map(|(rev, us)| (rev, micros_to_ticks(us))),
                seed,
            };

            let pb = ProgressBar::new(u64::from(revolutions));
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} revolutions")
                    .context("progress bar template")?
                    .progress_chars("=> "),
            );
            pb.set_message("Simulating");

            let report = sim::run(config, table, &drum, revolutions, &pb)?;

            println!("Revolutions:      {}", report.revolutions);
            println!(
                "Delay map:        {}..{} ticks -> {}..{}",
                report.delay_map.min_duration,
                report.delay_map.max_duration,
                report.delay_map.min_count,
                report.delay_map.max_count
            );
            match report.first_lock_us {
                Some(us) => println!("First lock:       {:.1} ms", us as f64 / 1000.0),
                None => println!("First lock:       never"),
            }
            println!("Locks:            {}", report.locks);
            println!("Lost (drift):     {}", report.lost_drift);
            println!("Lost (deadline):  {}", report.lost_deadline);
            println!("Bounces rejected: {}", report.bounces_rejected);
            println!("Facets scanned:   {}", report.facets_scanned);
            println!(
                "Start error:      max {} us, mean {:.2} us",
                report.max_start_error / u64::from(TICKS_PER_MICROSECOND),
                report.mean_start_error / f64::from(TICKS_PER_MICROSECOND)
            );
            if let Some(timing) = report.status.timing {
                println!("Speed:            {} rev/s", timing.revs_per_second());
            }
            println!("Final state:      {:?}", report.status.state);
        }
        Command::DelayMap {
            from_us,
            to_us,
            step_us,
        } => {
            if step_us == 0 || from_us > to_us {
                bail!("need FROM <= TO and a non-zero step");
            }
            let config = RigConfig::reference();
            let map = config.delay_map;
            println!("illum_us  byte  bit  period_us");
            for us in (from_us..=to_us).step_by(step_us as usize) {
                let byte = map.byte_delay(micros_to_ticks(us));
                // Facet window is twice the illumination.
                let period = micros_to_ticks(us) * 2 * config.facet_count() as Ticks;
                println!(
                    "{:8}  {:4}  {:3}  {:9}",
                    us,
                    byte,
                    map.bit_delay(byte),
                    ticks_to_micros(period)
                );
            }
        }
        Command::Calibration { action } => match action {
            CalibrationCommand::Encode { offsets, output } => {
                if offsets.len() > projector_core::MAX_FACETS {
                    bail!(
                        "{} offsets given, at most {} facets are supported",
                        offsets.len(),
                        projector_core::MAX_FACETS
                    );
                }
                let mut table = CalibrationTable::defaults(offsets.len(), 0);
                for (facet, &offset) in offsets.iter().enumerate() {
                    table.set_offset(facet, offset);
                }
                let mut image = EepromImage::erased();
                table.store(&mut image);

                let len = CalibrationTable::storage_len(offsets.len());
                let text = hex::write_hex(0, &image.bytes()[..len])?;
                match output {
                    Some(path) => {
                        fs::write(&path, text)
                            .with_context(|| format!("writing {}", path.display()))?;
                        println!(
                            "Wrote {} bytes, {} programmed (version {}) to {}",
                            len,
                            image.writes(),
                            CALIBRATION_VERSION,
                            path.display()
                        );
                    }
                    None => print!("{text}"),
                }
            }
            CalibrationCommand::Decode { image, facets } => {
                let contents = fs::read_to_string(&image)
                    .with_context(|| format!("reading {}", image.display()))?;
                let segments = hex::parse_hex(&contents).context("parsing Intel HEX file")?;
                let (base, data) =
                    hex::flatten_segments(&segments).context("flattening HEX segments")?;
                let mut storage = EepromImage::from_bytes(base, &data)?;

                let table = CalibrationTable::load(&mut storage, facets, 0);
                if table.needs_write() {
                    bail!(
                        "no version {} calibration table in {}",
                        CALIBRATION_VERSION,
                        image.display()
                    );
                }
                for (facet, offset) in table.offsets().iter().enumerate() {
                    println!("facet {facet}: {offset:+} ticks");
                }
            }
        },
        Command::Preview {
            rig,
            output,
            text,
            offsets,
            period_us,
        } => {
            let config = rig.config()?;
            let mut frame =
                FrameBuffer::<4096>::for_rig(&config).context("sizing frame buffer")?;
            let _ = draw_test_card(&mut frame, &text);

            let html = preview::generate_html(&frame, &config, &offsets, micros_to_ticks(period_us));
            fs::write(&output, html).with_context(|| format!("writing {}", output.display()))?;

            let timing = RevolutionTiming::derive(
                0,
                micros_to_ticks(period_us),
                config.facet_count(),
                config.first_facet_fraction,
                &config.delay_map,
            );
            println!(
                "Wrote {} ({} facets, {} px per row, {} rev/s)",
                output.display(),
                config.facet_count(),
                config.row_bytes * 8,
                timing.revs_per_second()
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_negative_offsets() {
        let cli = Cli::try_parse_from(["projector-cli", "calibration", "encode", "-4,0,12"]).unwrap();
        match cli.command {
            Command::Calibration {
                action: CalibrationCommand::Encode { offsets, .. },
            } => assert_eq!(offsets, [-4, 0, 12]),
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn custom_facet_map_resizes_the_rig() {
        let cli = Cli::try_parse_from(["projector-cli", "preview", "--facet-map", "1,0,3,2"]).unwrap();
        let Command::Preview { rig, .. } = cli.command else {
            panic!("wrong command");
        };
        let config = rig.config().unwrap();
        assert_eq!(config.facet_count(), 4);
        assert_eq!(config.plane_stride, 4);
    }

    #[test]
    fn parses_ranges_and_speed_steps() {
        assert_eq!(parse_range("10..16"), Ok(10..16));
        assert!(parse_range("10").is_err());
        assert_eq!(parse_speed_step("20:42000"), Ok((20, 42_000)));
    }
}
