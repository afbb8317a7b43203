use std::path::PathBuf;

use anyhow::{Context, Result};
use appliance_lab::orchestrator::{self, BuildOptions, BuildReport, PlanReport};
use appliance_lab::spec;
use appliance_sys::lock::DEFAULT_LOCK_PATH;
use appliance_types::{bytes_to_pretty, pretty_to_bytes};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Parser)]
#[command(name = "appliance-lab")]
#[command(about = "Build partitioned appliance disk images from TOML specs")]
struct LabCli {
    /// Lock file serializing builds on this host
    #[arg(long, global = true, default_value = DEFAULT_LOCK_PATH)]
    lock_file: PathBuf,

    #[command(subcommand)]
    command: LabCommand,
}

#[derive(Debug, Subcommand)]
enum LabCommand {
    /// Show the partition layout without touching the host
    Plan {
        spec_name: String,
        #[arg(long)]
        json: bool,
    },
    /// Create, partition, mount, tear down and stage the images
    Build {
        spec_name: String,
        #[arg(long)]
        dry_run: bool,
        /// Shell command run with APPLIANCE_ROOT set to the mounted tree
        #[arg(long)]
        hook: Option<String>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Release host resources left by a failed build
    Cleanup {
        spec_name: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Shrink a finished ext image to its minimal size
    Resparse {
        image: PathBuf,
        /// Keep at least this much room in the image (e.g. "512 MB")
        #[arg(long, value_parser = parse_size)]
        keep: Option<u64>,
    },
}

fn parse_size(value: &str) -> std::result::Result<u64, String> {
    pretty_to_bytes(value).map_err(|error| error.to_string())
}

fn print_plan(report: &PlanReport) {
    println!("{}", report.spec_name);
    for (name, kind, size) in &report.disks {
        println!("  disk {} {:?} {}", name, kind, bytes_to_pretty(size, false));
    }
    for entry in report.layout.table_entries() {
        println!(
            "  {} {} {}M-{}M",
            entry.disk, entry.kind, entry.start_mb, entry.end_mb
        );
    }
    for partition in &report.layout.partitions {
        println!(
            "  /dev/{}{} {} {}",
            partition.disk,
            partition.number,
            partition.mountpoint(),
            partition.request.effective_fstype()
        );
    }
}

fn print_build(report: &BuildReport) {
    for command in &report.commands {
        println!("{}", command);
    }
    for record in &report.records {
        println!(
            "{} {} {}",
            record.guest_device(),
            record.mountpoint,
            record.fstype
        );
    }
    for path in &report.staged {
        println!("staged {}", path.display());
    }
    for step in &report.suppressed {
        eprintln!("suppressed: {}", step);
    }
}

fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("appliance_lab=info,appliance_sys=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = LabCli::parse();
    match cli.command {
        LabCommand::Plan { spec_name, json } => {
            let spec = spec::load(&spec_name)?;
            let report = orchestrator::plan(&spec)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report.layout)?);
            } else {
                print_plan(&report);
            }
            Ok(())
        }
        LabCommand::Build {
            spec_name,
            dry_run,
            hook,
            output,
        } => {
            let spec = spec::load(&spec_name)?;
            let report = orchestrator::build(
                &spec,
                &BuildOptions {
                    dry_run,
                    hook,
                    output_dir: output,
                    lock_path: cli.lock_file,
                },
            )
            .with_context(|| format!("build of {} failed", spec.name))?;
            print_build(&report);
            Ok(())
        }
        LabCommand::Cleanup { spec_name, dry_run } => {
            for line in orchestrator::cleanup(spec_name.as_deref(), dry_run, &cli.lock_file)? {
                println!("{}", line);
            }
            Ok(())
        }
        LabCommand::Resparse { image, keep } => {
            match orchestrator::resparse_image(&image, keep)? {
                Some(size) => println!("{} {}", image.display(), bytes_to_pretty(&size, true)),
                None => println!("{} left unchanged", image.display()),
            }
            Ok(())
        }
    }
}
