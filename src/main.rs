use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;

use freqeval::{AnalysisConfig, Report, Session};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Counter file (.csv, .txt or .parquet)
    data: PathBuf,

    /// Analysis configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Mask file applied before filtering
    #[arg(short, long)]
    mask: Option<PathBuf>,

    /// Write the final mask to this file
    #[arg(long)]
    save_mask: Option<PathBuf>,

    /// Write the JSON report here instead of printing a summary
    #[arg(short, long)]
    report: Option<PathBuf>,

    /// Include the class of every sample in the report
    #[arg(long, default_value_t = false)]
    points: bool,

    #[arg(long)]
    forward_overhang: Option<usize>,

    #[arg(long)]
    backward_overhang: Option<usize>,

    #[arg(long)]
    outlier_threshold: Option<f64>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = args.config.as_deref().map(AnalysisConfig::load).transpose()?;
    let mut session = Session::open(&args.data, config)?;
    apply_overrides(&mut session.config, &args);
    if let Some(mask) = &args.mask {
        let outcome = session.load_maskfile(mask)?;
        info!("{} samples masked from {}", outcome.masked, mask.display());
    }

    session.run()?;

    if let Some(path) = &args.save_mask {
        let lines = session.save_maskfile(path)?;
        info!("Wrote {lines} mask lines to {}", path.display());
    }

    let report = Report::from_session(&session, args.points)?;
    match &args.report {
        Some(path) => report.write(path)?,
        None => print_summary(&report),
    }
    Ok(())
}

fn apply_overrides(config: &mut AnalysisConfig, args: &Args) {
    if let Some(n) = args.forward_overhang {
        config.config.forward_overhang = n;
    }
    if let Some(n) = args.backward_overhang {
        config.config.backward_overhang = n;
    }
    if let Some(t) = args.outlier_threshold {
        config.config.outlier_threshold = t;
    }
}

fn print_summary(report: &Report) {
    println!(
        "{}: {} samples, {} s interval, day {}",
        report.source,
        report.samples,
        report.sample_interval,
        report.reference_date.as_deref().unwrap_or("?")
    );
    if let Some(f) = &report.filter {
        println!(
            "filter: unlocked {:?}, outliers {:?}, transferred {}",
            f.unlocked, f.outliers, f.transferred
        );
    }
    println!();
    println!("{:<16} {:>8} {:>24} {:>12}", "channel", "good", "frequency (Hz)", "adev(tau0)");
    for ch in &report.channels {
        println!(
            "{:<16} {:>8} {:>24} {:>12.3e}",
            ch.name,
            ch.good_points,
            ch.frequency.as_deref().unwrap_or("-"),
            ch.adev.first().map_or(f64::NAN, |p| p.dev / ch.adev_reference)
        );
    }
    if !report.evaluations.is_empty() {
        println!();
        for ev in &report.evaluations {
            println!(
                "{:<16} {:>8} {} (frac dev {:.3e}, frac unc {:.3e})",
                ev.name, ev.good_points, ev.result, ev.frac_dev, ev.frac_unc
            );
        }
    }
    for w in &report.warnings {
        println!("warning: {w}");
    }
}
