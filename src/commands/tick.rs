use clap::Args;

use super::{GlobalArgs, OutputFormat, print_json};

#[derive(Debug, Args)]
pub struct TickArgs {
    /// Tick even if the alarm is not yet due
    #[arg(long)]
    pub force: bool,
}

impl TickArgs {
    pub fn execute(&self, global: &GlobalArgs) -> anyhow::Result<()> {
        let mut town = global.open_town()?;
        if !self.force && !town.is_due()? {
            if let Some(at) = town.next_wake_at()? {
                println!("not due until {}", at.to_rfc3339());
            }
            return Ok(());
        }
        let report = town.tick()?;
        town.drain_background();

        match global.format() {
            OutputFormat::Json => print_json(&report)?,
            OutputFormat::Text => {
                println!(
                    "dispatched={} failed={} tripped={} completed={} idle={} nudged={} \
                     review_dispatched={} merged={} review_failed={} escalated={}",
                    report.dispatched,
                    report.dispatch_failed,
                    report.tripped,
                    report.completed,
                    report.went_idle,
                    report.nudged,
                    report.reviews_dispatched,
                    report.reviews_merged,
                    report.reviews_failed,
                    report.escalations_bumped,
                );
            }
            OutputFormat::Pretty => {
                println!("Tick for town {}", town.id());
                println!(
                    "  dispatched:  {} ({} failed, {} tripped)",
                    report.dispatched, report.dispatch_failed, report.tripped
                );
                println!(
                    "  patrol:      {} completed, {} idle, {} nudged",
                    report.completed, report.went_idle, report.nudged
                );
                println!(
                    "  reviews:     {} to refinery, {} merged, {} failed",
                    report.reviews_dispatched, report.reviews_merged, report.reviews_failed
                );
                println!("  escalations: {} aged", report.escalations_bumped);
                for error in &report.phase_errors {
                    println!("  ! {error}");
                }
                if let Some(at) = report.next_wake_at {
                    println!("  next wake:   {}", at.to_rfc3339());
                }
            }
        }
        Ok(())
    }
}
