//! CSV export of settled flows and per-tick participant state.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use crate::sim::types::TickReport;

/// Column header for the flow export: one row per settled flow.
const FLOWS_HEADER: &str = "step,time,kind,signal,from,to,quantity_kwh,unit_price,amount";

/// Column header for the ledger export: one row per participant per tick.
const LEDGER_HEADER: &str = "step,time,participant,role,action,generation_kwh,consumption_kwh,\
                             net_kwh,battery_kwh,battery_capacity_kwh,wallet,grid_available,\
                             grid_price,community_donated_kwh";

/// Exports every settled flow to a CSV file at the given path.
///
/// # Errors
///
/// Returns an `io::Error` if file creation or writing fails.
pub fn export_flows_csv(reports: &[TickReport], path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    write_flows_csv(reports, io::BufWriter::new(file))
}

/// Writes every settled flow as CSV to any writer.
///
/// Rows follow tick order, then settlement order within a tick, so
/// identical runs produce identical bytes.
///
/// # Errors
///
/// Returns an `io::Error` if writing fails.
pub fn write_flows_csv(reports: &[TickReport], writer: impl Write) -> io::Result<()> {
    let mut wtr = csv::WriterBuilder::new().from_writer(writer);
    wtr.write_record(FLOWS_HEADER.split(','))?;

    for r in reports {
        for flow in &r.flows {
            let (from, to) = flow.endpoints();
            wtr.write_record(&[
                r.step.to_string(),
                r.timestamp.to_string(),
                flow.kind().to_string(),
                flow.signal_kind().as_str().to_string(),
                from.to_string(),
                to.to_string(),
                format!("{:.6}", flow.quantity()),
                format!("{:.4}", flow.unit_price()),
                format!("{:.4}", flow.amount()),
            ])?;
        }
    }

    wtr.flush()?;
    Ok(())
}

/// Exports the settled participant state of every tick to a CSV file.
///
/// # Errors
///
/// Returns an `io::Error` if file creation or writing fails.
pub fn export_ledger_csv(reports: &[TickReport], path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    write_ledger_csv(reports, io::BufWriter::new(file))
}

/// Writes the settled participant state of every tick as CSV.
///
/// # Errors
///
/// Returns an `io::Error` if writing fails.
pub fn write_ledger_csv(reports: &[TickReport], writer: impl Write) -> io::Result<()> {
    let mut wtr = csv::WriterBuilder::new().from_writer(writer);
    wtr.write_record(LEDGER_HEADER.split(',').map(str::trim))?;

    for r in reports {
        for p in &r.participants {
            let position = r.positions.get(&p.id).copied().unwrap_or_default();
            let action = r.proposals.get(&p.id).map_or("HOLD", |a| a.label());
            wtr.write_record(&[
                r.step.to_string(),
                r.timestamp.to_string(),
                p.id.clone(),
                position.role().as_str().to_string(),
                action.to_string(),
                format!("{:.6}", position.generation),
                format!("{:.6}", position.consumption),
                format!("{:.6}", position.net),
                format!("{:.6}", p.battery_stored),
                format!("{:.6}", p.battery_capacity),
                format!("{:.4}", p.wallet_balance),
                r.context.grid_available.to_string(),
                format!("{:.4}", r.context.grid_price),
                format!("{:.6}", r.community.total_donated_energy),
            ])?;
        }
    }

    wtr.flush()?;
    Ok(())
}
