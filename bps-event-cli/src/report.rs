//! Run report
//!
//! Summarizes a run as plain text or JSON: what was created, what completed,
//! which callbacks failed, and whether any native memory was left behind.

use anyhow::Result;
use bps_event::{AllocationStats, SimulatedStats};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::io::Write;

use crate::callbacks::{CompletionRecord, FailureRecord};
use crate::config::BusKind;

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub bus: BusKind,
    pub requested: usize,
    pub created: usize,
    pub create_errors: Vec<String>,
    pub completions: Vec<CompletionRecord>,
    pub callback_failures: Vec<FailureRecord>,
    pub pending_completions: usize,
    pub registered_pointers: usize,
    pub allocation: AllocationStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulated: Option<SimulatedStats>,
}

impl RunReport {
    /// True if every native block was returned and no callback is left pending
    pub fn is_clean(&self) -> bool {
        self.allocation.live_blocks == 0
            && self.registered_pointers == 0
            && self.pending_completions == 0
    }

    pub fn write_json(&self, out: &mut impl Write) -> Result<()> {
        serde_json::to_writer_pretty(&mut *out, self)?;
        writeln!(out)?;
        Ok(())
    }

    pub fn write_text(&self, out: &mut impl Write) -> Result<()> {
        let elapsed = self.finished_at - self.started_at;

        writeln!(out, "═══════════════════════════════════════════════")?;
        writeln!(out, "  BPS Event Bridge - Run Report")?;
        writeln!(out, "═══════════════════════════════════════════════\n")?;
        writeln!(out, "Started:  {}", self.started_at.format("%Y-%m-%d %H:%M:%S%.3f"))?;
        writeln!(out, "Finished: {}", self.finished_at.format("%Y-%m-%d %H:%M:%S%.3f"))?;
        writeln!(out, "Elapsed:  {} ms", elapsed.num_milliseconds())?;
        writeln!(out, "Bus:      {:?}", self.bus)?;

        writeln!(out, "\nEvents:")?;
        writeln!(out, "  Requested: {}", self.requested)?;
        writeln!(out, "  Created:   {}", self.created)?;
        writeln!(out, "  Failed:    {}", self.create_errors.len())?;
        for error in &self.create_errors {
            writeln!(out, "    ✗ {}", error)?;
        }

        writeln!(out, "\nCompletions: {}", self.completions.len())?;
        for record in &self.completions {
            writeln!(
                out,
                "  {} {} domain=0x{:03X} code=0x{:04X} [{}]",
                record.at.format("%H:%M:%S%.3f"),
                record.event,
                record.domain,
                record.code,
                record.payload.join(", ")
            )?;
        }

        writeln!(out, "\nCallback failures: {}", self.callback_failures.len())?;
        for failure in &self.callback_failures {
            writeln!(out, "  ✗ {}", failure.message)?;
        }

        writeln!(out, "\nNative memory:")?;
        writeln!(out, "  Allocations:   {}", self.allocation.allocations)?;
        writeln!(out, "  Deallocations: {}", self.allocation.deallocations)?;
        writeln!(out, "  Failed allocs: {}", self.allocation.failures)?;
        writeln!(out, "  Live blocks:   {}", self.allocation.live_blocks)?;
        writeln!(out, "  Live bytes:    {}", self.allocation.live_bytes)?;
        writeln!(out, "  Registered pointers:  {}", self.registered_pointers)?;
        writeln!(out, "  Pending completions:  {}", self.pending_completions)?;

        if let Some(sim) = &self.simulated {
            writeln!(out, "\nSimulated bus:")?;
            writeln!(out, "  Created:     {}", sim.created)?;
            writeln!(out, "  Destroyed:   {}", sim.destroyed)?;
            writeln!(out, "  Refused:     {}", sim.failed_creates)?;
            writeln!(out, "  Completions: {}", sim.completions_delivered)?;
            writeln!(out, "  Live:        {}", sim.live)?;
        }

        writeln!(out)?;
        if self.is_clean() {
            writeln!(out, "✓ All native memory reclaimed")?;
        } else {
            writeln!(out, "⚠️  Native memory left behind")?;
        }
        Ok(())
    }
}
