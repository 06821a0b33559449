//! Derives a single active power value from whichever registers a meter
//! exposes.
//!
//! Meter firmware differs in what it reports: some only send the net total,
//! some split import and export, some only per phase. The resolver walks a
//! fixed priority ladder and takes the first strategy that yields data.

use serde::Serialize;

use crate::models::RegisterMap;
use crate::obis_utils::{numeric_value, sum_registers, Quantity};

pub const NET_TOTAL: &str = "16.7.0";
pub const IMPORT_TOTAL: &str = "1.7.0";
pub const EXPORT_TOTAL: &str = "2.7.0";
pub const PHASE_IMPORT: [&str; 3] = ["21.7.0", "41.7.0", "61.7.0"];
pub const PHASE_EXPORT: [&str; 3] = ["22.7.0", "42.7.0", "62.7.0"];
pub const PHASE_INSTANTANEOUS: [&str; 3] = ["36.7.0", "56.7.0", "76.7.0"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PowerSource {
    NetTotal,
    ImportMinusExport,
    PhaseImportExportSum,
    PhaseInstantaneousSum,
    NotFound,
}

/// Active power in watts, negative while exporting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResolvedPower {
    pub value: f64,
    pub source: PowerSource,
}

impl ResolvedPower {
    pub fn not_found() -> Self {
        ResolvedPower { value: f64::NAN, source: PowerSource::NotFound }
    }

    pub fn is_found(&self) -> bool {
        self.source != PowerSource::NotFound
    }
}

pub fn resolve(registers: &RegisterMap) -> ResolvedPower {
    let net = numeric_value(registers.lookup_code(NET_TOTAL), Quantity::Power);
    if net.is_finite() {
        return ResolvedPower { value: net, source: PowerSource::NetTotal };
    }

    let import = numeric_value(registers.lookup_code(IMPORT_TOTAL), Quantity::Power);
    let export = numeric_value(registers.lookup_code(EXPORT_TOTAL), Quantity::Power);
    if import.is_finite() || export.is_finite() {
        return ResolvedPower {
            value: finite_or_zero(import) - finite_or_zero(export),
            source: PowerSource::ImportMinusExport,
        };
    }

    let phase_import = sum_registers(registers, &PHASE_IMPORT, Quantity::Power);
    let phase_export = sum_registers(registers, &PHASE_EXPORT, Quantity::Power);
    if phase_import != 0.0 || phase_export != 0.0 {
        return ResolvedPower {
            value: phase_import - phase_export,
            source: PowerSource::PhaseImportExportSum,
        };
    }

    let instantaneous = sum_registers(registers, &PHASE_INSTANTANEOUS, Quantity::Power);
    if instantaneous != 0.0 {
        return ResolvedPower {
            value: instantaneous,
            source: PowerSource::PhaseInstantaneousSum,
        };
    }

    ResolvedPower::not_found()
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() { v } else { 0.0 }
}
