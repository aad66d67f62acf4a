//! Time series recorded by the control loop
//!
//! One [`LogRecord`] per tick holding the plant state after the step and
//! the command that produced it. The log can be written as CSV for
//! external plotting.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use csv::WriterBuilder;
use serde::Serialize;

use crate::common::{ControlInput, MpcResult, VehicleState};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LogRecord {
    /// simulation time [s]
    pub t: f64,
    pub x: f64,
    pub y: f64,
    pub psi: f64,
    pub vel: f64,
    pub acc: f64,
    pub delta: f64,
}

impl LogRecord {
    pub fn new(t: f64, state: &VehicleState, control: &ControlInput) -> Self {
        Self {
            t,
            x: state.pos_x,
            y: state.pos_y,
            psi: state.psi,
            vel: state.vel,
            acc: control.acc,
            delta: control.delta,
        }
    }

    pub fn state(&self) -> VehicleState {
        VehicleState::new(self.x, self.y, self.psi, self.vel)
    }

    pub fn control(&self) -> ControlInput {
        ControlInput::new(self.acc, self.delta)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunLog {
    records: Vec<LogRecord>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: LogRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&LogRecord> {
        self.records.last()
    }

    /// Serialise every record as CSV with a header row
    pub fn write_csv<W: Write>(&self, writer: W) -> MpcResult<()> {
        let mut w = WriterBuilder::new().has_headers(true).from_writer(writer);
        for record in &self.records {
            w.serialize(record)?;
        }
        w.flush()?;
        Ok(())
    }

    pub fn save_csv<P: AsRef<Path>>(&self, path: P) -> MpcResult<()> {
        let file = File::create(path)?;
        self.write_csv(file)
    }
}
