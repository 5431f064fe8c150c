//! Per-epoch metric history and on-disk checkpoints.
//!
//! Layout inside the run directory:
//! ```text
//! loss.csv                   one row per completed epoch (append-only)
//! regularization_terms.csv   one row per checkpoint epoch
//! volume_ep_XXXX.bvol        volume checkpoints
//! ```

use crate::core::BirefringentVolume;
use crate::error::Result;
use crate::io::volume_file::save_volume;
use crate::optim::LossState;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const LOSS_CSV: &str = "loss.csv";
pub const REGULARIZATION_CSV: &str = "regularization_terms.csv";

const LOSS_COLUMNS: [&str; 5] = [
    "Total Loss",
    "Data Term Loss",
    "Regularization Term Loss",
    "Optic Axis Learning Rate",
    "Birefringence Learning Rate",
];

/// Append-only store of [`LossState`]s backed by CSV files.
pub struct ResultStore {
    dir: PathBuf,
    dual_groups: bool,
    history: Vec<LossState>,
    /// Number of history entries already written to `loss.csv`.
    flushed: usize,
}

impl ResultStore {
    /// Create the run directory and write both CSV headers.
    ///
    /// Without dual parameter groups the two learning-rate columns are omitted.
    pub fn new(dir: &Path, dual_groups: bool, reg_names: &[&str]) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let columns = if dual_groups {
            &LOSS_COLUMNS[..]
        } else {
            &LOSS_COLUMNS[..3]
        };
        let mut loss = File::create(dir.join(LOSS_CSV))?;
        writeln!(loss, "{}", columns.join(", "))?;

        let mut reg = File::create(dir.join(REGULARIZATION_CSV))?;
        let mut header = vec!["ep"];
        header.extend_from_slice(reg_names);
        writeln!(reg, "{}", header.join(", "))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            dual_groups,
            history: Vec::new(),
            flushed: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn append(&mut self, state: LossState) {
        self.history.push(state);
    }

    pub fn history(&self) -> &[LossState] {
        &self.history
    }

    pub fn last(&self) -> Option<&LossState> {
        self.history.last()
    }

    pub fn into_history(self) -> Vec<LossState> {
        self.history
    }

    /// Write every epoch recorded since the last flush to `loss.csv`.
    pub fn flush_losses(&mut self) -> Result<()> {
        if self.flushed == self.history.len() {
            return Ok(());
        }
        let file = OpenOptions::new().append(true).open(self.dir.join(LOSS_CSV))?;
        let mut w = BufWriter::new(file);
        for state in &self.history[self.flushed..] {
            write!(w, "{}, {}, {}", state.total, state.data_term, state.reg_term)?;
            if self.dual_groups {
                let lr_axis = state.learning_rates.first().copied().unwrap_or(f32::NAN);
                let lr_bir = state.learning_rates.get(1).copied().unwrap_or(f32::NAN);
                write!(w, ", {lr_axis}, {lr_bir}")?;
            }
            writeln!(w)?;
        }
        w.flush()?;
        self.flushed = self.history.len();
        Ok(())
    }

    /// Append the latest per-regularizer values, tagged with `epoch`.
    pub fn write_regularization_row(&self, epoch: usize) -> Result<()> {
        let Some(state) = self.history.last() else {
            return Ok(());
        };
        let mut file = OpenOptions::new()
            .append(true)
            .open(self.dir.join(REGULARIZATION_CSV))?;
        let mut row = vec![epoch.to_string()];
        row.extend(state.reg_values.iter().map(|v| v.to_string()));
        writeln!(file, "{}", row.join(", "))?;
        Ok(())
    }

    pub fn save_volume_checkpoint(&self, epoch: usize, volume: &BirefringentVolume) -> Result<PathBuf> {
        let path = self.dir.join(format!("volume_ep_{epoch:04}.bvol"));
        save_volume(&path, volume, &format!("Volume after {epoch} iterations"))?;
        Ok(path)
    }
}
