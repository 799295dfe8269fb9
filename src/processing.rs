//! Shot demultiplexing.
//!
//! Turns one raw buffer (`nsamples × nshots`) into one vector of `nshots`
//! values per enabled channel, followed by one per enabled chopper. The
//! ownership table that built the task decides which rows belong to whom;
//! processing a buffer against any other table is meaningless.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::Serialize;
use tmux_shots_api::{ShotKind, ShotMatrix};

use crate::channel::{Channel, Chopper};
use crate::error::{AppResult, DaqError};
use crate::hardware::RawSamples;
use crate::scheduler::{channel_id, OwnershipTable};

/// Chopper samples at or below this voltage demodulate to -1.
pub const CHOPPER_THRESHOLD: f64 = 1.0;

/// Demultiplexed shots of one acquisition cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShotVectorSet {
    /// One row per enabled channel, then one per enabled chopper.
    #[serde(serialize_with = "serialize_rows")]
    rows: Array2<f64>,
    names: Vec<String>,
    kinds: Vec<ShotKind>,
}

impl ShotVectorSet {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.nrows()
    }

    /// True when nothing is enabled.
    pub fn is_empty(&self) -> bool {
        self.rows.nrows() == 0
    }

    /// Shots per row.
    pub fn nshots(&self) -> usize {
        self.rows.ncols()
    }

    /// Row names, parallel to rows.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Row kinds, parallel to rows.
    pub fn kinds(&self) -> &[ShotKind] {
        &self.kinds
    }

    /// Row `index`, if any.
    pub fn row(&self, index: usize) -> Option<ArrayView1<'_, f64>> {
        (index < self.len()).then(|| self.rows.index_axis(Axis(0), index))
    }

    /// Row with the given name, if any.
    pub fn by_name(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        let index = self.names.iter().position(|n| n == name)?;
        self.row(index)
    }

    /// Copy into the hook's input type.
    pub fn to_matrix(&self) -> AppResult<ShotMatrix> {
        let rows = self.rows.outer_iter().map(|row| row.to_vec()).collect();
        Ok(ShotMatrix::new(rows, self.nshots())?)
    }
}

fn serialize_rows<S: serde::Serializer>(
    rows: &Array2<f64>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeSeq;
    let mut seq = serializer.serialize_seq(Some(rows.nrows()))?;
    for row in rows.outer_iter() {
        seq.serialize_element(&row.to_vec())?;
    }
    seq.end()
}

/// Demultiplex `raw` into shot vectors.
///
/// For channel `k`, signal rows are the slots owned by `k` up to and including
/// `signal_stop`; baseline rows are the slots owned by `k` after it. Disabled
/// entries keep their ids but produce no row.
pub fn process(
    raw: &RawSamples,
    table: &OwnershipTable,
    channels: &[Channel],
    choppers: &[Chopper],
) -> AppResult<ShotVectorSet> {
    if raw.nsamples() != table.len() {
        return Err(DaqError::Processing(format!(
            "raw buffer has {} slots but the ownership table has {}",
            raw.nsamples(),
            table.len()
        )));
    }

    let nshots = raw.nshots();
    let nrows = channels.iter().filter(|c| c.enabled).count()
        + choppers.iter().filter(|c| c.enabled).count();
    let mut rows = Array2::<f64>::zeros((nrows, nshots));
    let mut names = Vec::with_capacity(nrows);
    let mut kinds = Vec::with_capacity(nrows);
    let mut out = 0;

    for (ordinal, channel) in channels.iter().enumerate() {
        if !channel.enabled {
            continue;
        }
        let owned = table.rows_for(channel_id(ordinal));
        let (signal_rows, baseline_rows): (Vec<usize>, Vec<usize>) =
            owned.into_iter().partition(|&row| row <= channel.signal.stop);

        let mut shots = channel
            .signal_method
            .aggregate(raw.view().select(Axis(0), &signal_rows).view());
        if channel.use_baseline {
            let baseline = channel
                .baseline_method
                .aggregate(raw.view().select(Axis(0), &baseline_rows).view());
            shots -= &baseline;
        }
        if channel.invert {
            shots.mapv_inplace(|v| -v);
        }

        rows.row_mut(out).assign(&shots);
        names.push(channel.name.clone());
        kinds.push(ShotKind::Channel);
        out += 1;
    }

    for chopper in choppers.iter().filter(|c| c.enabled) {
        let reference = raw.row(chopper.index).ok_or_else(|| {
            DaqError::Processing(format!(
                "{}: chopper index {} outside raw buffer of {} slots",
                chopper.name,
                chopper.index,
                raw.nsamples()
            ))
        })?;
        let shots = demodulate(reference, chopper.invert);
        rows.row_mut(out).assign(&shots);
        names.push(chopper.name.clone());
        kinds.push(ShotKind::Chopper);
        out += 1;
    }

    Ok(ShotVectorSet { rows, names, kinds })
}

/// Binary demodulation of a chopper reference.
pub fn demodulate(reference: ArrayView1<'_, f64>, invert: bool) -> Array1<f64> {
    let sign = if invert { -1.0 } else { 1.0 };
    reference.mapv(|v| if v <= CHOPPER_THRESHOLD { -sign } else { sign })
}
