//! Built-in migration steps, keyed by the version they produce.

use super::MigrationStep;
use crate::store::Snapshot;

/// Steps shipped with this release.
///
/// Version 1 is the baseline layout and leaves existing documents as they are.
/// Later steps are appended here with the version they produce.
pub fn default_steps() -> Vec<(u32, MigrationStep)> {
  vec![(1, Box::new(baseline) as MigrationStep)]
}

fn baseline(snapshot: Snapshot) -> Result<Snapshot, String> {
  Ok(snapshot)
}
