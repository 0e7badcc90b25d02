//! Schema version tracking and ordered slice migrations.
//!
//! [`MigrationEngine::run`] is called once at startup, before any slice is
//! read. Steps transform a full [`Snapshot`] and return a new one; the result
//! and the new version are committed in a single batch, so an interrupted run
//! simply starts again from the last committed version.
//!
//! Nothing here is fatal. A newer-than-known version, a failing step or a step
//! returning malformed slices all end in a destructive reset: every slice is
//! cleared and the version is set to the current one.

mod steps;

use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, error, info, warn};

use crate::error::{MigrationError, StoreError};
use crate::kv::BatchOp;
use crate::store::{PersistentStore, SliceKey, Snapshot};

pub use steps::default_steps;

/// Schema version written by this release.
pub const CURRENT_VERSION: u32 = 1;

/// Key the schema version is stored under.
pub const VERSION_KEY: &str = "@smartcart/data_version";

/// One migration step: takes the snapshot at version `n - 1`, returns it at `n`.
pub type MigrationStep = Box<dyn Fn(Snapshot) -> Result<Snapshot, String> + Send + Sync>;

/// Where the engine is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
  Unchecked,
  UpToDate,
  Migrating,
  FailedAndReset,
}

/// What a [`MigrationEngine::run`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
  /// Stored version already matched.
  UpToDate { version: u32 },
  /// Steps `from + 1 ..= to` were applied and committed.
  Migrated { from: u32, to: u32 },
  /// All slices were cleared and the version set to `to`.
  Reset { from: u32, to: u32, reason: String },
  /// The stored version could not be read; nothing was touched.
  Deferred { reason: String },
}

pub struct MigrationEngine {
  store: PersistentStore,
  current: u32,
  steps: BTreeMap<u32, MigrationStep>,
  state: MigrationState,
}

impl fmt::Debug for MigrationEngine {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MigrationEngine")
      .field("current", &self.current)
      .field("steps", &self.steps.keys().collect::<Vec<_>>())
      .field("state", &self.state)
      .finish()
  }
}

impl MigrationEngine {
  /// Engine targeting [`CURRENT_VERSION`] with the built-in steps.
  pub fn new(store: PersistentStore) -> Self {
    let mut engine = Self::with_target(store, CURRENT_VERSION);
    for (version, step) in default_steps() {
      engine = engine.with_step(version, step);
    }
    engine
  }

  /// Engine targeting `current` with no steps registered yet.
  pub fn with_target(store: PersistentStore, current: u32) -> Self {
    Self {
      store,
      current,
      steps: BTreeMap::new(),
      state: MigrationState::Unchecked,
    }
  }

  /// Register the step that produces version `version`.
  pub fn with_step(mut self, version: u32, step: MigrationStep) -> Self {
    self.steps.insert(version, step);
    self
  }

  pub fn state(&self) -> MigrationState {
    self.state
  }

  pub fn target_version(&self) -> u32 {
    self.current
  }

  /// Read the persisted schema version. Absent or unparsable means 0.
  pub async fn current_version(&self) -> Result<u32, StoreError> {
    let Some(bytes) = self.store.kv().get(VERSION_KEY).await? else {
      return Ok(0);
    };

    let parsed = std::str::from_utf8(&bytes)
      .ok()
      .and_then(|s| s.trim().parse::<u32>().ok());

    match parsed {
      Some(version) => Ok(version),
      None => {
        warn!("stored schema version is unreadable, treating as 0");
        Ok(0)
      }
    }
  }

  /// Bring the stored slices up to the target version.
  pub async fn run(&mut self) -> MigrationOutcome {
    let stored = match self.current_version().await {
      Ok(version) => version,
      Err(e) => {
        warn!(error = %e, "could not read schema version, skipping migration");
        self.state = MigrationState::Unchecked;
        return MigrationOutcome::Deferred {
          reason: e.to_string(),
        };
      }
    };

    if stored == self.current {
      debug!(version = stored, "schema up to date");
      self.state = MigrationState::UpToDate;
      return MigrationOutcome::UpToDate { version: stored };
    }

    if stored > self.current {
      warn!(
        stored,
        current = self.current,
        "data was written by a newer release, resetting local data"
      );
      return self
        .reset(
          stored,
          format!("stored version {stored} is newer than {}", self.current),
        )
        .await;
    }

    let snapshot = match self.store.snapshot().await {
      Ok(snapshot) => without_corrupt_slices(snapshot),
      Err(e) => {
        warn!(error = %e, "could not read slices, skipping migration");
        self.state = MigrationState::Unchecked;
        return MigrationOutcome::Deferred {
          reason: e.to_string(),
        };
      }
    };

    self.state = MigrationState::Migrating;
    info!(from = stored, to = self.current, "migrating local data");

    match self.migrate(stored, snapshot).await {
      Ok(()) => {
        info!(from = stored, to = self.current, "migration complete");
        self.state = MigrationState::UpToDate;
        MigrationOutcome::Migrated {
          from: stored,
          to: self.current,
        }
      }
      Err(e) => {
        error!(from = stored, error = %e, "migration failed, local data will be lost");
        self.reset(stored, e.to_string()).await
      }
    }
  }

  async fn migrate(&self, from: u32, mut snapshot: Snapshot) -> Result<(), MigrationError> {
    for version in (from + 1)..=self.current {
      let step = self
        .steps
        .get(&version)
        .ok_or(MigrationError::MissingStep(version))?;

      snapshot = step(snapshot).map_err(|reason| MigrationError::StepFailed { version, reason })?;

      for (key, value) in &snapshot {
        key
          .check_shape(value)
          .map_err(|source| MigrationError::InvalidOutput {
            version,
            slice: key.name(),
            source,
          })?;
      }
      debug!(version, "migration step applied");
    }

    self
      .store
      .commit(&snapshot, vec![self.version_op()])
      .await?;
    Ok(())
  }

  async fn reset(&mut self, from: u32, reason: String) -> MigrationOutcome {
    self.state = MigrationState::FailedAndReset;

    if let Err(e) = self.store.commit(&Snapshot::new(), vec![self.version_op()]).await {
      // Leave the old version in place; the next launch tries again.
      error!(error = %e, "failed to reset local data");
    } else {
      warn!(
        slices = ?SliceKey::ALL.map(SliceKey::name),
        version = self.current,
        "local data cleared"
      );
    }

    MigrationOutcome::Reset {
      from,
      to: self.current,
      reason,
    }
  }

  fn version_op(&self) -> BatchOp {
    BatchOp::Set {
      key: VERSION_KEY.to_owned(),
      value: self.current.to_string().into_bytes(),
    }
  }
}

/// Drop slices that already fail their shape check, so steps only see valid
/// input. Dropped slices are removed by the commit.
fn without_corrupt_slices(mut snapshot: Snapshot) -> Snapshot {
  snapshot.retain(|key, value| match key.check_shape(value) {
    Ok(()) => true,
    Err(e) => {
      warn!(slice = %key, error = %e, "discarding corrupted slice before migration");
      false
    }
  });
  snapshot
}
