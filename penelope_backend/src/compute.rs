//! Two logical compute slots over one engine cache.
//!
//! The engine holds exactly one working cache. The slot not in use is kept as
//! a parked [`StateHandle`]; switching saves the active cache and loads the
//! parked one, so each transcript keeps its own evaluated prefix.

use crate::engine::{InferenceEngine, StateHandle};
use crate::error::PenelopeResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Speaking,
    Reflecting,
}

impl Slot {
    pub fn other(self) -> Self {
        match self {
            Slot::Speaking => Slot::Reflecting,
            Slot::Reflecting => Slot::Speaking,
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::Speaking => write!(f, "speaking"),
            Slot::Reflecting => write!(f, "reflecting"),
        }
    }
}

/// Slot assignment to return to if an episode is abandoned.
#[derive(Debug, Clone)]
pub struct SlotCheckpoint {
    active: Slot,
    parked: StateHandle,
}

#[derive(Debug)]
pub struct ComputeSlots {
    active: Slot,
    parked: StateHandle,
    seed: StateHandle,
}

impl ComputeSlots {
    /// Snapshot the engine's fresh cache as the seed for both slots.
    pub fn new<E: InferenceEngine + ?Sized>(engine: &mut E) -> PenelopeResult<Self> {
        let seed = engine.save_state()?;
        Ok(Self {
            active: Slot::Speaking,
            parked: seed.clone(),
            seed,
        })
    }

    pub fn active(&self) -> Slot {
        self.active
    }

    /// Make `target` the engine's working cache. No-op if it already is.
    pub fn activate<E: InferenceEngine + ?Sized>(
        &mut self,
        engine: &mut E,
        target: Slot,
    ) -> PenelopeResult<()> {
        if self.active == target {
            return Ok(());
        }
        let saved = engine.save_state()?;
        engine.load_state(&self.parked)?;
        tracing::debug!("Compute slot {} -> {}", self.active, target);
        self.parked = saved;
        self.active = target;
        Ok(())
    }

    pub fn checkpoint(&self) -> SlotCheckpoint {
        SlotCheckpoint {
            active: self.active,
            parked: self.parked.clone(),
        }
    }

    /// Return to a checkpoint, discarding whatever the other slot computed
    /// since.
    pub fn restore<E: InferenceEngine + ?Sized>(
        &mut self,
        engine: &mut E,
        checkpoint: SlotCheckpoint,
    ) -> PenelopeResult<()> {
        if self.active != checkpoint.active {
            // The checkpoint's active slot is what is parked now.
            engine.load_state(&self.parked)?;
        }
        self.active = checkpoint.active;
        self.parked = checkpoint.parked;
        Ok(())
    }

    /// Drop both slots back to the seed state.
    pub fn reset<E: InferenceEngine + ?Sized>(&mut self, engine: &mut E) -> PenelopeResult<()> {
        engine.load_state(&self.seed)?;
        self.parked = self.seed.clone();
        self.active = Slot::Speaking;
        Ok(())
    }
}
