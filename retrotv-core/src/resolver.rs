//! Program pool resolution contract.
//!
//! The core never talks to source-specific catalog APIs; an external
//! resolver turns abstract slot programming into concrete weighted pools and
//! persists programs it has not seen before, deduplicated by external
//! identity.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{PendingProgram, ProgramId, SlotProgramming};
use crate::scheduler::ProgramPool;

#[async_trait]
pub trait ProgramPoolResolver: Send + Sync {
    /// Resolve a slot's programming class to its ordered item pool.
    ///
    /// Returns `Error::NotFound` when the referenced show/list/collection no
    /// longer exists; the caller marks the slot missing rather than failing
    /// the whole build.
    async fn resolve_group(&self, programming: &SlotProgramming) -> Result<ProgramPool>;

    /// Persist programs that only exist as external references, returning
    /// persisted ids keyed by external identity. Keys absent from the result
    /// stay pending.
    async fn upsert(&self, programs: &[PendingProgram]) -> Result<HashMap<String, ProgramId>>;
}
