//! Merge/Conflict Resolver
//!
//! Reconciles the remote catalog with the local store record by record,
//! using the per-record version counter and the locally remembered common
//! ancestor (`base_version`):
//!
//! | remote | local | outcome |
//! |---|---|---|
//! | present | absent | adopt remote |
//! | absent | present | adopt local |
//! | unchanged since base | unchanged | keep |
//! | changed since base | unchanged | adopt remote |
//! | unchanged since base | changed (dirty) | adopt local |
//! | changed since base | changed (dirty) | conflict, tie-break decides the kept value |
//!
//! A double write that produced identical payloads is convergent and not a conflict.

use super::models::{
    CatalogRecord, ConflictEntry, ConflictWinner, LocalRecord, MergeStats, TieBreak,
};
use chrono::Utc;
use std::collections::BTreeMap;

/// Per-record merge classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeClass {
    Unchanged,
    RemoteOnly,
    LocalOnly,
    FastForwardRemote,
    FastForwardLocal,
    Conflict,
}

/// One record of the merged catalog
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRecord {
    pub record: CatalogRecord,
    pub class: MergeClass,

    /// Local version observed when the merge input was loaded (`None` if the
    /// record did not exist locally). Publishing skips records whose local
    /// version moved on in the meantime.
    pub expected_local_version: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutput {
    /// Exactly one entry per identifier, sorted by id
    pub records: Vec<MergedRecord>,
    pub conflicts: Vec<ConflictEntry>,
    pub stats: MergeStats,
}

impl MergeOutput {
    /// The catalog to upload
    pub fn snapshot_records(&self) -> Vec<CatalogRecord> {
        self.records.iter().map(|m| m.record.clone()).collect()
    }

    /// Whether the merged catalog differs from what the remote already holds
    pub fn changes_remote(&self) -> bool {
        let local_won_conflict = self
            .conflicts
            .iter()
            .any(|c| c.winner == ConflictWinner::Local);

        self.stats.local_only > 0 || self.stats.fast_forward_local > 0 || local_won_conflict
    }
}

pub struct MergeResolver {
    tie_break: TieBreak,
}

impl MergeResolver {
    pub fn new(tie_break: TieBreak) -> Self {
        Self { tie_break }
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// Full three-way merge of the remote baseline with local state
    pub fn merge(&self, remote: &[CatalogRecord], local: &[LocalRecord]) -> MergeOutput {
        let remote_by_id: BTreeMap<&str, &CatalogRecord> =
            remote.iter().map(|r| (r.id.as_str(), r)).collect();
        let local_by_id: BTreeMap<&str, &LocalRecord> =
            local.iter().map(|l| (l.record.id.as_str(), l)).collect();

        let mut ids: Vec<&str> = remote_by_id.keys().chain(local_by_id.keys()).copied().collect();
        ids.sort_unstable();
        ids.dedup();

        let mut output = MergeOutput::default();

        for id in ids {
            let merged = match (remote_by_id.get(id), local_by_id.get(id)) {
                (Some(remote), None) => {
                    output.stats.remote_only += 1;
                    MergedRecord {
                        record: (*remote).clone(),
                        class: MergeClass::RemoteOnly,
                        expected_local_version: None,
                    }
                }
                (None, Some(local)) => {
                    output.stats.local_only += 1;
                    MergedRecord {
                        record: local.record.clone(),
                        class: MergeClass::LocalOnly,
                        expected_local_version: Some(local.record.version),
                    }
                }
                (Some(remote), Some(local)) => self.merge_pair(remote, local, &mut output),
                (None, None) => continue,
            };

            output.records.push(merged);
        }

        output
    }

    fn merge_pair(
        &self,
        remote: &CatalogRecord,
        local: &LocalRecord,
        output: &mut MergeOutput,
    ) -> MergedRecord {
        let expected_local_version = Some(local.record.version);
        let remote_changed = local.base_version.map_or(true, |base| remote.version > base);
        let local_changed = local.dirty;

        let (record, class) = match (local_changed, remote_changed) {
            (true, true) if local.record.same_payload(remote) => {
                // Convergent edit; remote already carries it
                output.stats.unchanged += 1;
                (remote.clone(), MergeClass::Unchanged)
            }
            (true, true) => {
                output.stats.conflicts += 1;
                let winner = self.pick_winner(remote, &local.record);
                let record = match winner {
                    ConflictWinner::Remote => remote.clone(),
                    ConflictWinner::Local => {
                        // Keep the counter monotonic past both variants
                        let mut record = local.record.clone();
                        record.version = local.record.version.max(remote.version) + 1;
                        record
                    }
                };

                output.conflicts.push(ConflictEntry {
                    record_id: remote.id.clone(),
                    base_version: local.base_version,
                    local: local.record.clone(),
                    remote: remote.clone(),
                    winner,
                    detected_at: Utc::now(),
                });
                (record, MergeClass::Conflict)
            }
            (false, true) => {
                output.stats.fast_forward_remote += 1;
                (remote.clone(), MergeClass::FastForwardRemote)
            }
            (true, false) => {
                output.stats.fast_forward_local += 1;
                (local.record.clone(), MergeClass::FastForwardLocal)
            }
            (false, false) if local.record.version == remote.version => {
                output.stats.unchanged += 1;
                (remote.clone(), MergeClass::Unchanged)
            }
            (false, false) => {
                // Remote went back below our ancestor (restored from backup):
                // re-publish what we last agreed on
                output.stats.fast_forward_local += 1;
                (local.record.clone(), MergeClass::FastForwardLocal)
            }
        };

        MergedRecord {
            record,
            class,
            expected_local_version,
        }
    }

    fn pick_winner(&self, remote: &CatalogRecord, local: &CatalogRecord) -> ConflictWinner {
        match self.tie_break {
            TieBreak::RemoteWins => ConflictWinner::Remote,
            TieBreak::LocalWins => ConflictWinner::Local,
            TieBreak::NewestTimestamp if local.updated_at > remote.updated_at => {
                ConflictWinner::Local
            }
            TieBreak::NewestTimestamp => ConflictWinner::Remote,
        }
    }

    /// Read-only adoption used when the lease is held elsewhere: remote
    /// updates for records without pending local changes. Never conflicts.
    pub fn fast_forward(&self, remote: &[CatalogRecord], local: &[LocalRecord]) -> Vec<MergedRecord> {
        let local_by_id: BTreeMap<&str, &LocalRecord> =
            local.iter().map(|l| (l.record.id.as_str(), l)).collect();

        let mut adopted: Vec<MergedRecord> = remote
            .iter()
            .filter_map(|remote| match local_by_id.get(remote.id.as_str()) {
                None => Some(MergedRecord {
                    record: remote.clone(),
                    class: MergeClass::RemoteOnly,
                    expected_local_version: None,
                }),
                Some(local)
                    if !local.dirty
                        && local.base_version.map_or(true, |base| remote.version > base) =>
                {
                    Some(MergedRecord {
                        record: remote.clone(),
                        class: MergeClass::FastForwardRemote,
                        expected_local_version: Some(local.record.version),
                    })
                }
                Some(_) => None,
            })
            .collect();

        adopted.sort_by(|a, b| a.record.id.cmp(&b.record.id));
        adopted
    }
}

impl Default for MergeResolver {
    fn default() -> Self {
        Self::new(TieBreak::default())
    }
}
