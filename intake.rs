//! Raw-transaction intake queue.
//!
//! Submitters drop JSON records into the queue directory:
//!
//! ```json
//! { "raw": "0x02f8...", "hash": "0xabc...", "parsed": { "from": "0x..." } }
//! ```
//!
//! Each sweep takes records in file-name order, normalizes and admits them,
//! flushes the pool, then moves the file to `processed/` whatever the
//! outcome. A crash between admission and the move only causes a second
//! attempt, which the duplicate checks absorb.

use crate::context::RunContext;
use crate::mempool::Mempool;
use crate::normalize::{AddressRecovery, Normalizer, ParsedHint};
use crate::types::{Hash32, UnixTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use std::{fs, io};
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntakeRecord {
    pub raw: String,
    #[serde(default)]
    pub hash: Option<Hash32>,
    #[serde(default)]
    pub parsed: Option<ParsedHint>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    Accepted { file: String, hash: Hash32 },
    Rejected { file: String, reason: String, detail: String },
    Error { file: String, detail: String },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IntakeReport {
    pub processed: usize,
    pub accepted: usize,
    pub rejected: BTreeMap<String, usize>,
    pub errors: usize,
    pub elapsed_ms: u128,
    /// Per-record outcomes; only filled for verbose runs.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub records: Vec<RecordOutcome>,
}

impl IntakeReport {
    pub fn rejected_total(&self) -> usize {
        self.rejected.values().sum()
    }
}

pub struct IntakeQueue {
    dir: PathBuf,
    processed: PathBuf,
}

impl IntakeQueue {
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        let processed = dir.join("processed");
        fs::create_dir_all(&processed)?;
        Ok(Self { dir, processed })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Queue a record (used by tests and the CLI `submit` command).
    pub fn enqueue(&self, name: &str, record: &IntakeRecord) -> io::Result<PathBuf> {
        let path = self.dir.join(format!("{name}.json"));
        crate::storage::write_json_atomic(&path, record)?;
        Ok(path)
    }

    /// Queued record files in name order.
    pub fn pending(&self) -> io::Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().map_or(false, |x| x == "json"))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Process up to `max_records` queued records.
    pub fn sweep<R: AddressRecovery>(
        &self,
        normalizer: &Normalizer<R>,
        mempool: &Mempool,
        now: UnixTime,
        max_records: usize,
        ctx: &RunContext,
    ) -> io::Result<IntakeReport> {
        let started = Instant::now();
        let mut report = IntakeReport::default();

        for path in self.pending()?.into_iter().take(max_records) {
            let file = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let outcome = self.process_one(&path, &file, normalizer, mempool, now);
            match &outcome {
                RecordOutcome::Accepted { hash, .. } => {
                    // admission must be durable before the record leaves the queue
                    mempool.flush()?;
                    report.accepted += 1;
                    debug!(%file, %hash, "intake accepted");
                }
                RecordOutcome::Rejected { reason, detail, .. } => {
                    *report.rejected.entry(reason.clone()).or_default() += 1;
                    debug!(%file, %reason, %detail, "intake rejected");
                }
                RecordOutcome::Error { detail, .. } => {
                    report.errors += 1;
                    warn!(%file, %detail, "intake record unreadable");
                }
            }
            fs::rename(&path, self.processed.join(&file))?;
            report.processed += 1;
            if ctx.verbose() {
                report.records.push(outcome);
            }
        }

        report.elapsed_ms = started.elapsed().as_millis();
        if report.processed > 0 && !ctx.quiet() {
            info!(
                processed = report.processed,
                accepted = report.accepted,
                rejected = report.rejected_total(),
                errors = report.errors,
                "intake sweep"
            );
        }
        Ok(report)
    }

    fn process_one<R: AddressRecovery>(
        &self,
        path: &Path,
        file: &str,
        normalizer: &Normalizer<R>,
        mempool: &Mempool,
        now: UnixTime,
    ) -> RecordOutcome {
        let error = |detail: String| RecordOutcome::Error { file: file.to_string(), detail };
        let record: IntakeRecord = match fs::read(path)
            .map_err(|e| e.to_string())
            .and_then(|b| serde_json::from_slice(&b).map_err(|e| e.to_string()))
        {
            Ok(r) => r,
            Err(e) => return error(e),
        };
        let raw = match hex::decode(record.raw.trim_start_matches("0x")) {
            Ok(b) => b,
            Err(e) => return error(format!("raw hex: {e}")),
        };

        let tx = match normalizer.normalize(&raw, record.hash.as_ref(), record.parsed.as_ref(), now) {
            Ok(tx) => tx,
            Err(e) => {
                return RecordOutcome::Rejected {
                    file: file.to_string(),
                    reason: e.label().to_string(),
                    detail: e.to_string(),
                }
            }
        };
        match mempool.admit(tx, now) {
            Ok(a) => RecordOutcome::Accepted { file: file.to_string(), hash: a.hash },
            Err(reason) => RecordOutcome::Rejected {
                file: file.to_string(),
                reason: reason.label().to_string(),
                detail: reason.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Verbosity;
    use crate::mempool::{ConfirmedIndex, PoolPolicy};
    use crate::normalize::RecoveryError;
    use crate::types::{keccak256, Address, Amount, Fingerprint};
    use ::rlp::RlpStream;
    use std::sync::Arc;

    struct Nothing;
    impl ConfirmedIndex for Nothing {
        fn contains_hash(&self, _: &Hash32) -> bool { false }
        fn contains_fingerprint(&self, _: &Fingerprint) -> bool { false }
        fn max_nonce(&self, _: &Address) -> Option<u64> { None }
    }

    struct Sender;
    impl AddressRecovery for Sender {
        fn recover_address(&self, _: &[u8]) -> Result<Address, RecoveryError> {
            Ok(Address::from_bytes([0xaa; 20]))
        }
    }

    fn raw(nonce: u64) -> Vec<u8> {
        let mut s = RlpStream::new_list(9);
        s.append(&nonce);
        s.append(&1_000_000_000u64);
        s.append(&21_000u64);
        s.append(&[0xbbu8; 20].as_slice());
        s.append(&1u64);
        s.append(&"");
        s.append(&27u8);
        s.append(&[1u8; 32].as_slice());
        s.append(&[2u8; 32].as_slice());
        s.out().to_vec()
    }

    fn record(raw: &[u8]) -> IntakeRecord {
        IntakeRecord {
            raw: format!("0x{}", hex::encode(raw)),
            hash: Some(Hash32(keccak256(raw))),
            parsed: None,
        }
    }

    #[test]
    fn sweep_moves_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let queue = IntakeQueue::open(dir.path().join("intake")).unwrap();
        let pool = Mempool::new(PoolPolicy { fee_floor: Amount::ZERO, ..PoolPolicy::default() }, Arc::new(Nothing));
        let normalizer = Normalizer::with_recovery(Amount::ZERO, Sender);

        queue.enqueue("001", &record(&raw(1))).unwrap();
        queue.enqueue("002", &record(&raw(1))).unwrap(); // same bytes, same hash
        let mut bad = record(&raw(2));
        bad.hash = Some(Hash32([0; 32]));
        queue.enqueue("003", &bad).unwrap();
        fs::write(queue.dir().join("004.json"), b"not json").unwrap();

        let ctx = RunContext::new(Verbosity::Verbose);
        let report = queue.sweep(&normalizer, &pool, 10, 100, &ctx).unwrap();
        assert_eq!(report.processed, 4);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected.get("duplicate_hash"), Some(&1));
        assert_eq!(report.rejected.get("hash_mismatch"), Some(&1));
        assert_eq!(report.errors, 1);
        assert_eq!(report.records.len(), 4);
        assert!(queue.pending().unwrap().is_empty());
        assert_eq!(fs::read_dir(dir.path().join("intake/processed")).unwrap().count(), 4);
    }

    #[test]
    fn quiet_runs_skip_per_record_detail() {
        let dir = tempfile::tempdir().unwrap();
        let queue = IntakeQueue::open(dir.path()).unwrap();
        let pool = Mempool::new(PoolPolicy { fee_floor: Amount::ZERO, ..PoolPolicy::default() }, Arc::new(Nothing));
        let normalizer = Normalizer::with_recovery(Amount::ZERO, Sender);
        queue.enqueue("a", &record(&raw(5))).unwrap();
        queue.enqueue("b", &record(&raw(6))).unwrap();

        let report = queue.sweep(&normalizer, &pool, 0, 1, &RunContext::default()).unwrap();
        assert_eq!(report.processed, 1);
        assert!(report.records.is_empty());
        assert_eq!(queue.pending().unwrap().len(), 1);
    }
}
