//! Safe-link log: durable intents for crash-sensitive multi-step operations.
//!
//! A safe-link is an item in the reserved locality at the end of the key
//! space, keyed by `(owner, link kind)`. It is recorded before the first
//! destructive step of the operation it protects and cleared after the
//! operation's last step has committed. A link still present at mount means
//! the operation did not finish; [`SafeLinkLog::replay_all`] re-runs it.
//!
//! # Payload format
//!
//! ```text
//! +------------------+--------+
//! | magic            | 4 bytes| = 0x4B4C_5354 ("TSLK" little-endian)
//! | version          | 1 byte | = 1
//! | link_kind        | 1 byte | LinkKind::as_u8
//! | reserved         | 2 bytes| = 0
//! | target_locality  | 8 bytes| stat-data key of the target object
//! | target_object    | 8 bytes|
//! | final_size       | 8 bytes| Truncate target size, 0 otherwise
//! | crc              | 4 bytes| CRC32c of all preceding bytes
//! +------------------+--------+
//! ```
//!
//! Replay is idempotent: the protected operations converge on the recorded
//! end state, so running them again after an interrupted `clear` changes
//! nothing.

use std::sync::Arc;
use tfs_error::{Result, TfsError};
use tfs_tree::{Item, KeyedStore, Transaction};
use tfs_types::{
    ItemKey, KeyKind, LinkKind, ObjectId, ParseError, ensure_slice, read_le_u32, read_le_u64,
};
use tracing::{debug, info, warn};

pub const SAFE_LINK_MAGIC: u32 = 0x4B4C_5354;

pub const SAFE_LINK_VERSION: u8 = 1;

/// Encoded payload size in bytes.
pub const SAFE_LINK_SIZE: usize = 4 + 1 + 1 + 2 + 8 + 8 + 8 + 4;

/// One crash-recoverable intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafeLinkRecord {
    /// Stat-data key of the protected object.
    pub target_sd_key: ItemKey,
    pub kind: LinkKind,
    /// For `Truncate`, the size to truncate to.
    pub final_size: u64,
}

impl SafeLinkRecord {
    #[must_use]
    pub fn truncate(owner: ObjectId, final_size: u64) -> Self {
        Self {
            target_sd_key: ItemKey::stat_data(owner),
            kind: LinkKind::Truncate,
            final_size,
        }
    }

    #[must_use]
    pub fn unlinked_open_file(owner: ObjectId) -> Self {
        Self {
            target_sd_key: ItemKey::stat_data(owner),
            kind: LinkKind::UnlinkedOpenFile,
            final_size: 0,
        }
    }

    #[must_use]
    pub fn conversion(owner: ObjectId) -> Self {
        Self {
            target_sd_key: ItemKey::stat_data(owner),
            kind: LinkKind::Conversion,
            final_size: 0,
        }
    }

    #[must_use]
    pub fn owner(&self) -> ObjectId {
        self.target_sd_key.object
    }

    /// Key the record is stored under.
    #[must_use]
    pub fn key(&self) -> ItemKey {
        ItemKey::safe_link(self.owner(), self.kind)
    }

    #[must_use]
    pub fn encode(&self) -> [u8; SAFE_LINK_SIZE] {
        let mut buf = [0_u8; SAFE_LINK_SIZE];
        buf[0..4].copy_from_slice(&SAFE_LINK_MAGIC.to_le_bytes());
        buf[4] = SAFE_LINK_VERSION;
        buf[5] = self.kind.as_u8();
        // bytes 6..8 are reserved (zeros)
        buf[8..16].copy_from_slice(&self.target_sd_key.locality.to_le_bytes());
        buf[16..24].copy_from_slice(&self.target_sd_key.object.0.to_le_bytes());
        buf[24..32].copy_from_slice(&self.final_size.to_le_bytes());
        let crc = crc32c::crc32c(&buf[..32]);
        buf[32..36].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, ParseError> {
        let body = ensure_slice(bytes, 0, SAFE_LINK_SIZE)?;
        let magic = read_le_u32(body, 0)?;
        if magic != SAFE_LINK_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SAFE_LINK_MAGIC),
                actual: u64::from(magic),
            });
        }
        let expected = read_le_u32(body, 32)?;
        let actual = crc32c::crc32c(&body[..32]);
        if expected != actual {
            return Err(ParseError::ChecksumMismatch { expected, actual });
        }
        if body[4] != SAFE_LINK_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported safe-link version",
            });
        }
        let kind = LinkKind::from_u8(body[5])?;
        let locality = read_le_u64(body, 8)?;
        let object = ObjectId(read_le_u64(body, 16)?);
        Ok(Self {
            target_sd_key: ItemKey {
                locality,
                object,
                kind: KeyKind::StatData,
                offset: 0,
            },
            kind,
            final_size: read_le_u64(body, 24)?,
        })
    }
}

/// Operations replay dispatches to.
pub trait LinkReplayer {
    /// Complete an interrupted truncate of `owner` to `final_size`.
    fn replay_truncate(&self, owner: ObjectId, final_size: u64) -> Result<()>;

    /// Finish deleting `owner`'s body and stat data.
    fn replay_unlink(&self, owner: ObjectId) -> Result<()>;

    /// Finish an interrupted tail/extent conversion of `owner`.
    fn replay_conversion(&self, owner: ObjectId) -> Result<()>;
}

/// Aggregate outcome of [`SafeLinkLog::replay_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Links whose operation was re-run and cleared.
    pub replayed: usize,
    /// Links dropped because their target no longer exists.
    pub dropped: usize,
    /// Links left in place because replay failed.
    pub failed: usize,
}

impl RecoveryReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.replayed + self.dropped + self.failed
    }
}

/// The safe-link log stored in a [`KeyedStore`].
#[derive(Clone)]
pub struct SafeLinkLog {
    store: Arc<dyn KeyedStore>,
}

impl std::fmt::Debug for SafeLinkLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeLinkLog").finish_non_exhaustive()
    }
}

impl SafeLinkLog {
    #[must_use]
    pub fn new(store: Arc<dyn KeyedStore>) -> Self {
        Self { store }
    }

    /// Stage `record` into `txn`, replacing any record with the same
    /// `(owner, kind)`. Commit `txn` together with (or before) the first
    /// destructive step of the protected operation.
    pub fn stage_record(txn: &mut Transaction, record: &SafeLinkRecord) {
        txn.stage_put(record.key(), Item::SafeLink(record.encode().to_vec()));
    }

    /// Stage removal of the `(owner, kind)` record into `txn`.
    pub fn stage_clear(txn: &mut Transaction, owner: ObjectId, kind: LinkKind) {
        txn.stage_remove(ItemKey::safe_link(owner, kind));
    }

    /// Record `record` in its own transaction.
    pub fn record(&self, record: &SafeLinkRecord) -> Result<()> {
        let mut txn = self.store.begin();
        Self::stage_record(&mut txn, record);
        self.store.commit(txn)?;
        debug!(
            target: "tfs::safelink",
            event = "recorded",
            owner = record.owner().0,
            kind = ?record.kind,
            final_size = record.final_size
        );
        Ok(())
    }

    /// Remove the `(owner, kind)` record in its own transaction.
    pub fn clear(&self, owner: ObjectId, kind: LinkKind) -> Result<()> {
        let mut txn = self.store.begin();
        Self::stage_clear(&mut txn, owner, kind);
        self.store.commit(txn)?;
        debug!(target: "tfs::safelink", event = "cleared", owner = owner.0, kind = ?kind);
        Ok(())
    }

    pub fn get(&self, owner: ObjectId, kind: LinkKind) -> Result<Option<SafeLinkRecord>> {
        match self.store.get(&ItemKey::safe_link(owner, kind))? {
            Some(Item::SafeLink(bytes)) => decode_item(owner, &bytes).map(Some),
            Some(other) => Err(TfsError::Corruption {
                object: owner.0,
                detail: format!("{:?} item in safe-link locality", other.kind()),
            }),
            None => Ok(None),
        }
    }

    /// Raw `(key, decoded record)` pairs of every pending link, in key order.
    pub fn pending(&self) -> Result<Vec<(ItemKey, Result<SafeLinkRecord>)>> {
        let items = self
            .store
            .range(&ItemKey::safe_link_min(), &ItemKey::safe_link_max())?;
        Ok(items
            .into_iter()
            .map(|(key, item)| {
                let decoded = match item {
                    Item::SafeLink(bytes) => decode_item(key.object, &bytes),
                    other => Err(TfsError::Corruption {
                        object: key.object.0,
                        detail: format!("{:?} item in safe-link locality", other.kind()),
                    }),
                };
                (key, decoded)
            })
            .collect())
    }

    /// Re-run every pending link's operation and clear it.
    ///
    /// A link whose target stat data is gone is dropped. A link whose replay
    /// fails is logged and left in place; the remaining links still run.
    pub fn replay_all(&self, replayer: &dyn LinkReplayer) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for (key, decoded) in self.pending()? {
            let record = match decoded {
                Ok(record) => record,
                Err(err) => {
                    warn!(
                        target: "tfs::safelink",
                        event = "undecodable",
                        key = %key,
                        error = %err
                    );
                    report.failed += 1;
                    continue;
                }
            };
            let owner = record.owner();
            if self.store.get(&record.target_sd_key)?.is_none() {
                self.clear(owner, record.kind)?;
                report.dropped += 1;
                debug!(target: "tfs::safelink", event = "dropped", owner = owner.0, kind = ?record.kind);
                continue;
            }
            let outcome = match record.kind {
                LinkKind::Truncate => replayer.replay_truncate(owner, record.final_size),
                LinkKind::UnlinkedOpenFile => replayer.replay_unlink(owner),
                LinkKind::Conversion => replayer.replay_conversion(owner),
            }
            .and_then(|()| self.clear(owner, record.kind));
            match outcome {
                Ok(()) => {
                    report.replayed += 1;
                    info!(
                        target: "tfs::safelink",
                        event = "replayed",
                        owner = owner.0,
                        kind = ?record.kind,
                        final_size = record.final_size
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        target: "tfs::safelink",
                        event = "replay_failed",
                        owner = owner.0,
                        kind = ?record.kind,
                        error = %err
                    );
                }
            }
        }
        if report.failed > 0 {
            warn!(
                target: "tfs::safelink",
                event = "recovery_incomplete",
                replayed = report.replayed,
                dropped = report.dropped,
                failed = report.failed
            );
        } else if report.total() > 0 {
            info!(
                target: "tfs::safelink",
                event = "recovery_complete",
                replayed = report.replayed,
                dropped = report.dropped
            );
        }
        Ok(report)
    }
}

fn decode_item(owner: ObjectId, bytes: &[u8]) -> Result<SafeLinkRecord> {
    SafeLinkRecord::decode(bytes).map_err(|err| TfsError::Corruption {
        object: owner.0,
        detail: format!("safe-link payload: {err}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tfs_tree::MemTreeStore;
    use tfs_types::StatData;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(ObjectId, LinkKind, u64)>>,
        fail_owner: Option<ObjectId>,
    }

    impl LinkReplayer for Recorder {
        fn replay_truncate(&self, owner: ObjectId, final_size: u64) -> Result<()> {
            if self.fail_owner == Some(owner) {
                return Err(TfsError::NoSpace);
            }
            self.calls.lock().push((owner, LinkKind::Truncate, final_size));
            Ok(())
        }

        fn replay_unlink(&self, owner: ObjectId) -> Result<()> {
            self.calls.lock().push((owner, LinkKind::UnlinkedOpenFile, 0));
            Ok(())
        }

        fn replay_conversion(&self, owner: ObjectId) -> Result<()> {
            self.calls.lock().push((owner, LinkKind::Conversion, 0));
            Ok(())
        }
    }

    fn log_with_objects(objects: &[u64]) -> (Arc<MemTreeStore>, SafeLinkLog) {
        let store = Arc::new(MemTreeStore::default());
        for &obj in objects {
            store
                .insert_item(ItemKey::stat_data(ObjectId(obj)), Item::StatData(StatData::new()))
                .expect("stat data");
        }
        let log = SafeLinkLog::new(store.clone());
        (store, log)
    }

    #[test]
    fn encode_decode_and_reject_corruption() {
        let record = SafeLinkRecord::truncate(ObjectId(42), 100);
        let bytes = record.encode();
        assert_eq!(SafeLinkRecord::decode(&bytes).expect("decode"), record);

        let mut flipped = bytes;
        flipped[25] ^= 0xFF;
        assert!(matches!(
            SafeLinkRecord::decode(&flipped),
            Err(ParseError::ChecksumMismatch { .. })
        ));
        assert!(matches!(
            SafeLinkRecord::decode(&bytes[..20]),
            Err(ParseError::InsufficientData { .. })
        ));
        let mut bad_magic = bytes;
        bad_magic[0] = 0;
        assert!(matches!(
            SafeLinkRecord::decode(&bad_magic),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn record_overwrites_same_owner_and_kind() {
        let (_store, log) = log_with_objects(&[42]);
        log.record(&SafeLinkRecord::truncate(ObjectId(42), 500))
            .expect("first");
        log.record(&SafeLinkRecord::truncate(ObjectId(42), 100))
            .expect("second");
        assert_eq!(log.pending().expect("pending").len(), 1);
        assert_eq!(
            log.get(ObjectId(42), LinkKind::Truncate)
                .expect("get")
                .expect("present")
                .final_size,
            100
        );
    }

    #[test]
    fn record_then_clear_leaves_nothing_to_replay() {
        let (_store, log) = log_with_objects(&[1]);
        log.record(&SafeLinkRecord::truncate(ObjectId(1), 7))
            .expect("record");
        log.clear(ObjectId(1), LinkKind::Truncate).expect("clear");
        let recorder = Recorder::default();
        let report = log.replay_all(&recorder).expect("replay");
        assert_eq!(report, RecoveryReport::default());
        assert!(recorder.calls.lock().is_empty());
    }

    #[test]
    fn replay_dispatches_drops_and_skips() {
        let (_store, log) = log_with_objects(&[1, 2, 3]);
        log.record(&SafeLinkRecord::truncate(ObjectId(1), 10))
            .expect("truncate link");
        log.record(&SafeLinkRecord::unlinked_open_file(ObjectId(2)))
            .expect("unlink link");
        log.record(&SafeLinkRecord::truncate(ObjectId(3), 30))
            .expect("failing link");
        log.record(&SafeLinkRecord::truncate(ObjectId(99), 0))
            .expect("orphan link");

        let recorder = Recorder {
            fail_owner: Some(ObjectId(3)),
            ..Recorder::default()
        };
        let report = log.replay_all(&recorder).expect("replay");
        assert_eq!(
            report,
            RecoveryReport {
                replayed: 2,
                dropped: 1,
                failed: 1
            }
        );
        assert!(!report.is_clean());
        assert_eq!(
            *recorder.calls.lock(),
            vec![
                (ObjectId(1), LinkKind::Truncate, 10),
                (ObjectId(2), LinkKind::UnlinkedOpenFile, 0),
            ]
        );
        let left: Vec<ObjectId> = log
            .pending()
            .expect("pending")
            .into_iter()
            .map(|(key, _)| key.object)
            .collect();
        assert_eq!(left, vec![ObjectId(3)]);
    }

    #[test]
    fn corrupt_payload_is_counted_as_failed() {
        let (store, log) = log_with_objects(&[5]);
        store
            .insert_item(
                ItemKey::safe_link(ObjectId(5), LinkKind::Truncate),
                Item::SafeLink(vec![0xEE; SAFE_LINK_SIZE]),
            )
            .expect("garbage link");
        let report = log.replay_all(&Recorder::default()).expect("replay");
        assert_eq!(report.failed, 1);
        assert_eq!(report.replayed, 0);
    }
}
