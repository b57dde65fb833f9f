//! # Summary
//!
//! Log persisted as a sequence of frames in one file. Each frame is a record
//! encoded with `bincode` and prefixed by its length as a little-endian `u64`.
//! Opening a file replays every frame into memory; appends are synced before
//! they become visible to readers.

use std::io::{Read, Write};

use parking_lot::Mutex;

use crate::aggregate::Event;
use crate::error::{Error, Result};
use crate::state::{self, NodeId, PipelineId};
use crate::storage::memory::Inner;
use crate::storage::{EventLog, Notification, Record};

const HEADER: usize = std::mem::size_of::<u64>();

struct Durable<K: state::Identifier, V: state::Value> {
    inner: Inner<K, V>,
    file: std::fs::File,

    /// Length of the valid prefix of `file`
    len: u64,
}

/// File-backed log.
pub struct FileLog<K: state::Identifier, V: state::Value> {
    path: std::path::PathBuf,
    state: Mutex<Durable<K, V>>,
}

impl<K: state::Identifier, V: state::Value> FileLog<K, V> {
    /// Opens or creates the log at `path`, replaying its contents.
    ///
    /// A partially written final frame is discarded. Any other undecodable
    /// frame fails with `Corrupted`.
    pub fn open<P: AsRef<std::path::Path>>(owner: NodeId, path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut inner = Inner::new(owner);
        let mut offset = 0;
        let mut frames = 0;
        while offset < bytes.len() {
            if bytes.len() - offset < HEADER {
                break
            }
            let mut header = [0u8; HEADER];
            header.copy_from_slice(&bytes[offset..offset + HEADER]);
            let size = u64::from_le_bytes(header) as usize;
            if bytes.len() - offset - HEADER < size {
                break
            }
            let frame = &bytes[offset + HEADER..offset + HEADER + size];
            let record: Record<K, V> = bincode::deserialize(frame)
                .map_err(|error| Error::Corrupted(format!("{}: frame {}: {}", path.display(), frames, error)))?;
            inner.check(&record)
                .map_err(|error| Error::Corrupted(format!("{}: frame {}: {}", path.display(), frames, error)))?;
            inner.commit(record);
            offset += HEADER + size;
            frames += 1;
        }

        if offset < bytes.len() {
            warn!("{}: discarding {} bytes of torn frame", path.display(), bytes.len() - offset);
            file.set_len(offset as u64)?;
        }

        debug!("{}: replayed {} records", path.display(), frames);
        Ok(FileLog {
            path,
            state: Mutex::new(Durable {
                inner,
                file,
                len: offset as u64,
            }),
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl<K: state::Identifier, V: state::Value> EventLog<K, V> for FileLog<K, V> {
    fn owner(&self) -> NodeId {
        self.state.lock().inner.owner()
    }

    fn read(&self, key: &K) -> Result<Vec<Event<V>>> {
        Ok(self.state.lock().inner.read(key))
    }

    fn keys(&self) -> Result<Vec<K>> {
        Ok(self.state.lock().inner.keys())
    }

    fn append(&self, record: Record<K, V>) -> Result<Vec<u64>> {
        let mut state = self.state.lock();
        state.inner.check(&record)?;

        let payload = bincode::serialize(&record)?;
        let mut frame = Vec::with_capacity(HEADER + payload.len());
        frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        frame.extend_from_slice(&payload);

        let written = {
            let file = &mut state.file;
            file.write_all(&frame).and_then(|_| file.sync_data())
        };

        if let Err(error) = written {
            // Drop whatever part of the frame reached the file
            let len = state.len;
            if let Err(truncate) = state.file.set_len(len) {
                error!("{}: failed to truncate after write error: {}", self.path.display(), truncate);
            }
            return Err(Error::Io(error))
        }

        state.len += frame.len() as u64;
        Ok(state.inner.commit(record))
    }

    fn read_from(&self, pipeline: PipelineId, after: u64, limit: usize) -> Result<Vec<Notification<K, V>>> {
        Ok(self.state.lock().inner.read_from(pipeline, after, limit))
    }

    fn position(&self, upstream: NodeId, pipeline: PipelineId) -> Result<u64> {
        Ok(self.state.lock().inner.position(upstream, pipeline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, ProposalId};
    use crate::storage::Tracking;

    fn record(version: u64, position: u64) -> Record<u8, u64> {
        Record {
            key: 4,
            expected_version: version,
            events: vec![
                Event::Received(Message::Prepare { from: 2, proposal_id: ProposalId::new(position, 2) }),
                Event::Announced(Message::Nack {
                    from: 0,
                    proposer: 2,
                    proposal_id: ProposalId::new(position, 2),
                    promised_id: ProposalId::new(9, 1),
                }),
            ],
            pipeline: 0,
            tracking: Some(Tracking { upstream: 2, pipeline: 0, position }),
        }
    }

    #[test]
    fn reopen_replays_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("participant-00.synod");
        {
            let log = FileLog::open(0, &path).unwrap();
            assert_eq!(log.append(record(0, 1)).unwrap(), vec![1]);
            assert_eq!(log.append(record(2, 2)).unwrap(), vec![2]);
        }

        let log: FileLog<u8, u64> = FileLog::open(0, &path).unwrap();
        assert_eq!(log.read(&4).unwrap().len(), 4);
        assert_eq!(log.keys().unwrap(), vec![4]);
        assert_eq!(log.position(2, 0).unwrap(), 2);
        assert_eq!(log.read_from(0, 0, 10).unwrap().len(), 2);
        assert_eq!(log.append(record(4, 3)).unwrap(), vec![3]);
    }

    #[test]
    fn torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("torn.synod");
        {
            let log = FileLog::open(1, &path).unwrap();
            log.append(record(0, 1)).unwrap();
        }
        let intact = std::fs::metadata(&path).unwrap().len();
        {
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[200, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3]).unwrap();
        }

        let log: FileLog<u8, u64> = FileLog::open(1, &path).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact);
        assert_eq!(log.read(&4).unwrap().len(), 2);
        log.append(record(2, 2)).unwrap();
        drop(log);

        let log: FileLog<u8, u64> = FileLog::open(1, &path).unwrap();
        assert_eq!(log.position(2, 0).unwrap(), 2);
    }

    #[test]
    fn undecodable_frame_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.synod");
        std::fs::write(&path, [4, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]).unwrap();

        let opened: Result<FileLog<u8, u64>> = FileLog::open(0, &path);
        assert!(matches!(opened, Err(Error::Corrupted(_))));
    }
}
