//! On-disk reservation log.
//!
//! Each record is `[u32 le: len][bincode: Event][u32 le: crc32 of payload]`.
//! The file only ever ends on a record boundary: opening cuts off a torn or
//! corrupt tail, and a commit that fails part-way is rolled back to the last
//! committed length before the error is returned.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::model::Event;

const HEADER_LEN: u64 = 4;
const TRAILER_LEN: u64 = 4;

/// Largest payload a single event can encode to. Longer lengths are corruption.
const MAX_PAYLOAD_LEN: u32 = 64 * 1024;

fn frame(buf: &mut Vec<u8>, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(())
}

fn frame_all(events: &[Event]) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    for event in events {
        frame(&mut buf, event)?;
    }
    Ok(buf)
}

/// `read_exact` that reports running out of bytes as `false`.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read the next record and its framed size. `None` marks the end of the
/// usable log: clean EOF, a torn record, or one that fails the length,
/// checksum or decode check.
fn read_record(reader: &mut impl Read, remaining: u64) -> io::Result<Option<(Event, u64)>> {
    let mut header = [0u8; HEADER_LEN as usize];
    if !read_full(reader, &mut header)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(header);
    let framed = HEADER_LEN + u64::from(len) + TRAILER_LEN;
    if len > MAX_PAYLOAD_LEN || framed > remaining {
        return Ok(None);
    }

    let mut payload = vec![0u8; len as usize];
    let mut trailer = [0u8; TRAILER_LEN as usize];
    if !read_full(reader, &mut payload)? || !read_full(reader, &mut trailer)? {
        return Ok(None);
    }
    if u32::from_le_bytes(trailer) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload).ok().map(|event| (event, framed)))
}

/// What survived on disk: the intact events and the byte length they span.
#[derive(Debug, Default, PartialEq)]
pub struct Replay {
    pub events: Vec<Event>,
    pub valid_len: u64,
}

pub struct Wal {
    file: File,
    path: PathBuf,
    committed_len: u64,
    records_since_compact: u64,
}

impl Wal {
    /// Replay the log at `path`, cut off anything past the last intact record
    /// and open it for appending. Returns the replayed events.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let Replay { events, valid_len } = Self::replay(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            warn!(
                "{}: discarding {} bytes after the last intact record",
                path.display(),
                on_disk - valid_len
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        let wal = Self {
            file,
            path: path.to_path_buf(),
            committed_len: valid_len,
            records_since_compact: events.len() as u64,
        };
        Ok((wal, events))
    }

    /// Read every intact record from the start of the file.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();

        while let Some((event, framed)) = read_record(&mut reader, file_len - replay.valid_len)? {
            replay.events.push(event);
            replay.valid_len += framed;
        }
        Ok(replay)
    }

    /// Append `events` and fsync them as one unit. Nothing is acknowledged
    /// unless all of them are durable.
    pub fn commit(&mut self, events: &[Event]) -> io::Result<()> {
        let buf = frame_all(events)?;
        if let Err(e) = self.file.write_all(&buf).and_then(|()| self.file.sync_all()) {
            if let Err(rollback) = self.file.set_len(self.committed_len) {
                error!("{}: rollback after failed commit: {rollback}", self.path.display());
            }
            return Err(e);
        }
        self.committed_len += buf.len() as u64;
        self.records_since_compact += events.len() as u64;
        Ok(())
    }

    /// Replace the log with `events`. They are written to `<path>.wal.tmp`,
    /// fsynced, then renamed over the log.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let buf = frame_all(events)?;
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&buf)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.committed_len = buf.len() as u64;
        self.records_since_compact = 0;
        Ok(())
    }

    /// Records in the log since it was last compacted, replayed ones included.
    pub fn records_since_compact(&self) -> u64 {
        self.records_since_compact
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ReservationStatus, SlotTime};
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn created(time: &str) -> Event {
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        Event::ReservationCreated {
            id: Ulid::new(),
            name: "Ada".into(),
            phone: "05551234567".into(),
            service: "Haircut".into(),
            date,
            time: time.parse::<SlotTime>().unwrap(),
            created_at: date.and_hms_opt(8, 0, 0).unwrap(),
        }
    }

    fn cancelled(id: Ulid) -> Event {
        Event::StatusChanged {
            id,
            date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            status: ReservationStatus::Cancelled,
        }
    }

    fn append_raw(path: &Path, bytes: &[u8]) {
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(bytes).unwrap();
    }

    #[test]
    fn commit_and_replay() {
        let path = tmp_path("commit_replay.wal");
        let events = vec![created("10:00"), cancelled(Ulid::new())];

        {
            let (mut wal, replayed) = Wal::open(&path).unwrap();
            assert!(replayed.is_empty());
            wal.commit(&events[..1]).unwrap();
            wal.commit(&events[1..]).unwrap();
        }

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, events);
        assert_eq!(replay.valid_len, fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn torn_tail_is_cut_before_new_commits() {
        let path = tmp_path("torn_tail.wal");
        let first = created("09:00");
        let second = created("10:00");

        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.commit(std::slice::from_ref(&first)).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        append_raw(&path, &[0u8; 6]);

        {
            let (mut wal, replayed) = Wal::open(&path).unwrap();
            assert_eq!(replayed, vec![first.clone()]);
            assert_eq!(fs::metadata(&path).unwrap().len(), intact);
            wal.commit(std::slice::from_ref(&second)).unwrap();
        }

        let (_, replayed) = Wal::open(&path).unwrap();
        assert_eq!(replayed, vec![first, second]);
    }

    #[test]
    fn corrupt_crc_ends_the_log() {
        let path = tmp_path("corrupt_crc.wal");
        let kept = created("09:00");
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.commit(std::slice::from_ref(&kept)).unwrap();
        }
        let payload = bincode::serialize(&cancelled(Ulid::new())).unwrap();
        let mut record = (payload.len() as u32).to_le_bytes().to_vec();
        record.extend_from_slice(&payload);
        record.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
        append_raw(&path, &record);

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![kept]);
        assert!(replay.valid_len < fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn oversized_length_is_corruption() {
        let path = tmp_path("oversized_len.wal");
        fs::write(&path, u32::MAX.to_le_bytes()).unwrap();

        assert_eq!(Wal::replay(&path).unwrap(), Replay::default());
        let (_, replayed) = Wal::open(&path).unwrap();
        assert!(replayed.is_empty());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn replay_missing_file() {
        let path = tmp_path("missing.wal");
        assert_eq!(Wal::replay(&path).unwrap(), Replay::default());
    }

    #[test]
    fn compact_then_commit() {
        let path = tmp_path("compact_commit.wal");
        let kept = created("10:00");
        let later = created("11:00");

        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            let churn: Vec<Event> = (0..10).map(|_| created("09:00")).collect();
            wal.commit(&churn).unwrap();
            wal.commit(std::slice::from_ref(&kept)).unwrap();
            assert_eq!(wal.records_since_compact(), 11);
            let before = fs::metadata(&path).unwrap().len();

            wal.compact(std::slice::from_ref(&kept)).unwrap();
            assert_eq!(wal.records_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);

            wal.commit(std::slice::from_ref(&later)).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap().events, vec![kept, later]);
    }

    #[test]
    fn replayed_records_count_toward_compaction() {
        let path = tmp_path("replayed_count.wal");
        let events: Vec<Event> = ["09:00", "09:30", "10:00"].iter().map(|t| created(t)).collect();
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.commit(&events).unwrap();
        }

        let (mut wal, replayed) = Wal::open(&path).unwrap();
        assert_eq!(replayed.len(), 3);
        wal.commit(&[created("10:30")]).unwrap();
        assert_eq!(wal.records_since_compact(), 4);
    }
}
