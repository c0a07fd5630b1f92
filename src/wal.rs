use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::mem;
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Write one frame: `[u32 len][bincode payload][u32 crc32]`, little-endian.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for WAL frame"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Fill `buf` completely. `Ok(false)` means the file ended first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read the next frame and its size on disk. `remaining` is how many bytes
/// are left in the file. `Ok(None)` marks the end of the usable log: clean
/// EOF, a torn tail from a crash, a length header that runs past the end of
/// the file, or a frame whose checksum or payload is bad.
fn read_frame(reader: &mut impl Read, remaining: u64) -> io::Result<Option<(Event, u64)>> {
    let mut word = [0u8; 4];
    if !read_full(reader, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word);
    if u64::from(len) + 8 > remaining {
        return Ok(None);
    }
    let mut payload = vec![0u8; len as usize];
    if !read_full(reader, &mut payload)? || !read_full(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    let size = 8 + payload.len() as u64;
    Ok(bincode::deserialize::<Event>(&payload).ok().map(|e| (e, size)))
}

/// Append-only event log backing the ledger.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length covered by the last successful `flush_sync`.
    durable_len: u64,
    pending_bytes: u64,
    pending_appends: u64,
    /// Set while a rollback is owed; the next append retries it first.
    torn: bool,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = Self::open_append(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            durable_len,
            pending_bytes: 0,
            pending_appends: 0,
            torn: false,
        })
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Buffer one event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.torn {
            self.rollback()?;
        }
        let mut frame = Vec::new();
        write_frame(&mut frame, event)?;
        self.writer.write_all(&frame)?;
        self.pending_bytes += frame.len() as u64;
        self.pending_appends += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.durable_len += self.pending_bytes;
        self.pending_bytes = 0;
        self.pending_appends = 0;
        Ok(())
    }

    /// Throw away everything written since the last successful `flush_sync`,
    /// including partial frames that already reached the file, so the next
    /// batch starts right after the last durable frame.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.torn = true;
        let file = Self::open_append(&self.path)?;
        file.set_len(self.durable_len)?;
        file.sync_all()?;
        // into_parts drops the buffered bytes without writing them
        let (_, _unwritten) = mem::replace(&mut self.writer, BufWriter::new(file)).into_parts();
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending_appends);
        self.pending_bytes = 0;
        self.pending_appends = 0;
        self.torn = false;
        Ok(())
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write a replacement log next to `path` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the replacement log over the live one and reopen for append.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        if !self.torn {
            self.writer.flush()?;
        }
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = Self::open_append(&self.path)?;
        self.durable_len = file.metadata()?.len();
        let (_, _unwritten) = mem::replace(&mut self.writer, BufWriter::new(file)).into_parts();
        self.appends_since_compact = 0;
        self.pending_bytes = 0;
        self.pending_appends = 0;
        self.torn = false;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Read every intact event. A missing file is an empty log. Anything
    /// after the last intact frame is cut off so later appends stay readable.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid = 0u64;
        while let Some((event, size)) = read_frame(&mut reader, file_len - valid)? {
            events.push(event);
            valid += size;
        }
        if valid < file_len {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = file_len - valid,
                "truncating damaged WAL tail"
            );
            OpenOptions::new().write(true).open(path)?.set_len(valid)?;
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use ulid::Ulid;

    use crate::model::SpotSeed;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("lotledger_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn lot_created(id: Ulid) -> Event {
        Event::LotCreated {
            id,
            name: "Harbour Front".into(),
            address: "12 Quay Road, Dock 4".into(),
            pin_code: "400001".into(),
            hourly_rate: Decimal::new(2550, 2),
            active: true,
            spots: vec![SpotSeed {
                id: Ulid::new(),
                label: "A01".into(),
            }],
        }
    }

    fn user_registered() -> Event {
        Event::UserRegistered {
            id: Ulid::new(),
            username: "rhea".into(),
            full_name: None,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![lot_created(Ulid::new()), user_registered()];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let path = tmp_path("torn_tail.wal");
        let event = user_registered();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn appends_after_torn_tail_survive() {
        let path = tmp_path("torn_then_append.wal");
        let first = user_registered();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[200u8, 1]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first.clone()]);

        let second = user_registered();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn oversized_length_header_is_treated_as_torn() {
        let path = tmp_path("oversized_len.wal");
        let first = user_registered();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[7u8; 16]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first]);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);
    }

    #[test]
    fn rollback_discards_bytes_past_last_sync() {
        let path = tmp_path("rollback.wal");
        let durable = user_registered();
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&durable).unwrap();

        // a batch that died halfway: one whole frame plus a torn one on disk
        wal.append_buffered(&user_registered()).unwrap();
        wal.writer.write_all(&[42u8, 0, 0, 0, 1, 2, 3]).unwrap();
        wal.writer.flush().unwrap();
        assert_eq!(wal.appends_since_compact(), 2);

        wal.rollback().unwrap();
        assert_eq!(wal.appends_since_compact(), 1);
        assert!(!wal.torn);

        let next = user_registered();
        wal.append(&next).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![durable, next]);
    }

    #[test]
    fn owed_rollback_runs_before_next_append() {
        let path = tmp_path("owed_rollback.wal");
        let durable = user_registered();
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&durable).unwrap();
        wal.writer.write_all(&[1u8, 2, 3]).unwrap();
        wal.writer.flush().unwrap();
        wal.torn = true;

        let next = user_registered();
        wal.append(&next).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![durable, next]);
    }

    #[test]
    fn missing_file_is_empty() {
        let path = tmp_path("never_written.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let good = user_registered();
        let bad = Event::LotDeleted { id: Ulid::new() };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn compaction_shrinks_and_keeps_appending() {
        let path = tmp_path("compaction.wal");
        let lot_id = Ulid::new();
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&lot_created(lot_id)).unwrap();
        for active in [false, true, false, true, false, true] {
            wal.append(&Event::UserStatusChanged { id: Ulid::new(), active }).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 7);
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = vec![lot_created(lot_id)];
        wal.compact(&snapshot).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);

        let later = Event::LotDeleted { id: lot_id };
        wal.append(&later).unwrap();
        drop(wal);

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[1], later);
    }

    #[test]
    fn buffered_appends_land_after_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..4).map(|_| user_registered()).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }
}
