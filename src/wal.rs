use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// First bytes of every log file.
const MAGIC: &[u8; 4] = b"CBWL";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: u64 = 6;

fn write_header(writer: &mut impl Write) -> io::Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_all(&FORMAT_VERSION.to_le_bytes())
}

fn check_header(reader: &mut impl Read, path: &Path) -> io::Result<()> {
    let mut header = [0u8; HEADER_LEN as usize];
    reader.read_exact(&mut header)?;
    if &header[..4] != MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} is not a courtbook log", path.display()),
        ));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != FORMAT_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported log format version {version}"),
        ));
    }
    Ok(())
}

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read one record and its encoded length. `Ok(None)` marks the end of the
/// usable log: clean EOF, a torn tail after a crash, or a record whose
/// checksum does not match.
fn decode_event(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    for buf in [&mut payload[..], &mut crc_buf[..]] {
        match reader.read_exact(buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
    }

    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    let record_len = 8 + len as u64;
    Ok(bincode::deserialize::<Event>(&payload)
        .ok()
        .map(|event| (event, record_len)))
}

/// Intact events plus the byte offset just past the last of them.
/// `valid_len` is 0 when the header itself is missing or short.
struct Scan {
    events: Vec<Event>,
    valid_len: u64,
    file_len: u64,
}

fn scan(path: &Path) -> io::Result<Scan> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(Scan { events: Vec::new(), valid_len: 0, file_len: 0 });
        }
        Err(e) => return Err(e),
    };
    let file_len = file.metadata()?.len();
    if file_len < HEADER_LEN {
        return Ok(Scan { events: Vec::new(), valid_len: 0, file_len });
    }
    let mut reader = BufReader::new(file);
    check_header(&mut reader, path)?;

    let mut events = Vec::new();
    let mut valid_len = HEADER_LEN;
    while let Some((event, record_len)) = decode_event(&mut reader)? {
        events.push(event);
        valid_len += record_len;
    }
    Ok(Scan { events, valid_len, file_len })
}

/// Append-only write-ahead log of booking events.
///
/// Layout: a 6-byte header (`CBWL` + u16 format version), then records of
/// `[u32: len][bincode: Event][u32: crc32]`. Replay stops at the first record
/// that is short or fails its checksum.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// Appends still allowed before every further append fails.
    #[cfg(test)]
    fail_after: Option<u64>,
}

impl Wal {
    /// Open (or create) the log at `path`, writing the header into a new file.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let fresh = file.metadata()?.len() == 0;
        let mut writer = BufWriter::new(file);
        if fresh {
            write_header(&mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            appends_since_compact: 0,
            #[cfg(test)]
            fail_after: None,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event; durable only after `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        #[cfg(test)]
        self.take_append_budget()?;
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    #[cfg(test)]
    pub fn fail_appends_after(&mut self, appends: u64) {
        self.fail_after = Some(appends);
    }

    #[cfg(test)]
    fn take_append_budget(&mut self) -> io::Result<()> {
        match self.fail_after.as_mut() {
            Some(0) => Err(io::Error::other("append budget exhausted")),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted log next to the live one and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(Self::compact_tmp_path(path))?;
        let mut writer = BufWriter::new(file);
        write_header(&mut writer)?;
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the live log and reopen it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact event in the log. A missing or empty file replays as
    /// nothing; a file with a foreign header is an error.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        scan(path).map(|s| s.events)
    }

    /// Replay, then cut the file back to its last intact record so that
    /// later appends are not stranded behind a torn tail. A short header is
    /// dropped entirely and rewritten by the next `open`.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let Scan { events, valid_len, file_len } = scan(path)?;
        if valid_len < file_len {
            tracing::warn!(
                "truncating {} from {file_len} to {valid_len} bytes after an incomplete record",
                path.display()
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::{NaiveDate, NaiveTime};
    use rust_decimal::Decimal;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("courtbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn booking_created(venue_id: Ulid) -> Event {
        Event::BookingCreated {
            booking: Booking {
                id: Ulid::new(),
                venue_id,
                user_id: Some(Ulid::new()),
                date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                end_time: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
                status: BookingStatus::Confirmed,
                status_id: Some("paid".into()),
                kind: BookingType::Academy,
                total_price: Decimal::new(4550, 2),
                recurrence_id: None,
                open_match: Some(OpenMatch { max_players: 4, players: vec![Ulid::new()] }),
                created_at: 1_700_000_000_000,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let venue_id = Ulid::new();
        let events = vec![
            Event::VenueCreated { id: venue_id, branch_id: Ulid::new(), name: "Court 1".into() },
            booking_created(venue_id),
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn new_file_starts_with_header() {
        let path = tmp_path("header.wal");
        drop(Wal::open(&path).unwrap());
        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, HEADER_LEN);
        assert_eq!(&bytes[..4], MAGIC);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn reopen_does_not_repeat_header() {
        let path = tmp_path("reopen.wal");
        let event = Event::BranchCreated { id: Ulid::new(), name: "North".into() };
        Wal::open(&path).unwrap().append(&event).unwrap();
        Wal::open(&path).unwrap().append(&event).unwrap();
        assert_eq!(Wal::replay(&path).unwrap().len(), 2);
    }

    #[test]
    fn foreign_file_is_rejected() {
        let path = tmp_path("foreign.wal");
        fs::write(&path, b"PGDMP\x00\x01\x02").unwrap();
        let err = Wal::replay(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn replay_discards_torn_tail() {
        let path = tmp_path("truncation.wal");
        let event = booking_created(Ulid::new());
        Wal::open(&path).unwrap().append(&event).unwrap();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0x40, 0, 0, 0, 1, 2]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn replay_stops_at_bad_checksum() {
        let path = tmp_path("corrupt_crc.wal");
        let good = Event::WaitlistLeft { id: Ulid::new() };
        let bad = Event::WaitlistLeft { id: Ulid::new() };
        Wal::open(&path).unwrap().append(&good).unwrap();
        {
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![good]);
    }

    #[test]
    fn recover_truncates_torn_tail_before_appending() {
        let path = tmp_path("recover_tail.wal");
        let first = Event::BranchCreated { id: Ulid::new(), name: "North".into() };
        Wal::open(&path).unwrap().append(&first).unwrap();
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[200, 0, 0, 0, 1, 2]).unwrap();
        }

        assert_eq!(Wal::recover(&path).unwrap(), vec![first.clone()]);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);

        let second = Event::BranchCreated { id: Ulid::new(), name: "South".into() };
        Wal::open(&path).unwrap().append(&second).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn recover_rewrites_short_header() {
        let path = tmp_path("recover_header.wal");
        fs::write(&path, &MAGIC[..3]).unwrap();

        assert!(Wal::recover(&path).unwrap().is_empty());
        let event = Event::BranchCreated { id: Ulid::new(), name: "North".into() };
        Wal::open(&path).unwrap().append(&event).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compact_shrinks_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let venue_id = Ulid::new();
        let keep = Event::VenueCreated { id: venue_id, branch_id: Ulid::new(), name: "Court 1".into() };
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&keep).unwrap();
        for _ in 0..20 {
            let created = booking_created(venue_id);
            let id = match &created {
                Event::BookingCreated { booking } => booking.id,
                _ => unreachable!(),
            };
            wal.append(&created).unwrap();
            wal.append(&Event::BookingDeleted { id, venue_id }).unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();

        wal.compact(std::slice::from_ref(&keep)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted log should be smaller: {after} < {before}");

        let late = booking_created(venue_id);
        wal.append(&late).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![keep, late]);
    }

    #[test]
    fn buffered_appends_count_until_compaction() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5)
            .map(|i| Event::BranchCreated { id: Ulid::new(), name: format!("Branch {i}") })
            .collect();
        let mut wal = Wal::open(&path).unwrap();
        for e in &events {
            wal.append_buffered(e).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 5);
        wal.flush_sync().unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }
}
