use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frame layout: `[u32 le: payload len][bincode payload][u32 le: crc32 of payload]`.
const FRAME_OVERHEAD: usize = 8;
/// Larger length prefixes can only come from a damaged header.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<usize> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(payload.len() + FRAME_OVERHEAD)
}

/// Result of reading one frame.
enum Frame {
    /// An intact event and the bytes its frame occupies.
    Event(Event, u64),
    /// Clean end of file, or a torn tail from a crash mid-append.
    End,
    /// CRC mismatch or undecodable payload. Nothing after it is trusted.
    Corrupt,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut word = [0u8; 4];
    if !read_exact_or_eof(reader, &mut word)? {
        return Ok(Frame::End);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(Frame::Corrupt);
    }
    let mut payload = vec![0u8; len];
    if !read_exact_or_eof(reader, &mut payload)? || !read_exact_or_eof(reader, &mut word)? {
        return Ok(Frame::End);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(Frame::Corrupt);
    }
    Ok(match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Frame::Event(event, (len + FRAME_OVERHEAD) as u64),
        Err(_) => Frame::Corrupt,
    })
}

/// Append-only booking journal for one tenant.
///
/// Writers buffer frames with [`Wal::append_buffered`] and make a whole batch
/// durable with one [`Wal::flush_sync`]. Replay stops at the first torn or
/// corrupt frame and [`Wal::recover`] cuts the file back to that point before
/// appends resume, so a crash mid-append loses at most the unacknowledged batch.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            writer: BufWriter::new(Self::open_append(path)?),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the compacted event set next to the journal and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        let mut bytes = 0usize;
        for event in events {
            bytes += write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        tracing::debug!(events = events.len(), bytes, "compacted journal written");
        Ok(())
    }

    /// Rename the compacted file over the journal and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        // Anything still buffered belongs to the old file.
        self.writer.flush()?;
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        self.writer = BufWriter::new(Self::open_append(&self.path)?);
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

    /// Every intact event in the journal, oldest first. A missing file is an
    /// empty journal.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::scan(path)?.0)
    }

    /// Replay, then truncate anything after the last intact frame so new
    /// appends are not stranded behind a torn or corrupt tail.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, valid_len) = Self::scan(path)?;
        let file = match OpenOptions::new().write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(events),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        if file_len > valid_len {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = file_len - valid_len,
                "truncating journal after last intact frame"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok(events)
    }

    /// Intact events plus the byte length they cover.
    fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0u64;
        loop {
            match read_frame(&mut reader)? {
                Frame::Event(event, size) => {
                    events.push(event);
                    valid_len += size;
                }
                Frame::End => break,
                Frame::Corrupt => {
                    tracing::warn!(
                        path = %path.display(),
                        recovered = events.len(),
                        "corrupt journal frame, discarding the rest"
                    );
                    break;
                }
            }
        }
        Ok((events, valid_len))
    }
}
