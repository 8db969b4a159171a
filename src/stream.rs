//! Paged record streams.
//!
//! Records are moved between memory and disk one page at a time and every page read or
//! written counts as exactly one disk access in the shared [`IoStats`], whatever the number
//! of records it holds.
//!
//! A stream either owns its page ([`PageLayout::buffered`]) or moves records straight
//! between the caller and the file ([`PageLayout::direct`]). A buffered page is the only
//! buffer of the stream: records are decoded from it and encoded into it in place, so a
//! stream never holds more than `records · record_size` bytes (plus the tail of one
//! oversized variable-length record). Direct streams are used where the caller already
//! holds a whole page of decoded records, e.g. the in-memory chunk of run generation.

use std::fs;
use std::io::{self, prelude::*};
use std::marker::PhantomData;
use std::path::Path;

use crate::codec::RecordCodec;
use crate::io_stats::IoStats;

const HELPER_PAGE_RECORDS: usize = 1024;
const HELPER_RECORD_SIZE: usize = 8;

/// Page geometry of a record stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLayout {
    records: usize,
    bytes: usize,
}

impl PageLayout {
    /// Page of `records` records of `record_size` bytes kept in a byte buffer owned by the stream.
    pub fn buffered(records: usize, record_size: usize) -> Self {
        let records = records.max(1);
        PageLayout {
            records,
            bytes: records.saturating_mul(record_size.max(1)),
        }
    }

    /// Page of `records` records that are moved between the caller and the file without
    /// intermediate buffering. Pages are still counted every `records` records.
    pub fn direct(records: usize) -> Self {
        PageLayout {
            records: records.max(1),
            bytes: 0,
        }
    }

    /// Number of records per page.
    pub fn records(&self) -> usize {
        self.records
    }

    /// Size of the page buffer in bytes, zero for direct streams.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn is_direct(&self) -> bool {
        self.bytes == 0
    }
}

/// Sequential paged reader over a record file.
pub struct RecordReader<T, C: RecordCodec<T>> {
    file: io::Take<fs::File>,
    codec: C,
    layout: PageLayout,
    page: Vec<u8>,
    pos: usize,
    expected_records: Option<u64>,
    records_read: u64,
    failed: bool,
    stats: IoStats,

    item_type: PhantomData<fn() -> T>,
}

impl<T, C: RecordCodec<T>> RecordReader<T, C> {
    /// Opens a record file for reading.
    ///
    /// # Arguments
    /// * `path` - File to be read
    /// * `layout` - Page geometry of the stream
    /// * `codec` - Record codec
    /// * `stats` - Counters to charge page reads to
    pub fn open(path: &Path, layout: PageLayout, codec: C, stats: IoStats) -> io::Result<Self> {
        let file = fs::File::open(path)?;
        let file_len = file.metadata()?.len();

        return Ok(RecordReader {
            file: file.take(file_len),
            codec,
            layout,
            page: Vec::with_capacity(layout.bytes),
            pos: 0,
            expected_records: None,
            records_read: 0,
            failed: false,
            stats,
            item_type: PhantomData,
        });
    }

    /// Makes the reader fail if the file holds a different number of records.
    pub fn with_expected_records(mut self, records: u64) -> Self {
        self.expected_records = Some(records);
        return self;
    }

    /// Number of records decoded so far.
    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    /// Bytes allocated for the page.
    pub fn buffer_capacity(&self) -> usize {
        self.page.capacity()
    }

    /// Returns the next record or `None` at the end of the stream.
    pub fn read_record(&mut self) -> io::Result<Option<T>> {
        let item = if self.layout.is_direct() {
            self.read_direct()?
        } else {
            self.read_buffered()?
        };

        match item {
            Some(item) => {
                self.records_read += 1;
                if let Some(expected) = self.expected_records {
                    if self.records_read > expected {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("stream holds more than {} records", expected),
                        ));
                    }
                }
                Ok(Some(item))
            }
            None => match self.expected_records {
                Some(expected) if self.records_read < expected => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended after {} of {} records", self.records_read, expected),
                )),
                _ => Ok(None),
            },
        }
    }

    fn read_direct(&mut self) -> io::Result<Option<T>> {
        if self.file.limit() == 0 {
            return Ok(None);
        }

        let item = self.codec.decode(&mut self.file)?;
        if self.records_read % self.layout.records as u64 == 0 {
            self.stats.add_read(1);
        }

        return Ok(Some(item));
    }

    fn read_buffered(&mut self) -> io::Result<Option<T>> {
        loop {
            if self.pos < self.page.len() {
                let mut rest = &self.page[self.pos..];
                let available = rest.len();
                match self.codec.decode(&mut rest) {
                    Ok(item) => {
                        self.pos += available - rest.len();
                        return Ok(Some(item));
                    }
                    // the record continues on the next page
                    Err(err) if err.kind() == io::ErrorKind::UnexpectedEof && self.file.limit() > 0 => {}
                    Err(err) => return Err(err),
                }
            }

            if !self.fill_page()? {
                return Ok(None);
            }
        }
    }

    /// Moves the unread tail to the front of the page and fills the rest from the file.
    /// Returns `false` if the file is exhausted.
    fn fill_page(&mut self) -> io::Result<bool> {
        if self.file.limit() == 0 {
            return Ok(false);
        }

        self.page.drain(..self.pos);
        self.pos = 0;

        let start = self.page.len();
        let target = if start < self.layout.bytes {
            self.layout.bytes
        } else {
            // a single record does not fit into one page
            start + self.layout.bytes
        };
        self.page.resize(target, 0);

        let mut filled = start;
        while filled < target {
            match self.file.read(&mut self.page[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.page.truncate(filled);
                    return Err(err);
                }
            }
        }
        self.page.truncate(filled);

        if filled == start {
            return Ok(false);
        }
        self.stats.add_read(1);

        return Ok(true);
    }
}

impl<T, C: RecordCodec<T>> Iterator for RecordReader<T, C> {
    type Item = io::Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        match self.read_record() {
            Ok(item) => item.map(Ok),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Byte page flushed to the file every time it fills up.
struct PageSink<'a> {
    file: &'a mut fs::File,
    page: &'a mut Vec<u8>,
    page_bytes: usize,
    stats: &'a IoStats,
}

impl<'a> Write for PageSink<'a> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = self.page_bytes - self.page.len();
        let taken = room.min(buf.len());
        self.page.extend_from_slice(&buf[..taken]);

        if self.page.len() == self.page_bytes {
            self.flush()?;
        }

        return Ok(taken);
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.page.is_empty() {
            return Ok(());
        }

        self.file.write_all(&self.page[..])?;
        self.page.clear();
        self.stats.add_write(1);

        return Ok(());
    }
}

/// Sequential paged writer into a record file.
pub struct RecordWriter<T, C: RecordCodec<T>> {
    file: fs::File,
    codec: C,
    layout: PageLayout,
    page: Vec<u8>,
    records_written: u64,
    stats: IoStats,

    item_type: PhantomData<fn(T)>,
}

impl<T, C: RecordCodec<T>> RecordWriter<T, C> {
    /// Creates (or truncates) a record file for writing.
    pub fn create(path: &Path, layout: PageLayout, codec: C, stats: IoStats) -> io::Result<Self> {
        let file = fs::File::create(path)?;

        return Ok(RecordWriter {
            file,
            codec,
            layout,
            page: Vec::with_capacity(layout.bytes),
            records_written: 0,
            stats,
            item_type: PhantomData,
        });
    }

    /// Bytes allocated for the page.
    pub fn buffer_capacity(&self) -> usize {
        self.page.capacity()
    }

    /// Encodes a record into the page, flushing the page to disk once it is full.
    pub fn write_record(&mut self, item: T) -> io::Result<()> {
        if self.layout.is_direct() {
            if self.records_written % self.layout.records as u64 == 0 {
                self.stats.add_write(1);
            }
            self.codec.encode(&mut self.file, &item)?;
        } else {
            let mut sink = PageSink {
                file: &mut self.file,
                page: &mut self.page,
                page_bytes: self.layout.bytes,
                stats: &self.stats,
            };
            self.codec.encode(&mut sink, &item)?;
        }
        self.records_written += 1;

        return Ok(());
    }

    /// Writes every record of `items` in order.
    pub fn write_all(&mut self, items: impl IntoIterator<Item = T>) -> io::Result<()> {
        for item in items {
            self.write_record(item)?;
        }

        return Ok(());
    }

    /// Flushes the last partial page and closes the file.
    /// Returns the number of records written.
    pub fn finish(mut self) -> io::Result<u64> {
        let mut sink = PageSink {
            file: &mut self.file,
            page: &mut self.page,
            page_bytes: self.layout.bytes,
            stats: &self.stats,
        };
        sink.flush()?;
        self.file.flush()?;

        return Ok(self.records_written);
    }
}

fn helper_layout<T, C: RecordCodec<T>>() -> PageLayout {
    PageLayout::buffered(HELPER_PAGE_RECORDS, C::RECORD_SIZE.unwrap_or(HELPER_RECORD_SIZE))
}

/// Writes `items` into a new record file without charging any I/O counters.
pub fn write_records<T, C>(path: &Path, items: impl IntoIterator<Item = T>, codec: C) -> io::Result<u64>
where
    C: RecordCodec<T>,
{
    let mut writer = RecordWriter::create(path, helper_layout::<T, C>(), codec, IoStats::new())?;
    writer.write_all(items)?;

    return writer.finish();
}

/// Reads a whole record file into memory without charging any I/O counters.
pub fn read_records<T, C>(path: &Path, codec: C) -> io::Result<Vec<T>>
where
    C: RecordCodec<T>,
{
    RecordReader::open(path, helper_layout::<T, C>(), codec, IoStats::new())?.collect()
}

/// Counts the records of a file without charging any I/O counters.
pub fn count_records<T, C>(path: &Path, codec: C) -> io::Result<u64>
where
    C: RecordCodec<T>,
{
    let mut reader = RecordReader::open(path, helper_layout::<T, C>(), codec, IoStats::new())?;
    while reader.read_record()?.is_some() {}

    return Ok(reader.records_read());
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io;

    use rstest::*;

    use super::{count_records, read_records, write_records, PageLayout, RecordReader, RecordWriter};
    use crate::codec::{FixedCodec, RmpCodec};
    use crate::io_stats::IoStats;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    #[rstest]
    #[case(10, 4, 3)]
    #[case(8, 4, 2)]
    #[case(1, 4, 1)]
    #[case(0, 4, 0)]
    fn test_page_granularity(
        tmp_dir: tempfile::TempDir,
        #[case] records: i64,
        #[case] page_records: usize,
        #[case] expected_pages: u64,
    ) {
        let path = tmp_dir.path().join("stream.bin");

        for layout in [PageLayout::buffered(page_records, 8), PageLayout::direct(page_records)] {
            let stats = IoStats::new();

            let mut writer = RecordWriter::create(&path, layout, FixedCodec::<i64>::default(), stats.clone()).unwrap();
            writer.write_all(0..records).unwrap();
            assert_eq!(writer.finish().unwrap(), records as u64);
            assert_eq!(stats.writes(), expected_pages, "{:?}", layout);
            assert_eq!(fs::metadata(&path).unwrap().len(), records as u64 * 8);

            let mut reader = RecordReader::open(&path, layout, FixedCodec::<i64>::default(), stats.clone()).unwrap();
            let mut restored = Vec::new();
            while let Some(item) = reader.read_record().unwrap() {
                restored.push(item);
            }

            assert_eq!(restored, Vec::from_iter(0..records));
            assert_eq!(stats.reads(), expected_pages, "{:?}", layout);
            assert_eq!(reader.records_read(), records as u64);
        }
    }

    #[rstest]
    fn test_page_is_the_only_buffer(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("pages.bin");
        write_records(&path, 0..100i64, FixedCodec::default()).unwrap();

        let layout = PageLayout::buffered(4, 8);
        let mut reader = RecordReader::open(&path, layout, FixedCodec::<i64>::default(), IoStats::new()).unwrap();
        let mut writer = RecordWriter::create(
            &tmp_dir.path().join("copy.bin"),
            layout,
            FixedCodec::<i64>::default(),
            IoStats::new(),
        )
        .unwrap();

        while let Some(item) = reader.read_record().unwrap() {
            writer.write_record(item).unwrap();
            assert_eq!(reader.buffer_capacity(), 32);
            assert_eq!(writer.buffer_capacity(), 32);
        }
        assert_eq!(writer.finish().unwrap(), 100);

        let direct = RecordReader::open(&path, PageLayout::direct(4), FixedCodec::<i64>::default(), IoStats::new()).unwrap();
        assert_eq!(direct.buffer_capacity(), 0);
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(5)]
    fn test_variable_length_records_cross_pages(tmp_dir: tempfile::TempDir, #[case] page_records: usize) {
        let path = tmp_dir.path().join("strings.bin");
        let saved: Vec<String> = (0..50).map(|i| "x".repeat(i % 13)).collect();
        let stats = IoStats::new();

        // pages of 4-byte slots are smaller than most of the encoded strings
        let layout = PageLayout::buffered(page_records, 4);
        let mut writer = RecordWriter::create(&path, layout, RmpCodec::default(), stats.clone()).unwrap();
        writer.write_all(saved.clone()).unwrap();
        writer.finish().unwrap();

        let file_len = fs::metadata(&path).unwrap().len();
        let page_bytes = layout.bytes() as u64;
        assert_eq!(stats.writes(), (file_len + page_bytes - 1) / page_bytes);

        let mut reader = RecordReader::open(&path, layout, RmpCodec::<String>::default(), stats.clone()).unwrap();
        let mut restored = Vec::new();
        while let Some(item) = reader.read_record().unwrap() {
            restored.push(item);
            assert!(reader.buffer_capacity() <= layout.bytes() + 16);
        }

        assert_eq!(restored, saved);
        assert!(stats.reads() >= stats.writes());
    }

    #[rstest]
    fn test_expected_records_mismatch(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("short.bin");
        write_records(&path, 0..5i64, FixedCodec::default()).unwrap();

        let reader = RecordReader::open(&path, PageLayout::buffered(2, 8), FixedCodec::<i64>::default(), IoStats::new())
            .unwrap()
            .with_expected_records(6);

        let result: Vec<io::Result<i64>> = reader.collect();
        let err = result.last().unwrap().as_ref().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(result.iter().filter(|item| item.is_err()).count(), 1);

        let reader = RecordReader::open(&path, PageLayout::direct(2), FixedCodec::<i64>::default(), IoStats::new())
            .unwrap()
            .with_expected_records(4);
        let result: Vec<io::Result<i64>> = reader.collect();
        assert_eq!(result.len(), 5);
        assert_eq!(result[4].as_ref().unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[rstest]
    fn test_truncated_record(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("truncated.bin");
        write_records(&path, 0..3i64, FixedCodec::default()).unwrap();
        fs::write(&path, &fs::read(&path).unwrap()[..20]).unwrap();

        let result: Vec<io::Result<i64>> =
            RecordReader::open(&path, PageLayout::buffered(2, 8), FixedCodec::default(), IoStats::new())
                .unwrap()
                .collect();

        assert_eq!(result.len(), 3);
        assert_eq!(result[2].as_ref().unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[rstest]
    fn test_open_missing_file(tmp_dir: tempfile::TempDir) {
        let result = RecordReader::open(
            &tmp_dir.path().join("missing.bin"),
            PageLayout::buffered(4, 8),
            FixedCodec::<i64>::default(),
            IoStats::new(),
        );
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::NotFound);
    }

    #[rstest]
    fn test_rmp_stream(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("strings.bin");
        let saved = vec!["b".to_string(), "a".to_string(), "hello".to_string()];

        write_records(&path, saved.clone(), RmpCodec::default()).unwrap();
        let restored: Vec<String> = read_records(&path, RmpCodec::default()).unwrap();

        assert_eq!(restored, saved);
        assert_eq!(count_records(&path, RmpCodec::<String>::default()).unwrap(), 3);
    }
}
