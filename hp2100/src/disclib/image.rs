//! Disc images: flat streams of little-endian 16-bit words.
use std::fmt::Debug;
use std::fs::OpenOptions;
use std::io::{self, Cursor, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Anything a disc image can be kept in.
pub trait ImageStore: Read + Write + Seek + Debug + Send {}

impl<T: Read + Write + Seek + Debug + Send> ImageStore for T {}

#[derive(Debug)]
pub struct DiscImage {
    name: String,
    store: Box<dyn ImageStore>,
}

impl DiscImage {
    /// Opens (creating if necessary) the image file at `path`.
    pub fn open(path: &Path) -> io::Result<DiscImage> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(DiscImage {
            name: path.display().to_string(),
            store: Box::new(file),
        })
    }

    /// Creates an image held in memory, starting with `words`.
    pub fn in_memory(words: &[u16]) -> DiscImage {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        DiscImage {
            name: "(memory)".to_string(),
            store: Box::new(Cursor::new(bytes)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reads `count` words starting at word `offset`.  Words beyond
    /// the end of the image read as zero.
    pub fn read_words(&mut self, offset: u64, count: usize) -> io::Result<Vec<u16>> {
        self.store.seek(SeekFrom::Start(offset * 2))?;
        let mut bytes = vec![0_u8; count * 2];
        let mut filled = 0;
        while filled < bytes.len() {
            match self.store.read(&mut bytes[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Writes `words` starting at word `offset`, extending the image
    /// if necessary.
    pub fn write_words(&mut self, offset: u64, words: &[u16]) -> io::Result<()> {
        self.store.seek(SeekFrom::Start(offset * 2))?;
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.store.write_all(&bytes)?;
        self.store.flush()
    }

    /// The size of the image in words.
    pub fn len_words(&mut self) -> io::Result<u64> {
        Ok(self.store.seek(SeekFrom::End(0))? / 2)
    }
}

#[test]
fn test_reading_past_end_gives_zeros() {
    let mut image = DiscImage::in_memory(&[0o1, 0o2]);
    assert_eq!(
        image.read_words(1, 4).expect("in-memory read should succeed"),
        vec![0o2, 0, 0, 0]
    );
}

#[test]
fn test_writing_extends_image() {
    let mut image = DiscImage::in_memory(&[]);
    image
        .write_words(3, &[0o177777])
        .expect("in-memory write should succeed");
    assert_eq!(image.len_words().expect("seek should succeed"), 4);
    assert_eq!(
        image.read_words(0, 4).expect("in-memory read should succeed"),
        vec![0, 0, 0, 0o177777]
    );
}
