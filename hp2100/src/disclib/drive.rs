use std::io;

use bitflags::bitflags;
use serde::Serialize;
use tracing::{event, Level};

use super::{DiscImage, DriveModel, SECTOR_WORDS};

bitflags! {
    /// The second Request Status word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
    pub struct Status2: u16 {
        /// One of the error bits below is set.
        const ERROR        = 0o100000;
        const DRIVE_TYPE   = 0o017000;
        const ATTENTION    = 0o000200;
        const READ_ONLY    = 0o000100;
        const FORMAT       = 0o000040;
        const FAULT        = 0o000020;
        const FIRST_STATUS = 0o000010;
        const SEEK_CHECK   = 0o000004;
        const NOT_READY    = 0o000002;
        const BUSY         = 0o000001;
    }
}

const ERRORS: Status2 = Status2::FAULT
    .union(Status2::SEEK_CHECK)
    .union(Status2::NOT_READY);

/// A disc drive and the image mounted on it.
#[derive(Debug, Default)]
pub struct Drive {
    pub model: DriveModel,
    image: Option<DiscImage>,
    heads_loaded: bool,
    /// The cylinder the heads are over.
    pub cylinder: u16,
    pub attention: bool,
    /// Set when the drive becomes ready; cleared by Request Status.
    pub first_status: bool,
    pub seek_check: bool,
    pub fault: bool,
    /// The write-protect switch.
    pub protect: bool,
    /// The format switch.
    pub format: bool,
}

impl Drive {
    pub fn new(model: DriveModel) -> Drive {
        Drive {
            model,
            ..Drive::default()
        }
    }

    pub fn is_attached(&self) -> bool {
        self.image.is_some()
    }

    pub fn image_name(&self) -> Option<&str> {
        self.image.as_ref().map(|image| image.name())
    }

    /// Mounts `image` and loads the heads.  Returns the image which
    /// was mounted before, if any.
    pub fn attach(&mut self, image: DiscImage) -> Option<DiscImage> {
        let previous = self.image.replace(image);
        self.load_heads();
        previous
    }

    /// Unloads the heads and removes the image.
    pub fn detach(&mut self) -> Option<DiscImage> {
        self.heads_loaded = false;
        self.image.take()
    }

    pub fn heads_loaded(&self) -> bool {
        self.heads_loaded
    }

    /// Loads the heads.  Returns false if there is no image mounted.
    pub fn load_heads(&mut self) -> bool {
        if self.image.is_none() {
            return false;
        }
        if !self.heads_loaded {
            event!(Level::DEBUG, "{} heads loaded", self.model);
            self.heads_loaded = true;
            self.cylinder = 0;
            self.first_status = true;
            self.attention = true;
        }
        true
    }

    pub fn unload_heads(&mut self) {
        if self.heads_loaded {
            event!(Level::DEBUG, "{} heads unloaded", self.model);
            self.heads_loaded = false;
            self.attention = true;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.heads_loaded && self.image.is_some()
    }

    pub fn has_errors(&self) -> bool {
        self.status2().intersects(ERRORS)
    }

    pub fn status2(&self) -> Status2 {
        let mut status = Status2::from_bits_truncate(self.model.type_code() << 9);
        for (condition, bit) in [
            (self.attention, Status2::ATTENTION),
            (self.protect, Status2::READ_ONLY),
            (self.format, Status2::FORMAT),
            (self.fault, Status2::FAULT),
            (self.first_status, Status2::FIRST_STATUS),
            (self.seek_check, Status2::SEEK_CHECK),
            (!self.is_ready(), Status2::NOT_READY),
        ] {
            if condition {
                status |= bit;
            }
        }
        if status.intersects(ERRORS) {
            status |= Status2::ERROR;
        }
        status
    }

    /// Reads a sector from the image.  A drive with no image reads
    /// zeros.
    pub fn read_sector(&mut self, cylinder: u16, head: u8, sector: u8) -> io::Result<Vec<u16>> {
        let offset = self.model.word_offset(cylinder, head, sector);
        match self.image.as_mut() {
            Some(image) => image.read_words(offset, SECTOR_WORDS),
            None => Ok(vec![0; SECTOR_WORDS]),
        }
    }

    pub fn write_sector(
        &mut self,
        cylinder: u16,
        head: u8,
        sector: u8,
        words: &[u16],
    ) -> io::Result<()> {
        let offset = self.model.word_offset(cylinder, head, sector);
        match self.image.as_mut() {
            Some(image) => image.write_words(offset, words),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no disc image is attached")),
        }
    }
}
