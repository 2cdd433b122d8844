use std::time::Duration;

use base::prelude::*;
use hp2100::da::DiscConfiguration;
use hp2100::disclib::{DiscImage, DriveModel, StatusCode, Status2, SECTOR_WORDS};
use hp2100::{CardConfiguration, DiscInterface, DriverError, HostDriver};

const SC: SelectCode = select_code!(0o14);
const UNIT: BusAddress = bus_address!(0);

fn driver_for(image: DiscImage, model: DriveModel) -> HostDriver {
    let mut iface = DiscInterface::new(CardConfiguration::new(SC));
    iface
        .configure(
            0,
            &DiscConfiguration {
                address: UNIT,
                model,
                protect: false,
                format: false,
            },
        )
        .expect("unit 0 should accept its configuration");
    iface.attach(0, image).expect("unit 0 should attach");
    HostDriver::new(SC, iface, UNIT)
}

#[test]
fn test_power_on_and_identify() {
    let mut driver = driver_for(DiscImage::in_memory(&[]), DriveModel::Hp7925);
    assert_eq!(driver.preset().expect("preset should succeed"), 2);
    assert_eq!(driver.identify().expect("identify should succeed"), 0x0004);
    // Reading the DSJ cleared it.
    assert_eq!(driver.dsj().expect("DSJ should succeed"), 0);
}

#[test]
fn test_write_then_read_back_through_a_file() {
    let dir = tempfile::tempdir().expect("a temporary directory should be available");
    let path = dir.path().join("disc.img");
    let image = DiscImage::open(&path).expect("the image file should open");
    let mut driver = driver_for(image, DriveModel::Hp7920);
    driver.preset().expect("preset should succeed");

    let sector: Vec<u16> = (0..SECTOR_WORDS as u16).map(|n| n.wrapping_mul(0o401)).collect();
    driver
        .write_sector(3, 1, 7, &sector)
        .expect("write should succeed");
    assert_eq!(
        driver.read_sector(3, 1, 7).expect("read should succeed"),
        sector
    );
    assert!(driver.now() > Duration::ZERO);

    // The data really went to the file, at the sector's offset.
    let mut iface_image = driver
        .interface_mut()
        .expect("the card is plugged in")
        .detach(0)
        .expect("unit 0 is attached");
    let offset = DriveModel::Hp7920.word_offset(3, 1, 7);
    assert_eq!(
        iface_image
            .read_words(offset, SECTOR_WORDS)
            .expect("the image file should be readable"),
        sector
    );
}

#[test]
fn test_seek_error_is_reported() {
    let mut driver = driver_for(DiscImage::in_memory(&[]), DriveModel::Hp7906);
    driver.preset().expect("preset should succeed");
    match driver.seek(411, 0, 0) {
        Err(DriverError::UnitError { dsj, status }) => {
            assert_eq!(dsj, 1);
            assert_eq!(
                status[0] >> 8,
                u16::from(StatusCode::Status2Error.code())
            );
            assert!(Status2::from_bits_truncate(status[1]).contains(Status2::SEEK_CHECK));
        }
        other => panic!("expected a unit error, got {other:?}"),
    }
    // The drive is usable again afterwards.
    driver.seek(410, 0, 0).expect("seek within the drive should succeed");
}

#[test]
fn test_protected_write_is_refused() {
    let mut driver = driver_for(DiscImage::in_memory(&[]), DriveModel::Hp7920);
    driver.preset().expect("preset should succeed");
    driver
        .interface_mut()
        .expect("the card is plugged in")
        .set_protect(0, true)
        .expect("unit 0 exists");
    match driver.write_sector(0, 0, 0, &[1, 2, 3]) {
        Err(DriverError::UnitError { status, .. }) => {
            assert_eq!(
                status[0] >> 8,
                u16::from(StatusCode::ProtectedTrack.code())
            );
        }
        other => panic!("expected a unit error, got {other:?}"),
    }
    let report = driver.report().expect("the card is plugged in");
    assert_eq!(report.units[0].dsj, 0);
}

#[test]
fn test_missing_drive_times_out() {
    let iface = DiscInterface::new(CardConfiguration::new(SC));
    let mut driver =
        HostDriver::new(SC, iface, UNIT).with_timeout(Duration::from_millis(1));
    match driver.preset() {
        Err(DriverError::Timeout { .. }) => (),
        other => panic!("expected a timeout, got {other:?}"),
    }
}

#[test]
fn test_empty_write_is_refused() {
    let mut driver = driver_for(DiscImage::in_memory(&[]), DriveModel::Hp7920);
    driver.preset().expect("preset should succeed");
    assert!(matches!(
        driver.write_sector(0, 0, 0, &[]),
        Err(DriverError::NothingToWrite)
    ));
    // Nothing was sent, so the drive is still idle and happy.
    assert_eq!(driver.dsj().expect("DSJ should succeed"), 0);
}
