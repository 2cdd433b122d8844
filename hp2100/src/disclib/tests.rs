use test_strategy::{proptest, Arbitrary};

use super::*;
use super::controller::{COMMAND_TIME, INCREMENTAL_SEEK};

fn attached_drive(model: DriveModel) -> Drive {
    let mut drive = Drive::new(model);
    drive.attach(DiscImage::in_memory(&[]));
    drive
}

/// Sets up a command from its parameter bytes and starts it.
fn start(controller: &mut Controller, drive: &Drive, bytes: &[u8]) -> Option<usize> {
    let (opcode, rest) = bytes.split_first().expect("a command has an opcode byte");
    assert!(controller.prepare_command(*opcode));
    for (i, byte) in rest.iter().enumerate() {
        controller.load_byte(i + 1, *byte);
    }
    controller.start_command(drive)
}

/// Runs a command to completion, passing through any data phase
/// without touching the buffer.
fn run(controller: &mut Controller, drive: &mut Drive, bytes: &[u8]) -> StatusCode {
    if start(controller, drive, bytes).is_none() {
        return controller.status();
    }
    loop {
        let status = controller
            .service_drive(drive, "test unit")
            .expect("the drive service should not stop");
        if controller.state() == ControllerState::Idle {
            return status;
        }
    }
}

fn seek_bytes(cylinder: u16, head: u8, sector: u8) -> [u8; 6] {
    let [c_hi, c_lo] = cylinder.to_be_bytes();
    [Opcode::Seek as u8, 0, c_hi, c_lo, head, sector]
}

#[test]
fn test_opcode_decoding() {
    assert_eq!(Opcode::decode(0o05), Some(Opcode::Read));
    assert_eq!(Opcode::decode(0o22), Some(Opcode::ReadWithoutVerify));
    assert_eq!(Opcode::decode(0o20), None);
    assert_eq!(Opcode::decode(0o21), None);
    assert_eq!(Opcode::Seek.parameter_words(), 3);
    assert_eq!(Opcode::Verify.parameter_words(), 2);
    assert_eq!(Opcode::Read.parameter_words(), 1);
    assert_eq!(Opcode::Initialize.class(), OpcodeClass::Write);
    assert_eq!(Opcode::RequestStatus.class(), OpcodeClass::Status);
    assert_eq!(Opcode::Seek.class(), OpcodeClass::Control);
}

#[test]
fn test_status_code_display() {
    assert_eq!(
        StatusCode::Status2Error.to_string(),
        "status-2 error (23)"
    );
    assert_eq!(StatusCode::try_from(0o37), Ok(StatusCode::DriveAttention));
    assert_eq!(StatusCode::try_from(0o04), Err(0o04));
}

#[test]
fn test_illegal_opcode_is_not_prepared() {
    let mut controller = Controller::new();
    assert!(!controller.prepare_command(0o25));
    assert_eq!(controller.status(), StatusCode::IllegalOpcode);
    assert_eq!(controller.opcode(), None);
}

#[test]
fn test_seek_then_read() {
    let mut drive = Drive::new(DriveModel::Hp7906);
    let offset = drive.model.word_offset(10, 2, 5);
    let mut words = vec![0_u16; offset as usize];
    words.extend((0..SECTOR_WORDS as u16).map(|n| n * 3));
    drive.attach(DiscImage::in_memory(&words));
    let mut controller = Controller::new();

    assert_eq!(start(&mut controller, &drive, &seek_bytes(10, 2, 5)), Some(0));
    let status = controller
        .service_drive(&mut drive, "test unit")
        .expect("seek start should succeed");
    assert_eq!(status, StatusCode::NormalCompletion);
    assert_eq!(controller.phase(), Phase::End);
    assert!(controller.wait() > COMMAND_TIME);
    drive.attention = false;
    controller
        .service_drive(&mut drive, "test unit")
        .expect("seek end should succeed");
    assert_eq!(controller.state(), ControllerState::Idle);
    assert!(drive.attention);
    assert_eq!(drive.cylinder, 10);

    assert_eq!(start(&mut controller, &drive, &[Opcode::Read as u8, 0]), Some(0));
    controller
        .service_drive(&mut drive, "test unit")
        .expect("read start should succeed");
    assert_eq!(controller.phase(), Phase::Data);
    assert_eq!(controller.buffer().len(), SECTOR_WORDS);
    assert_eq!(controller.buffer()[1], 3);
    assert_eq!(controller.unload_byte(3), Some(3));
    assert_eq!(controller.unload_byte(2), Some(0));
    controller
        .service_drive(&mut drive, "test unit")
        .expect("read end should succeed");
    assert_eq!(controller.state(), ControllerState::Idle);
    assert_eq!(controller.address(), (10, 2, 6));
}

#[test]
fn test_write_lands_at_the_sector_offset() {
    let mut drive = attached_drive(DriveModel::Hp7920);
    let mut controller = Controller::new();
    assert_eq!(
        run(&mut controller, &mut drive, &seek_bytes(1, 0, 0)),
        StatusCode::NormalCompletion
    );
    assert_eq!(start(&mut controller, &drive, &[Opcode::Write as u8, 0]), Some(0));
    controller
        .service_drive(&mut drive, "test unit")
        .expect("write start should succeed");
    assert_eq!(controller.phase(), Phase::Data);
    // Only the first word arrives; the rest of the sector is zero.
    controller.load_byte(0, 0o123);
    controller.load_byte(1, 0o45);
    let status = controller
        .service_drive(&mut drive, "test unit")
        .expect("write end should succeed");
    assert_eq!(status, StatusCode::NormalCompletion);
    let sector = drive
        .read_sector(1, 0, 0)
        .expect("in-memory read should succeed");
    assert_eq!(sector[0], 0o123 << 8 | 0o45);
    assert!(sector[1..].iter().all(|w| *w == 0));
    assert_eq!(
        drive.read_sector(0, 0, 0).expect("in-memory read should succeed"),
        vec![0; SECTOR_WORDS]
    );
}

#[test]
fn test_request_status_clears_first_status() {
    let mut drive = attached_drive(DriveModel::Hp7920);
    let mut controller = Controller::new();
    assert_eq!(
        start(&mut controller, &drive, &[Opcode::RequestStatus as u8, 0]),
        Some(0)
    );
    controller
        .service_drive(&mut drive, "test unit")
        .expect("status should succeed");
    let status2 = Status2::from_bits_truncate(controller.buffer()[1]);
    assert_eq!(controller.buffer()[0], 0);
    assert!(status2.contains(Status2::FIRST_STATUS | Status2::ATTENTION));
    assert!(!status2.contains(Status2::ERROR));
    assert_eq!(status2 & Status2::DRIVE_TYPE, Status2::from_bits_truncate(1 << 9));

    start(&mut controller, &drive, &[Opcode::RequestStatus as u8, 0]);
    controller
        .service_drive(&mut drive, "test unit")
        .expect("status should succeed");
    let status2 = Status2::from_bits_truncate(controller.buffer()[1]);
    assert!(!status2.intersects(Status2::FIRST_STATUS | Status2::ATTENTION));
}

#[test]
fn test_seek_outside_the_drive() {
    let mut drive = attached_drive(DriveModel::Hp7906);
    let mut controller = Controller::new();
    assert_eq!(
        run(&mut controller, &mut drive, &seek_bytes(411, 0, 0)),
        StatusCode::Status2Error
    );
    assert!(drive.seek_check);
    // Request Status reports the failure and the seek check.
    start(&mut controller, &drive, &[Opcode::RequestStatus as u8, 0]);
    controller
        .service_drive(&mut drive, "test unit")
        .expect("status should succeed");
    assert_eq!(
        controller.buffer()[0],
        u16::from(StatusCode::Status2Error.code()) << 8
    );
    let status2 = Status2::from_bits_truncate(controller.buffer()[1]);
    assert!(status2.contains(Status2::ERROR | Status2::SEEK_CHECK));
    assert!(!drive.seek_check);
}

#[test]
fn test_end_of_cylinder() {
    let mut drive = attached_drive(DriveModel::Hp7906);
    let mut controller = Controller::new();
    let last = [Opcode::AddressRecord as u8, 0, 0, 0, 3, 47];
    assert_eq!(run(&mut controller, &mut drive, &last), StatusCode::NormalCompletion);
    let read = [Opcode::Read as u8, 0];
    assert_eq!(run(&mut controller, &mut drive, &read), StatusCode::NormalCompletion);
    assert_eq!(run(&mut controller, &mut drive, &read), StatusCode::EndOfCylinder);

    // With incremental seek the heads move on instead.
    let mask = [Opcode::SetFileMask as u8, INCREMENTAL_SEEK];
    assert_eq!(run(&mut controller, &mut drive, &mask), StatusCode::NormalCompletion);
    assert_eq!(run(&mut controller, &mut drive, &last), StatusCode::NormalCompletion);
    assert_eq!(run(&mut controller, &mut drive, &read), StatusCode::NormalCompletion);
    assert_eq!(controller.address(), (1, 0, 0));
    assert_eq!(drive.cylinder, 1);
    assert_eq!(run(&mut controller, &mut drive, &read), StatusCode::NormalCompletion);
}

#[test]
fn test_rejections() {
    let mut drive = attached_drive(DriveModel::Hp7920);
    let mut controller = Controller::new();
    assert_eq!(start(&mut controller, &drive, &[Opcode::Read as u8, 1]), None);
    assert_eq!(controller.status(), StatusCode::UnitUnavailable);

    drive.protect = true;
    assert_eq!(
        run(&mut controller, &mut drive, &[Opcode::Write as u8, 0]),
        StatusCode::ProtectedTrack
    );
    drive.protect = false;
    assert_eq!(
        run(&mut controller, &mut drive, &[Opcode::Initialize as u8, 0]),
        StatusCode::Status2Error
    );

    drive.unload_heads();
    assert_eq!(start(&mut controller, &drive, &[Opcode::Read as u8, 0]), None);
    assert_eq!(controller.status(), StatusCode::AccessNotReady);
    // The controller can still report status.
    assert_eq!(
        start(&mut controller, &drive, &[Opcode::RequestStatus as u8, 0]),
        Some(0)
    );
}

#[test]
fn test_service_without_command_stops() {
    let mut drive = attached_drive(DriveModel::Hp7920);
    let mut controller = Controller::new();
    let stop = controller
        .service_drive(&mut drive, "DA unit 0")
        .expect_err("servicing an idle controller is a bug");
    assert_eq!(stop.kind, crate::stop::StopKind::Internal);
}

#[derive(Arbitrary, Debug, Clone, Copy)]
enum Model {
    Hp7906,
    Hp7920,
    Hp7925,
}

impl From<Model> for DriveModel {
    fn from(m: Model) -> DriveModel {
        match m {
            Model::Hp7906 => DriveModel::Hp7906,
            Model::Hp7920 => DriveModel::Hp7920,
            Model::Hp7925 => DriveModel::Hp7925,
        }
    }
}

#[proptest]
fn verify_never_leaves_the_drive(
    model: Model,
    #[strategy(0u8..9)] head: u8,
    #[strategy(0u8..64)] sector: u8,
    #[strategy(0u16..200)] count: u16,
    incremental: bool,
) {
    let model = DriveModel::from(model);
    let mut drive = attached_drive(model);
    let mut controller = Controller::new();
    if incremental {
        run(&mut controller, &mut drive, &[Opcode::SetFileMask as u8, INCREMENTAL_SEEK]);
    }
    let cylinder = model.cylinders() - 1;
    let [c_hi, c_lo] = cylinder.to_be_bytes();
    let address = [Opcode::AddressRecord as u8, 0, c_hi, c_lo, head, sector];
    run(&mut controller, &mut drive, &address);
    drive.cylinder = cylinder;
    let [n_hi, n_lo] = count.to_be_bytes();
    let status = run(&mut controller, &mut drive, &[Opcode::Verify as u8, 0, n_hi, n_lo]);
    let (c, h, s) = controller.address();
    if model.contains(cylinder, head, sector) {
        assert!(model.contains(c, h, s));
    } else if count > 0 {
        assert_eq!(status, StatusCode::HeadSectorMiscompare);
    }
}
