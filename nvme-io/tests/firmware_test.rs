//! Integration tests for firmware download and commit.

use std::io::Write;

use nvme_io::nvme::{Controller, ControllerOpts, Opcode};
use nvme_io::sim::SimDevice;
use nvme_io::{DeviceError, Error};

fn controller(chunk: usize) -> Controller<SimDevice> {
    let opts = ControllerOpts {
        fw_chunk_size: Some(chunk),
        ..Default::default()
    };
    Controller::new(SimDevice::new(), opts).unwrap()
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 + 1).collect()
}

#[test]
fn test_download_in_chunks() {
    let ctrlr = controller(8);
    let image = image(21);

    let info = ctrlr.downfw_image(&image, 2, 1).unwrap().waitdone().unwrap();
    assert_eq!(info.opcode, Opcode::FirmwareCommit);

    let submitted = ctrlr.transport().submitted();
    let downloads: Vec<_> = submitted
        .iter()
        .filter(|(_, cmd)| cmd.opcode == Opcode::FirmwareDownload)
        .map(|(_, cmd)| (cmd.cdw11 * 4, (cmd.cdw10 + 1) * 4))
        .collect();
    // offset, length; last chunk padded from 5 to 8 bytes
    assert_eq!(downloads, vec![(0, 8), (8, 8), (16, 8)]);

    let commit = submitted.last().unwrap().1;
    assert_eq!(commit.opcode, Opcode::FirmwareCommit);
    assert_eq!(commit.cdw10, 2 | (1 << 3));

    let (slot, committed) = ctrlr.transport().committed_firmware().unwrap();
    assert_eq!(slot, 2);
    assert_eq!(committed.len(), 24);
    assert_eq!(&committed[..21], &image[..]);
    assert!(committed[21..].iter().all(|b| *b == 0));
}

#[test]
fn test_downfw_from_file() {
    let ctrlr = controller(4096);
    let image = image(10_000);

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&image).unwrap();
    file.flush().unwrap();

    ctrlr.downfw(file.path()).unwrap().waitdone().unwrap();

    let (slot, committed) = ctrlr.transport().committed_firmware().unwrap();
    assert_eq!(slot, 0);
    assert_eq!(&committed[..image.len()], &image[..]);
    assert_eq!(ctrlr.outstanding(), 0);
}

#[test]
fn test_downfw_missing_file() {
    let ctrlr = controller(4096);
    let dir = tempfile::tempdir().unwrap();

    let result = ctrlr.downfw(dir.path().join("missing.bin"));
    assert!(matches!(result, Err(Error::Io(_))));
    assert!(ctrlr.transport().submitted().is_empty());
}

#[test]
fn test_download_chunk_failure_stops() {
    let ctrlr = controller(8);
    ctrlr
        .transport()
        .force_status(Opcode::FirmwareDownload, nvme_io::nvme::Status::new(1, 0x14));

    let result = ctrlr.downfw_image(&image(32), 0, 1);
    assert!(matches!(
        result,
        Err(Error::Device(DeviceError::StatusCode(_)))
    ));
    // First chunk failed, nothing else went out
    assert_eq!(ctrlr.transport().submitted().len(), 1);
    assert!(ctrlr.transport().committed_firmware().is_none());
}

#[test]
fn test_invalid_firmware_args() {
    let ctrlr = controller(8);
    assert!(matches!(
        ctrlr.downfw_image(&[], 0, 1),
        Err(Error::InvalidArgument(_))
    ));

    let opts = ControllerOpts {
        fw_chunk_size: Some(6),
        ..Default::default()
    };
    assert!(matches!(
        Controller::new(SimDevice::new(), opts),
        Err(Error::InvalidArgument(_))
    ));
}
