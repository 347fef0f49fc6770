//! End-to-end coverage of the snapshot backend through the public API.

use std::io::Write;

use vmscope::{
    AddressSpace, BackendKind, Error, InitFlags, InitOptions, OsType, Pa, VmTarget, Vmscope,
};

/// Writes a 16 MiB dump with a position-dependent byte pattern.
fn write_dump() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();

    let mut page = vec![0u8; 4096];
    for offset in 0..4096usize {
        page[offset] = (offset % 251) as u8;
    }
    for number in 0..(16 * 1024 * 1024 / 4096) {
        page[0] = (number % 256) as u8;
        file.write_all(&page).unwrap();
    }
    file.flush().unwrap();
    file
}

fn expected(offset: u64) -> u8 {
    if offset % 4096 == 0 {
        (offset / 4096 % 256) as u8
    } else {
        (offset % 4096 % 251) as u8
    }
}

fn open(file: &tempfile::NamedTempFile) -> Vmscope {
    Vmscope::init(
        VmTarget::Snapshot(file.path().to_path_buf()),
        InitOptions {
            backend: BackendKind::File,
            ..InitOptions::default()
        },
    )
    .unwrap()
}

#[test]
fn snapshot_read_matches_the_dump() -> Result<(), Error> {
    let file = write_dump();
    let vm = open(&file);

    let mut buf = [0u8; 16];
    vm.read_pa(Pa(0x1000), &mut buf)?;

    let wanted: Vec<u8> = (0x1000u64..0x1010).map(expected).collect();
    assert_eq!(&buf[..], &wanted[..]);
    Ok(())
}

#[test]
fn reads_crossing_page_boundaries_are_seamless() -> Result<(), Error> {
    let file = write_dump();
    let vm = open(&file);

    let mut buf = [0u8; 64];
    vm.read_pa(Pa(0x2000 - 32), &mut buf)?;

    let wanted: Vec<u8> = (0x2000u64 - 32..0x2000 + 32).map(expected).collect();
    assert_eq!(&buf[..], &wanted[..]);
    Ok(())
}

#[test]
fn snapshot_writes_are_read_back() -> Result<(), Error> {
    let file = write_dump();
    let vm = open(&file);

    vm.write_pa(Pa(0x5008), &[0xfe, 0xed, 0xfa, 0xce])?;

    let mut buf = [0u8; 4];
    vm.read(0x5008, AddressSpace::Physical, &mut buf)?;
    assert_eq!(buf, [0xfe, 0xed, 0xfa, 0xce]);
    Ok(())
}

#[test]
fn snapshot_facts_and_limits() -> Result<(), Error> {
    let file = write_dump();
    let vm = open(&file);

    assert_eq!(vm.memsize(), 16 * 1024 * 1024);
    assert_eq!(vm.num_vcpus(), 0);
    assert_eq!(vm.ostype(), OsType::None);
    assert_eq!(vm.page_mode(), None);

    // Without registers there is no page-table root to walk from.
    let mut buf = [0u8; 8];
    assert!(vm.read(0xffff_8000_0000_0000, AddressSpace::Kernel, &mut buf).is_err());

    // Reads past the end of the dump fail rather than wrapping.
    assert!(vm.read_pa(Pa(16 * 1024 * 1024), &mut buf).is_err());
    Ok(())
}

#[test]
fn autodetect_falls_through_to_the_snapshot_backend() -> Result<(), Error> {
    let file = write_dump();

    let vm = Vmscope::init(
        VmTarget::Snapshot(file.path().to_path_buf()),
        InitOptions::default(),
    )
    .unwrap();

    let mut buf = [0u8; 2];
    vm.read_pa(Pa(0), &mut buf)?;
    assert_eq!(buf, [0, 1]);
    Ok(())
}

#[test]
fn events_are_rejected_on_snapshots() {
    let file = write_dump();

    let result = Vmscope::init(
        VmTarget::Snapshot(file.path().to_path_buf()),
        InitOptions {
            backend: BackendKind::File,
            flags: InitFlags::PARTIAL | InitFlags::EVENTS,
            ..InitOptions::default()
        },
    );

    assert!(matches!(result, Err(Error::NotSupported)));
}

#[test]
fn os_detection_consumes_the_configuration() -> Result<(), Error> {
    let file = write_dump();

    let entries = vmscope::config::parse(
        r#"snapshot {
            ostype = "Windows";
            win_tasks = 0x88;
            win_pdbase = 0x18;
        }"#,
    )
    .unwrap();

    let vm = Vmscope::init(
        VmTarget::Snapshot(file.path().to_path_buf()),
        InitOptions {
            backend: BackendKind::File,
            flags: InitFlags::COMPLETE,
            config: Some(entries["snapshot"].clone()),
            ..InitOptions::default()
        },
    )?;

    assert_eq!(vm.ostype(), OsType::Windows);
    assert_eq!(vm.offset("win_tasks"), Some(0x88));
    assert_eq!(vm.offset("win_pdbase"), Some(0x18));
    assert_eq!(vm.offset("linux_tasks"), None);
    Ok(())
}
