//! Resilience tests - simulate crashes, failing writes and damaged chains.

use chaff_vfs::config::{KdfConfig, VfsConfig};
use chaff_vfs::storage::{BlockDevice, MemoryDevice, RandomSource};
use chaff_vfs::vfs::ChaffVfs;
use chaff_vfs::{Error, Result};
use std::cell::Cell;
use std::io;
use std::rc::Rc;

const BS: u32 = 512;

/// Failure switches shared between a test and the device it handed over.
#[derive(Clone, Default)]
struct Faults {
    /// Fail any write starting at this byte offset.
    fail_offset: Rc<Cell<Option<u64>>>,
    /// Number of writes still allowed to succeed.
    budget: Rc<Cell<Option<usize>>>,
}

impl Faults {
    fn disarm(&self) {
        self.fail_offset.set(None);
        self.budget.set(None);
    }
}

/// Memory device whose writes can be made to fail on demand.
struct FailingDevice {
    inner: MemoryDevice,
    faults: Faults,
}

impl FailingDevice {
    fn new(blocks: usize, faults: Faults) -> Self {
        Self {
            inner: fresh_device(blocks),
            faults,
        }
    }

    fn injected(offset: u64) -> Error {
        Error::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("injected write failure at offset {}", offset),
        ))
    }
}

impl BlockDevice for FailingDevice {
    fn len_bytes(&self) -> u64 {
        self.inner.len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact_at(offset, buf)
    }

    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.faults.fail_offset.get() == Some(offset) {
            return Err(Self::injected(offset));
        }
        if let Some(left) = self.faults.budget.get() {
            if left == 0 {
                return Err(Self::injected(offset));
            }
            self.faults.budget.set(Some(left - 1));
        }
        self.inner.write_all_at(offset, buf)
    }

    fn sync(&mut self) -> Result<()> {
        self.inner.sync()
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.inner.set_len(len)
    }
}

fn test_config(reserved_percent: u8) -> VfsConfig {
    VfsConfig {
        block_size: BS,
        reserved_percent,
        launder_per_mille: 0,
        kdf: KdfConfig {
            iterations: 1,
            memory_kib: 64,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn fresh_device(blocks: usize) -> MemoryDevice {
    MemoryDevice::random(blocks * BS as usize, &mut RandomSource::seeded(11))
}

fn mount<D: BlockDevice>(device: D, passphrases: &[&str]) -> ChaffVfs<D> {
    mount_reserving(device, 0, passphrases)
}

fn mount_reserving<D: BlockDevice>(
    device: D,
    reserved_percent: u8,
    passphrases: &[&str],
) -> ChaffVfs<D> {
    ChaffVfs::mount_with(
        device,
        RandomSource::seeded(23),
        test_config(reserved_percent),
        passphrases,
    )
    .expect("Failed to mount")
}

/// A name long enough that each record needs a chain block of its own.
fn long_name(tag: char) -> String {
    format!("/{}", tag.to_string().repeat(300))
}

#[test]
fn test_crash_while_writing_start_block_keeps_previous_directory() {
    let faults = Faults::default();
    let mut vfs = mount(FailingDevice::new(64, faults.clone()), &["4crash"]);

    vfs.create_dir("/keep").unwrap();
    vfs.create_file("/keep/a").unwrap();
    vfs.write("/keep/a", 0, b"committed").unwrap();
    vfs.sync().unwrap();

    vfs.create_file("/keep/b").unwrap();
    vfs.write("/keep/b", 0, b"pending").unwrap();
    faults.fail_offset.set(Some(4 * u64::from(BS)));

    assert!(vfs.sync().is_err());
    assert!(vfs.is_dirty());

    let device = vfs.into_device();
    faults.disarm();
    let vfs = mount(device, &["4crash"]);

    assert!(!vfs.report().fell_back_to_empty);
    assert_eq!(vfs.read("/keep/a", 0, 64).unwrap(), b"committed");
    assert!(matches!(vfs.stat("/keep/b"), Err(Error::NotFound(_))));
}

#[test]
fn test_failed_flush_is_retried() {
    let faults = Faults::default();
    let mut vfs = mount(FailingDevice::new(64, faults.clone()), &["4retry"]);
    vfs.create_file("/first").unwrap();

    faults.budget.set(Some(0));
    assert!(vfs.sync().is_err());
    assert!(vfs.is_dirty());

    faults.disarm();
    vfs.sync().unwrap();
    assert!(!vfs.is_dirty());

    let vfs = mount(vfs.into_device(), &["4retry"]);
    assert!(vfs.stat("/first").is_ok());
}

#[test]
fn test_failed_forced_flush_does_not_fail_the_mutation() {
    let faults = Faults::default();
    let mut config = test_config(0);
    config.max_dirty_calls = 0;
    let mut vfs = ChaffVfs::mount_with(
        FailingDevice::new(64, faults.clone()),
        RandomSource::seeded(23),
        config,
        &["5eager"],
    )
    .unwrap();

    faults.budget.set(Some(0));
    vfs.create_file("/f").unwrap();

    assert!(vfs.stat("/f").is_ok());
    assert!(vfs.is_dirty());
    assert!(matches!(vfs.create_file("/f"), Err(Error::AlreadyExists(_))));
    assert!(vfs.sync().is_err());

    faults.disarm();
    vfs.create_dir("/d").unwrap();
    assert!(!vfs.is_dirty());

    let vfs = mount(vfs.into_device(), &["5eager"]);
    assert!(vfs.stat("/f").is_ok());
    assert!(vfs.stat("/d").is_ok());
}

#[test]
fn test_crash_midway_through_continuation_blocks() {
    let faults = Faults::default();
    let mut vfs = mount(FailingDevice::new(64, faults.clone()), &["6chain"]);
    vfs.create_file("/short").unwrap();
    vfs.write("/short", 0, b"before the crash").unwrap();
    vfs.sync().unwrap();
    let journal_before = vfs.journal().to_vec();
    let used_before = vfs.store().used_blocks();

    for tag in ['x', 'y', 'z'] {
        vfs.create_file(&long_name(tag)).unwrap();
    }
    // One continuation block lands, the next write dies.
    faults.budget.set(Some(1));

    assert!(vfs.sync().is_err());
    assert_eq!(vfs.journal(), journal_before.as_slice());
    assert_eq!(vfs.store().used_blocks(), used_before);

    let device = vfs.into_device();
    faults.disarm();
    let vfs = mount(device, &["6chain"]);

    assert_eq!(vfs.read("/short", 0, 64).unwrap(), b"before the crash");
    for tag in ['x', 'y', 'z'] {
        assert!(vfs.stat(&long_name(tag)).is_err());
    }
}

#[test]
fn test_multi_block_chain_survives_remount() {
    let mut vfs = mount(fresh_device(64), &["6chain"]);
    for tag in ['x', 'y', 'z'] {
        let name = long_name(tag);
        vfs.create_file(&name).unwrap();
        vfs.write(&name, 0, name.as_bytes()).unwrap();
    }
    vfs.sync().unwrap();
    assert!(vfs.journal().len() >= 3);
    assert_eq!(vfs.walk_chain().unwrap().blocks, vfs.journal());

    let vfs = mount(vfs.unmount().unwrap(), &["6chain"]);
    for tag in ['x', 'y', 'z'] {
        let name = long_name(tag);
        assert_eq!(vfs.read(&name, 0, 1024).unwrap(), name.as_bytes());
    }
}

#[test]
fn test_failed_data_write_makes_volume_read_only() {
    let faults = Faults::default();
    let mut vfs = mount(FailingDevice::new(64, faults.clone()), &["8rw"]);
    vfs.create_file("/f").unwrap();
    vfs.write("/f", 0, &[1u8; 100]).unwrap();
    vfs.sync().unwrap();

    faults.budget.set(Some(0));
    assert!(matches!(vfs.write("/f", 10, b"x"), Err(Error::Io(_))));
    assert!(vfs.is_read_only());
    faults.disarm();

    assert!(matches!(vfs.write("/f", 0, b"y"), Err(Error::ReadOnly)));
    assert!(matches!(vfs.create_file("/g"), Err(Error::ReadOnly)));
    assert!(matches!(vfs.remove_file("/f"), Err(Error::ReadOnly)));
    assert_eq!(vfs.read("/f", 0, 100).unwrap(), vec![1u8; 100]);
    assert!(vfs.info().read_only);

    let vfs = mount(vfs.unmount().unwrap(), &["8rw"]);
    assert!(!vfs.is_read_only());
    assert_eq!(vfs.read("/f", 0, 100).unwrap(), vec![1u8; 100]);
}

#[test]
fn test_full_pool_still_saves_directory() {
    let mut vfs = mount(fresh_device(8), &["1full"]);
    vfs.create_file("/d").unwrap();
    vfs.write("/d", 0, &vec![7u8; 7 * BS as usize]).unwrap();
    assert_eq!(vfs.store().free_blocks(), 0);
    for tag in ['p', 'q', 'r'] {
        vfs.create_file(&long_name(tag)).unwrap();
    }

    vfs.sync().unwrap();

    assert!(vfs.is_read_only());
    assert!(vfs.store().block_count() > 8);
    assert!(matches!(
        vfs.write("/d", 0, b"nope"),
        Err(Error::ReadOnly)
    ));

    let device = vfs.unmount().unwrap();
    assert!(device.len_bytes() > 8 * u64::from(BS));

    let vfs = mount(device, &["1full"]);
    assert!(!vfs.report().fell_back_to_empty);
    assert_eq!(vfs.read("/d", 0, 7 * BS as usize).unwrap(), vec![7u8; 7 * BS as usize]);
    for tag in ['p', 'q', 'r'] {
        assert!(vfs.stat(&long_name(tag)).is_ok());
    }
}

#[test]
fn test_corrupt_start_block_falls_back_to_empty_root() {
    let mut vfs = mount(fresh_device(64), &["3fragile"]);
    vfs.create_file("/gone").unwrap();
    vfs.write("/gone", 0, b"lost on corruption").unwrap();
    let device = vfs.unmount().unwrap();

    let mut image = device.into_inner();
    let start = 3 * BS as usize;
    image[start + 10] ^= 0xFF;

    let vfs = mount(MemoryDevice::from_bytes(image), &["3fragile"]);

    assert!(vfs.report().fell_back_to_empty);
    assert!(vfs.list_dir("/").unwrap().is_empty());
    assert_eq!(vfs.store().used_blocks(), 1);
}

#[test]
fn test_corrupt_continuation_block_falls_back_to_empty_root() {
    let mut vfs = mount(fresh_device(64), &["6chain"]);
    for tag in ['x', 'y', 'z'] {
        vfs.create_file(&long_name(tag)).unwrap();
    }
    let vfs = mount(vfs.unmount().unwrap(), &["6chain"]);
    let continuation = vfs.walk_chain().unwrap().blocks[1];
    assert_eq!(vfs.journal()[1], continuation);

    let mut image = vfs.into_device().into_inner();
    let at = continuation as usize * BS as usize;
    image[at + 12] ^= 0x55;

    let vfs = mount(MemoryDevice::from_bytes(image), &["6chain"]);

    assert!(vfs.report().fell_back_to_empty);
    assert!(vfs.walk_chain().is_err());
}

#[test]
fn test_locked_branch_blocks_survive_a_full_pool() {
    let mut hidden = mount(fresh_device(64), &["2hidden"]);
    hidden.create_file("/h").unwrap();
    hidden.write("/h", 0, &[0x42u8; 3 * BS as usize]).unwrap();
    hidden.sync().unwrap();
    let mut hidden_blocks: Vec<u32> = hidden.blocks("/h").unwrap().iter().map(|b| b.index).collect();
    hidden_blocks.extend_from_slice(hidden.journal());
    let device = hidden.unmount().unwrap();
    let snapshot: Vec<u8> = device.as_bytes().to_vec();

    let public_start = (3..64).find(|b| !hidden_blocks.contains(b)).unwrap();
    let public = format!("{}public", public_start);
    let mut vfs = mount_reserving(device, 10, &["2hidden", public.as_str()]);
    assert_eq!(vfs.report().locked_branches, 1);
    assert_eq!(vfs.report().reserved_blocks, hidden_blocks.len() as u64);

    vfs.create_file("/fill").unwrap();
    let chunk = vec![0x99u8; BS as usize];
    let mut offset = 0u64;
    loop {
        match vfs.write("/fill", offset, &chunk) {
            Ok(_) => offset += u64::from(BS),
            Err(Error::CapacityExhausted) => break,
            Err(e) => panic!("unexpected error while filling the pool: {}", e),
        }
    }
    assert!(offset > 0);
    let device = vfs.unmount().unwrap();

    for &index in &hidden_blocks {
        let range = index as usize * BS as usize..(index as usize + 1) * BS as usize;
        assert_eq!(
            &device.as_bytes()[range.clone()],
            &snapshot[range],
            "block {} of the locked branch was overwritten",
            index
        );
    }

    let hidden = mount(device, &["2hidden"]);
    assert_eq!(
        hidden.read("/h", 0, 3 * BS as usize).unwrap(),
        vec![0x42u8; 3 * BS as usize]
    );
}

#[test]
fn test_damaged_locked_branch_refuses_mount() {
    let mut hidden = mount(fresh_device(64), &["2hidden"]);
    hidden.create_file("/h").unwrap();
    let mut image = hidden.unmount().unwrap().into_inner();
    image[2 * BS as usize + 9] ^= 0x01;

    let result = ChaffVfs::mount_with(
        MemoryDevice::from_bytes(image),
        RandomSource::seeded(5),
        test_config(0),
        &["2hidden", "40public"],
    );

    assert!(matches!(result, Err(Error::InvalidBranch(_))));
}
