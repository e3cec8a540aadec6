//! The kernel backend: `DM_*` ioctls against `/dev/mapper/control`.
//!
//! Every request starts with a fixed 312-byte header; table loads append
//! serialized target cells, and table/status queries hand the kernel a
//! buffer it fills with the same cell layout. Cells are 8-byte aligned; the
//! `next` field of each cell is the offset of its successor relative to the
//! payload start.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;

use nix::errno::Errno;
use snapslot_error::{Result, SnapError};
use tracing::debug;

use crate::target::{DeviceState, DmTable, TargetLine};
use crate::traits::Mapper;

const CONTROL_NODE: &str = "/dev/mapper/control";

/// Minimum expected interface version.
const DM_VERSION: [u32; 3] = [4, 0, 0];

const DM_NAME_LEN: usize = 128;
const DM_UUID_LEN: usize = 129;
const DM_MAX_TYPE_NAME: usize = 16;

// dm_ioctl.flags bits.
const DM_SUSPEND_FLAG: u32 = 1 << 1;
const DM_STATUS_TABLE_FLAG: u32 = 1 << 4;
const DM_ACTIVE_PRESENT_FLAG: u32 = 1 << 5;
const DM_BUFFER_FULL_FLAG: u32 = 1 << 8;

const DM_IOCTL_TYPE: u8 = 0xfd;

nix::ioctl_readwrite!(dm_dev_create, DM_IOCTL_TYPE, 3, DmIoctlHeader);
nix::ioctl_readwrite!(dm_dev_remove, DM_IOCTL_TYPE, 4, DmIoctlHeader);
nix::ioctl_readwrite!(dm_dev_suspend, DM_IOCTL_TYPE, 6, DmIoctlHeader);
nix::ioctl_readwrite!(dm_dev_status, DM_IOCTL_TYPE, 7, DmIoctlHeader);
nix::ioctl_readwrite!(dm_table_load, DM_IOCTL_TYPE, 9, DmIoctlHeader);
nix::ioctl_readwrite!(dm_table_status, DM_IOCTL_TYPE, 12, DmIoctlHeader);

/// `struct dm_ioctl` from the kernel uapi. 312 bytes.
#[repr(C)]
#[derive(Clone, Copy)]
struct DmIoctlHeader {
    version: [u32; 3],
    data_size: u32,
    data_start: u32,
    target_count: u32,
    open_count: i32,
    flags: u32,
    event_nr: u32,
    padding: u32,
    dev: u64,
    name: [u8; DM_NAME_LEN],
    uuid: [u8; DM_UUID_LEN],
    data: [u8; 7],
}

const HEADER_SIZE: usize = std::mem::size_of::<DmIoctlHeader>();

impl DmIoctlHeader {
    fn new(name: &str) -> Result<Self> {
        if name.len() >= DM_NAME_LEN {
            return Err(SnapError::InvalidTable(format!(
                "device name too long: {name:?}"
            )));
        }
        // Plain-old-data struct; zero is a valid representation.
        let mut header: Self = unsafe { std::mem::zeroed() };
        header.version = DM_VERSION;
        header.data_size = u32::try_from(HEADER_SIZE).expect("header size fits u32");
        header.name[..name.len()].copy_from_slice(name.as_bytes());
        Ok(header)
    }

    fn set_uuid(&mut self, uuid: &str) {
        let len = uuid.len().min(DM_UUID_LEN - 1);
        self.uuid[..len].copy_from_slice(&uuid.as_bytes()[..len]);
    }

    fn uuid_str(&self) -> &str {
        let end = self
            .uuid
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DM_UUID_LEN);
        std::str::from_utf8(&self.uuid[..end]).unwrap_or("")
    }
}

/// Serialize a table into target cells for `DM_TABLE_LOAD`.
fn serialize_table(table: &DmTable) -> Result<Vec<u8>> {
    table.validate()?;

    let mut out = Vec::new();
    for target in table.targets() {
        let target_type = target.spec.target_type();
        if target_type.len() >= DM_MAX_TYPE_NAME {
            return Err(SnapError::InvalidTable(format!(
                "target type too long: {target_type:?}"
            )));
        }
        let params = target.spec.params();

        // struct dm_target_spec: u64 start, u64 length, i32 status,
        // u32 next, char target_type[16]; params follow, NUL-terminated,
        // padded so the cell is 8-byte aligned.
        let params_padded = (params.len() + 1 + 7) & !7;
        let cell_size = 40 + params_padded;

        out.extend_from_slice(&target.start_sector.to_ne_bytes());
        out.extend_from_slice(&target.length_sectors.to_ne_bytes());
        out.extend_from_slice(&0_i32.to_ne_bytes());
        out.extend_from_slice(&u32::try_from(cell_size).expect("cell fits u32").to_ne_bytes());
        let mut type_buf = [0_u8; DM_MAX_TYPE_NAME];
        type_buf[..target_type.len()].copy_from_slice(target_type.as_bytes());
        out.extend_from_slice(&type_buf);
        out.extend_from_slice(params.as_bytes());
        out.resize(out.len() + params_padded - params.len(), 0);
    }
    Ok(out)
}

/// Parse target cells out of a kernel-filled buffer.
fn parse_target_cells(buffer: &[u8], header: &DmIoctlHeader) -> Vec<TargetLine> {
    let mut lines = Vec::new();
    let data_end = (header.data_size as usize).min(buffer.len());
    let mut cursor = header.data_start as usize;

    for _ in 0..header.target_count {
        if cursor + 40 > data_end {
            break;
        }
        let cell = &buffer[cursor..];
        let start_sector = u64::from_ne_bytes(cell[0..8].try_into().expect("slice is 8 bytes"));
        let length_sectors = u64::from_ne_bytes(cell[8..16].try_into().expect("slice is 8 bytes"));
        let next = u32::from_ne_bytes(cell[20..24].try_into().expect("slice is 4 bytes")) as usize;
        let type_bytes = &cell[24..40];
        let type_end = type_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DM_MAX_TYPE_NAME);
        let target_type = String::from_utf8_lossy(&type_bytes[..type_end]).into_owned();

        // `next` is relative to data_start; clamp to the filled region.
        let next_cursor = (header.data_start as usize + next).min(data_end);
        let data_offset = cursor + 40;
        let data = if next_cursor > data_offset {
            let raw = &buffer[data_offset..next_cursor];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            String::from_utf8_lossy(&raw[..end]).into_owned()
        } else {
            String::new()
        };

        lines.push(TargetLine {
            start_sector,
            length_sectors,
            target_type,
            data,
        });
        cursor = next_cursor;
    }
    lines
}

/// Decode major/minor from a kernel "huge" dev_t encoding.
const fn dev_major(dev: u64) -> u32 {
    (((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff_u64)) as u32
}

const fn dev_minor(dev: u64) -> u32 {
    ((dev & 0xff) | ((dev >> 12) & !0xff_u64)) as u32
}

/// The process-wide handle to the kernel mapper.
///
/// Holds `/dev/mapper/control` open for its whole lifetime; individual
/// ioctls are atomic, so no lock is needed around the descriptor.
#[derive(Debug)]
pub struct DevMapper {
    control: File,
}

impl DevMapper {
    /// Open the mapper control node.
    pub fn open() -> Result<Self> {
        let control = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(CONTROL_NODE)
            .map_err(|source| SnapError::Open {
                path: CONTROL_NODE.into(),
                source,
            })?;
        Ok(Self { control })
    }

    fn mapper_err(op: &'static str, name: &str, source: Errno) -> SnapError {
        SnapError::Mapper {
            op,
            name: name.to_owned(),
            source,
        }
    }

    /// `DM_DEV_STATUS` for one device; `Err` carries the raw errno so
    /// callers can distinguish "no such device" from real failures.
    fn dev_status(&self, name: &str) -> Result<DmIoctlHeader> {
        let mut header = DmIoctlHeader::new(name)?;
        unsafe { dm_dev_status(self.control.as_raw_fd(), &mut header) }
            .map_err(|e| Self::mapper_err("status", name, e))?;
        Ok(header)
    }

    /// Shared body of `table()` and `status()`: `DM_TABLE_STATUS` with a
    /// doubling buffer until the kernel stops reporting overflow.
    fn query_table(&self, name: &str, flags: u32, op: &'static str) -> Result<Vec<TargetLine>> {
        let mut buffer = vec![0_u8; 4096];
        loop {
            let header = DmIoctlHeader::new(name)?;
            buffer[..HEADER_SIZE].copy_from_slice(unsafe {
                std::slice::from_raw_parts(
                    (&header as *const DmIoctlHeader).cast::<u8>(),
                    HEADER_SIZE,
                )
            });
            {
                // SAFETY: the buffer starts with a properly initialized
                // header and is at least data_size bytes long.
                let io = buffer.as_mut_ptr().cast::<DmIoctlHeader>();
                unsafe {
                    (*io).data_size = u32::try_from(buffer.len()).expect("buffer fits u32");
                    (*io).data_start = u32::try_from(HEADER_SIZE).expect("header fits u32");
                    (*io).flags = flags;
                    dm_table_status(self.control.as_raw_fd(), io)
                        .map_err(|e| Self::mapper_err(op, name, e))?;
                }
            }
            let filled: DmIoctlHeader = unsafe { std::ptr::read(buffer.as_ptr().cast()) };
            if filled.flags & DM_BUFFER_FULL_FLAG == 0 {
                return Ok(parse_target_cells(&buffer, &filled));
            }
            let doubled = buffer.len() * 2;
            buffer = vec![0_u8; doubled];
        }
    }
}

impl Mapper for DevMapper {
    fn create(&self, name: &str, uuid: Option<&str>) -> Result<()> {
        let mut header = DmIoctlHeader::new(name)?;
        if let Some(uuid) = uuid {
            header.set_uuid(uuid);
        }
        unsafe { dm_dev_create(self.control.as_raw_fd(), &mut header) }
            .map_err(|e| Self::mapper_err("create", name, e))?;
        debug!(name, "created mapper device");
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let mut header = DmIoctlHeader::new(name)?;
        unsafe { dm_dev_remove(self.control.as_raw_fd(), &mut header) }
            .map_err(|e| Self::mapper_err("remove", name, e))?;
        debug!(name, "removed mapper device");
        Ok(())
    }

    fn load_table(&self, name: &str, table: &DmTable) -> Result<()> {
        let cells = serialize_table(table)?;
        let mut buffer = vec![0_u8; HEADER_SIZE + cells.len()];
        let header = DmIoctlHeader::new(name)?;
        buffer[..HEADER_SIZE].copy_from_slice(unsafe {
            std::slice::from_raw_parts((&header as *const DmIoctlHeader).cast::<u8>(), HEADER_SIZE)
        });
        buffer[HEADER_SIZE..].copy_from_slice(&cells);

        let io = buffer.as_mut_ptr().cast::<DmIoctlHeader>();
        // SAFETY: buffer holds a valid header followed by the target cells.
        unsafe {
            (*io).data_size = u32::try_from(buffer.len()).expect("buffer fits u32");
            (*io).data_start = u32::try_from(HEADER_SIZE).expect("header fits u32");
            (*io).target_count = u32::try_from(table.num_targets()).expect("count fits u32");
            dm_table_load(self.control.as_raw_fd(), io)
                .map_err(|e| Self::mapper_err("table load", name, e))?;
        }
        Ok(())
    }

    fn suspend(&self, name: &str) -> Result<()> {
        let mut header = DmIoctlHeader::new(name)?;
        header.flags = DM_SUSPEND_FLAG;
        unsafe { dm_dev_suspend(self.control.as_raw_fd(), &mut header) }
            .map_err(|e| Self::mapper_err("suspend", name, e))?;
        Ok(())
    }

    fn resume(&self, name: &str) -> Result<()> {
        let mut header = DmIoctlHeader::new(name)?;
        unsafe { dm_dev_suspend(self.control.as_raw_fd(), &mut header) }
            .map_err(|e| Self::mapper_err("resume", name, e))?;
        Ok(())
    }

    fn state(&self, name: &str) -> DeviceState {
        match self.dev_status(name) {
            Err(_) => DeviceState::Invalid,
            Ok(header) => {
                if header.flags & DM_ACTIVE_PRESENT_FLAG != 0
                    && header.flags & DM_SUSPEND_FLAG == 0
                {
                    DeviceState::Active
                } else {
                    DeviceState::Suspended
                }
            }
        }
    }

    fn status(&self, name: &str) -> Result<Vec<TargetLine>> {
        self.query_table(name, 0, "table status")
    }

    fn table(&self, name: &str) -> Result<Vec<TargetLine>> {
        self.query_table(name, DM_STATUS_TABLE_FLAG, "table info")
    }

    fn path(&self, name: &str) -> Result<String> {
        let header = self.dev_status(name)?;
        Ok(format!("/dev/dm-{}", dev_minor(header.dev)))
    }

    fn unique_path(&self, name: &str) -> Result<String> {
        let header = self.dev_status(name)?;
        let uuid = header.uuid_str();
        if uuid.is_empty() {
            return Err(SnapError::Mapper {
                op: "unique path",
                name: name.to_owned(),
                source: Errno::ENOENT,
            });
        }
        Ok(format!("/dev/disk/by-id/dm-uuid-{uuid}"))
    }

    fn device_string(&self, name: &str) -> Result<String> {
        let header = self.dev_status(name)?;
        Ok(format!(
            "{}:{}",
            dev_major(header.dev),
            dev_minor(header.dev)
        ))
    }
}

#[cfg(test)]
mod tests {
    use crate::target::{SnapshotMode, TargetSpec};

    use super::*;

    #[test]
    fn header_is_kernel_sized() {
        assert_eq!(HEADER_SIZE, 312);
    }

    #[test]
    fn header_carries_name_and_version() {
        let header = DmIoctlHeader::new("system_b").unwrap();
        assert_eq!(header.version, [4, 0, 0]);
        assert_eq!(&header.name[..8], b"system_b");
        assert_eq!(header.name[8], 0);
        assert_eq!(header.data_size as usize, HEADER_SIZE);
    }

    #[test]
    fn header_rejects_oversized_name() {
        let name = "x".repeat(DM_NAME_LEN);
        assert!(DmIoctlHeader::new(&name).is_err());
    }

    #[test]
    fn uuid_round_trips_through_header() {
        let mut header = DmIoctlHeader::new("d").unwrap();
        header.set_uuid("4d36af65-0af8-4b4e-b2a0-a473cb0dffde");
        assert_eq!(header.uuid_str(), "4d36af65-0af8-4b4e-b2a0-a473cb0dffde");
    }

    #[test]
    fn serialized_cells_are_aligned() {
        let mut table = DmTable::new();
        table.push(
            0,
            2048,
            TargetSpec::Snapshot {
                base: "253:1".to_owned(),
                cow: "253:2".to_owned(),
                mode: SnapshotMode::Persistent,
            },
        );
        table.push(
            2048,
            1024,
            TargetSpec::Linear {
                device: "253:3".to_owned(),
                start_sector: 2048,
            },
        );
        let cells = serialize_table(&table).unwrap();
        assert_eq!(cells.len() % 8, 0);

        // First cell: sector range then type name at offset 24.
        assert_eq!(u64::from_ne_bytes(cells[0..8].try_into().unwrap()), 0);
        assert_eq!(u64::from_ne_bytes(cells[8..16].try_into().unwrap()), 2048);
        assert_eq!(&cells[24..32], b"snapshot");
    }

    #[test]
    fn serialize_rejects_invalid_table() {
        assert!(serialize_table(&DmTable::new()).is_err());
    }

    #[test]
    fn parse_recovers_serialized_cells() {
        let mut table = DmTable::new();
        table.push(
            0,
            4096,
            TargetSpec::Linear {
                device: "259:0".to_owned(),
                start_sector: 8,
            },
        );
        let cells = serialize_table(&table).unwrap();

        let mut buffer = vec![0_u8; HEADER_SIZE + cells.len()];
        buffer[HEADER_SIZE..].copy_from_slice(&cells);
        let mut header = DmIoctlHeader::new("d").unwrap();
        header.data_start = u32::try_from(HEADER_SIZE).unwrap();
        header.data_size = u32::try_from(buffer.len()).unwrap();
        header.target_count = 1;

        let lines = parse_target_cells(&buffer, &header);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].start_sector, 0);
        assert_eq!(lines[0].length_sectors, 4096);
        assert_eq!(lines[0].target_type, "linear");
        assert_eq!(lines[0].data, "259:0 8");
    }

    #[test]
    fn huge_dev_encoding() {
        // 253:7 in the kernel's huge encoding.
        let dev = (253_u64 << 8) | 7;
        assert_eq!(dev_major(dev), 253);
        assert_eq!(dev_minor(dev), 7);

        // Minor numbers beyond 8 bits spill into the high bits.
        let dev = (253_u64 << 8) | 0xab | (0x3_u64 << 20);
        assert_eq!(dev_major(dev), 253);
        assert_eq!(dev_minor(dev), 0xab | (0x3 << 8));
    }
}
