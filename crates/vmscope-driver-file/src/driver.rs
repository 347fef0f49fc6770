use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use memmap2::Mmap;

use vmscope_core::{
    Driver, Error as VmiError, FrameProtection, Gfn, MappedFrame, Pa, RegisterId, VcpuId, VmInfo,
};
use vmscope_arch_amd64::{PAGE_SHIFT, PAGE_SIZE};

use crate::Error;

/// Backend over a flat physical-memory snapshot file.
///
/// The file is mapped shared, so writes issued through the file descriptor
/// are visible through the mapping. The guest is never live here, so
/// pause/resume are no-ops and the event plane stays unsupported.
pub struct FileDriver {
    path: PathBuf,
    file: File,
    mmap: Mmap,
    writable: bool,
}

impl FileDriver {
    /// Checks whether `path` looks like an accessible snapshot.
    pub fn probe(path: &Path) -> bool {
        path.metadata().map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
    }

    /// Opens a snapshot, read-write when the file permissions allow it.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        let (file, writable) = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => (file, true),
            Err(_) => (File::open(&path)?, false),
        };

        let mmap = unsafe { Mmap::map(&file)? };

        Ok(Self {
            path,
            file,
            mmap,
            writable,
        })
    }

    fn page_range(&self, gfn: Gfn) -> Result<(usize, usize), Error> {
        let start = (gfn.0 << PAGE_SHIFT) as usize;
        if start >= self.mmap.len() {
            return Err(Error::OutOfBounds);
        }

        let end = (start + PAGE_SIZE as usize).min(self.mmap.len());
        Ok((start, end))
    }
}

impl Driver for FileDriver {
    fn info(&self) -> Result<VmInfo, VmiError> {
        Ok(VmInfo {
            page_size: PAGE_SIZE,
            page_shift: PAGE_SHIFT,
            memsize: self.mmap.len() as u64,
            vcpus: 0,
            address_width: 8,
            hvm: false,
        })
    }

    fn id(&self) -> u64 {
        0
    }

    fn name(&self) -> Result<String, VmiError> {
        Ok(self.path.display().to_string())
    }

    fn map_frame(&self, gfn: Gfn, _protection: FrameProtection) -> Result<MappedFrame, VmiError> {
        let (start, end) = self.page_range(gfn)?;

        // A trailing partial page is padded with zeroes.
        let mut page = vec![0u8; PAGE_SIZE as usize];
        page[..end - start].copy_from_slice(&self.mmap[start..end]);

        Ok(MappedFrame::new(page))
    }

    fn write(&self, paddr: Pa, buf: &[u8]) -> Result<(), VmiError> {
        if !self.writable {
            return Err(Error::ReadOnly.into());
        }

        let end = paddr.0.checked_add(buf.len() as u64).ok_or(VmiError::OutOfBounds)?;
        if end > self.mmap.len() as u64 {
            return Err(Error::OutOfBounds.into());
        }

        self.file.write_all_at(buf, paddr.0).map_err(Error::from)?;
        Ok(())
    }

    fn vcpureg(&self, _reg: RegisterId, _vcpu: VcpuId) -> Result<u64, VmiError> {
        Err(Error::NotSupported.into())
    }

    fn pause(&self) -> Result<(), VmiError> {
        Ok(())
    }

    fn resume(&self) -> Result<(), VmiError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn snapshot(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn reads_come_from_the_file() -> Result<(), VmiError> {
        let file = snapshot(16 * 1024 * 1024);
        let driver = FileDriver::new(file.path()).map_err(VmiError::from)?;

        let frame = driver.map_frame(Gfn(1), FrameProtection::Read)?;
        let expected: Vec<u8> = (0x1000..0x2000).map(|i| (i % 251) as u8).collect();
        assert_eq!(&frame[..], &expected[..]);
        Ok(())
    }

    #[test]
    fn out_of_bounds_frame_fails() {
        let file = snapshot(0x4000);
        let driver = FileDriver::new(file.path()).unwrap();

        assert!(driver.map_frame(Gfn(4), FrameProtection::Read).is_err());
    }

    #[test]
    fn writes_are_visible_to_later_reads() -> Result<(), VmiError> {
        let file = snapshot(0x4000);
        let driver = FileDriver::new(file.path()).map_err(VmiError::from)?;

        driver.write(Pa(0x2ff0), &[0xde, 0xad, 0xbe, 0xef])?;

        let frame = driver.map_frame(Gfn(2), FrameProtection::Read)?;
        assert_eq!(&frame[0xff0..0xff4], &[0xde, 0xad, 0xbe, 0xef]);
        Ok(())
    }

    #[test]
    fn write_past_the_end_fails() {
        let file = snapshot(0x4000);
        let driver = FileDriver::new(file.path()).unwrap();

        assert!(driver.write(Pa(0x3ffe), &[0u8; 4]).is_err());
    }

    #[test]
    fn info_reports_the_snapshot_size() -> Result<(), VmiError> {
        let file = snapshot(0x5000);
        let driver = FileDriver::new(file.path()).map_err(VmiError::from)?;

        let info = driver.info()?;
        assert_eq!(info.memsize, 0x5000);
        assert_eq!(info.page_size, 4096);
        assert_eq!(info.vcpus, 0);
        Ok(())
    }

    #[test]
    fn probe_rejects_missing_files() {
        assert!(!FileDriver::probe(Path::new("/nonexistent/snapshot.raw")));

        let file = snapshot(0x1000);
        assert!(FileDriver::probe(file.path()));
    }
}
