//! Guest OS profiles consumed by higher introspection layers.
//!
//! The core only carries the offset tables and the kernel-symbol lookup;
//! process-list traversal and symbol-table parsing live outside it.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use crate::{config::ConfigEntry, Error, Va};

/// The detected guest operating system family.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OsType {
    /// No OS detected (partial initialization).
    #[default]
    None,

    /// A Linux guest.
    Linux,

    /// A Windows guest.
    Windows,
}

/// Structure offsets for a Linux guest, from the `linux_*` config keys.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[expect(missing_docs)]
pub struct LinuxOffsets {
    pub tasks: u64,
    pub mm: u64,
    pub name: u64,
    pub pid: u64,
    pub pgd: u64,
    pub addr: u64,
}

/// Structure offsets for a Windows guest, from the `win_*` config keys.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[expect(missing_docs)]
pub struct WindowsOffsets {
    pub ntoskrnl: u64,
    pub tasks: u64,
    pub pdbase: u64,
    pub pid: u64,
    pub peb: u64,
    pub iba: u64,
    pub ph: u64,
    pub pname: u64,
    pub kdvb: u64,
    pub sysproc: u64,
}

/// The OS profile of an instance: the detected family and its offsets.
///
/// Once built, the profile is frozen for the lifetime of the instance
/// unless re-detection is requested explicitly.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum OsProfile {
    /// No OS introspection.
    #[default]
    None,

    /// A Linux guest with its offsets and optional System.map path.
    Linux {
        /// Structure offsets.
        offsets: LinuxOffsets,

        /// Path to the kernel's System.map, for symbol lookup.
        sysmap: Option<PathBuf>,
    },

    /// A Windows guest with its offsets.
    Windows {
        /// Structure offsets.
        offsets: WindowsOffsets,
    },
}

impl OsProfile {
    /// Builds a profile from a parsed configuration block.
    pub fn from_config(entry: &ConfigEntry) -> Result<Self, Error> {
        let get = |key: &str| entry.offsets.get(key).copied().unwrap_or(0);

        match entry.ostype.as_deref() {
            None => Ok(Self::None),
            Some(os) if os.eq_ignore_ascii_case("linux") => Ok(Self::Linux {
                offsets: LinuxOffsets {
                    tasks: get("linux_tasks"),
                    mm: get("linux_mm"),
                    name: get("linux_name"),
                    pid: get("linux_pid"),
                    pgd: get("linux_pgd"),
                    addr: get("linux_addr"),
                },
                sysmap: entry.sysmap.as_ref().map(PathBuf::from),
            }),
            Some(os) if os.eq_ignore_ascii_case("windows") => Ok(Self::Windows {
                offsets: WindowsOffsets {
                    ntoskrnl: get("win_ntoskrnl"),
                    tasks: get("win_tasks"),
                    pdbase: get("win_pdbase"),
                    pid: get("win_pid"),
                    peb: get("win_peb"),
                    iba: get("win_iba"),
                    ph: get("win_ph"),
                    pname: get("win_pname"),
                    kdvb: get("win_kdvb"),
                    sysproc: get("win_sysproc"),
                },
            }),
            Some(_) => Err(Error::InitFailed("unknown ostype in configuration")),
        }
    }

    /// Returns the OS family.
    pub fn ostype(&self) -> OsType {
        match self {
            Self::None => OsType::None,
            Self::Linux { .. } => OsType::Linux,
            Self::Windows { .. } => OsType::Windows,
        }
    }

    /// Looks up an offset by its configuration key name.
    pub fn offset(&self, name: &str) -> Option<u64> {
        match self {
            Self::None => None,
            Self::Linux { offsets, .. } => match name {
                "linux_tasks" => Some(offsets.tasks),
                "linux_mm" => Some(offsets.mm),
                "linux_name" => Some(offsets.name),
                "linux_pid" => Some(offsets.pid),
                "linux_pgd" => Some(offsets.pgd),
                "linux_addr" => Some(offsets.addr),
                _ => None,
            },
            Self::Windows { offsets } => match name {
                "win_ntoskrnl" => Some(offsets.ntoskrnl),
                "win_tasks" => Some(offsets.tasks),
                "win_pdbase" => Some(offsets.pdbase),
                "win_pid" => Some(offsets.pid),
                "win_peb" => Some(offsets.peb),
                "win_iba" => Some(offsets.iba),
                "win_ph" => Some(offsets.ph),
                "win_pname" => Some(offsets.pname),
                "win_kdvb" => Some(offsets.kdvb),
                "win_sysproc" => Some(offsets.sysproc),
                _ => None,
            },
        }
    }

    /// Returns the System.map path, if the profile carries one.
    pub fn sysmap(&self) -> Option<&Path> {
        match self {
            Self::Linux { sysmap, .. } => sysmap.as_deref(),
            _ => None,
        }
    }
}

/// Resolves a kernel symbol through a System.map file.
///
/// Lines have the form `ffffffff81000000 T startup_64`; the first exact
/// name match wins.
pub fn lookup_sysmap_symbol(sysmap: &Path, symbol: &str) -> Result<Option<Va>, Error> {
    let reader = BufReader::new(File::open(sysmap)?);

    for line in reader.lines() {
        let line = line?;
        let mut fields = line.split_whitespace();

        let (Some(addr), Some(_kind), Some(name)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };

        if name == symbol {
            let addr =
                u64::from_str_radix(addr, 16).map_err(|_| Error::Other("malformed System.map"))?;
            return Ok(Some(Va(addr)));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::config;

    #[test]
    fn linux_profile_from_config() -> Result<(), Error> {
        let entries = config::parse(
            r#"vm {
                ostype = "Linux";
                sysmap = "/boot/System.map";
                linux_tasks = 0x240;
                linux_pgd = 0x40;
            }"#,
        )
        .unwrap();

        let profile = OsProfile::from_config(&entries["vm"])?;
        assert_eq!(profile.ostype(), OsType::Linux);
        assert_eq!(profile.offset("linux_tasks"), Some(0x240));
        assert_eq!(profile.offset("linux_pgd"), Some(0x40));
        assert_eq!(profile.offset("win_tasks"), None);
        assert_eq!(profile.sysmap(), Some(Path::new("/boot/System.map")));
        Ok(())
    }

    #[test]
    fn unknown_ostype_fails_init() {
        let entries = config::parse(r#"vm { ostype = "Plan9"; }"#).unwrap();
        assert!(OsProfile::from_config(&entries["vm"]).is_err());
    }

    #[test]
    fn sysmap_lookup_finds_symbol() -> Result<(), Error> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "ffffffff81000000 T startup_64")?;
        writeln!(file, "ffffffff81a00000 D init_task")?;

        let va = lookup_sysmap_symbol(file.path(), "init_task")?;
        assert_eq!(va, Some(Va(0xffffffff81a00000)));

        let missing = lookup_sysmap_symbol(file.path(), "no_such_symbol")?;
        assert_eq!(missing, None);
        Ok(())
    }
}
