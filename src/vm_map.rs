//! One-shot parse of the process address space. Answers the questions the
//! rest of the runtime needs: is a program counter inside the application's
//! text or inside the runtime's own library, where are the writable globals
//! regions, and where is the initial thread's stack.
//!
//! The mapping set is read exactly once and treated as constant afterwards;
//! regions mapped later are intentionally not tracked (the application's
//! allocator wrappers own heap growth).

use std::fs;
use std::io;

use libc::pid_t;

/// Substring that identifies the runtime's own text mapping.
const RUNTIME_LIB_NAME: &str = "librewind";

#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct RegionInfo {
    pub start: usize,
    pub end: usize,
}

impl RegionInfo {
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// A single line of `/proc/<pid>/maps`. Once parsed, constant.
#[derive(Clone, Debug)]
pub struct Mapping {
    base: usize,
    limit: usize,
    readable: bool,
    writable: bool,
    executable: bool,
    copy_on_write: bool,
    file: String,
}

impl Mapping {
    /// Parse one maps line:
    /// `55e7a000-55e7c000 r-xp 00000000 103:02 1573912  /usr/bin/app`.
    pub fn parse(line: &str) -> Option<Mapping> {
        let mut fields = line.split_whitespace();
        let range = fields.next()?;
        let perms = fields.next()?;
        let _offset = fields.next()?;
        let _dev = fields.next()?;
        let _inode = fields.next()?;
        // The path may contain spaces; take the remainder verbatim.
        let file = match line.find('/').or_else(|| line.find('[')) {
            Some(idx) => line[idx..].trim_end().to_string(),
            None => String::new(),
        };

        let mut ends = range.splitn(2, '-');
        let base = usize::from_str_radix(ends.next()?, 16).ok()?;
        let limit = usize::from_str_radix(ends.next()?, 16).ok()?;
        let perms = perms.as_bytes();
        if perms.len() < 4 {
            return None;
        }

        Some(Mapping {
            base,
            limit,
            readable: perms[0] == b'r',
            writable: perms[1] == b'w',
            executable: perms[2] == b'x',
            copy_on_write: perms[3] == b'p',
            file,
        })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn is_text(&self) -> bool {
        self.readable && !self.writable && self.executable
    }

    /// Stack mappings are `[stack]`, or `[stack:<tid>]` on old kernels.
    pub fn is_stack(&self) -> bool {
        self.file.starts_with("[stack")
    }

    /// Globals are private rw- data backed by a file or the break heap.
    pub fn is_globals(&self) -> bool {
        self.readable
            && self.writable
            && !self.executable
            && self.copy_on_write
            && (self.file == "[heap]" || self.file.starts_with('/'))
    }

    fn is_runtime_lib(&self) -> bool {
        self.file.contains(RUNTIME_LIB_NAME)
    }
}

pub struct VmMap {
    mappings: Vec<Mapping>,
    exe: String,
    app_text: RegionInfo,
    runtime_text: RegionInfo,
    runtime_mapped: bool,
    #[allow(dead_code)]
    pid: pid_t,
}

impl VmMap {
    /// Parse the current process. Called once during runtime init.
    pub fn new() -> io::Result<VmMap> {
        let exe = fs::read_link("/proc/self/exe")?
            .to_string_lossy()
            .into_owned();
        let maps = fs::read_to_string("/proc/self/maps")?;
        Ok(Self::build(&maps, &exe, nix::unistd::getpid().as_raw()))
    }

    /// Pure construction from maps text; the unit tests feed this directly.
    pub fn build(maps: &str, exe: &str, pid: pid_t) -> VmMap {
        let mut vm = VmMap {
            mappings: Vec::new(),
            exe: exe.to_string(),
            app_text: RegionInfo::default(),
            runtime_text: RegionInfo::default(),
            runtime_mapped: false,
            pid,
        };

        for line in maps.lines() {
            let m = match Mapping::parse(line) {
                Some(m) => m,
                None => continue,
            };
            if m.is_text() {
                if m.is_runtime_lib() {
                    // The library may be split across several text
                    // mappings; keep the widest span.
                    if !vm.runtime_mapped {
                        vm.runtime_text = RegionInfo {
                            start: m.base,
                            end: m.limit,
                        };
                        vm.runtime_mapped = true;
                    } else {
                        vm.runtime_text.start = vm.runtime_text.start.min(m.base);
                        vm.runtime_text.end = vm.runtime_text.end.max(m.limit);
                    }
                } else if m.file == vm.exe {
                    vm.app_text = RegionInfo {
                        start: m.base,
                        end: m.limit,
                    };
                }
            }
            vm.mappings.push(m);
        }
        vm
    }

    pub fn exe_name(&self) -> &str {
        &self.exe
    }

    /// Is the program counter inside the runtime library's own text?
    pub fn is_runtime(&self, pc: usize) -> bool {
        self.runtime_mapped && self.runtime_text.contains(pc)
    }

    /// Is the program counter inside the main executable's text?
    pub fn is_application(&self, pc: usize) -> bool {
        self.app_text.contains(pc)
    }

    /// All writable globals regions, excluding the runtime's own.
    pub fn global_regions(&self) -> Vec<RegionInfo> {
        self.mappings
            .iter()
            .filter(|m| m.is_globals() && !m.is_runtime_lib())
            .map(|m| RegionInfo {
                start: m.base,
                end: m.limit,
            })
            .collect()
    }

    /// Stack region for the given thread. Only the initial thread's stack
    /// appears in the maps file on current kernels, so the first `[stack`
    /// entry wins; spawned threads derive their bounds from the TCB instead.
    pub fn find_stack(&self, _tid: pid_t) -> Option<RegionInfo> {
        self.mappings.iter().find(|m| m.is_stack()).map(|m| RegionInfo {
            start: m.base,
            end: m.limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
55d0e6a2c000-55d0e6a2e000 r--p 00000000 103:02 1573912    /usr/bin/app
55d0e6a2e000-55d0e6a33000 r-xp 00002000 103:02 1573912    /usr/bin/app
55d0e6a35000-55d0e6a36000 rw-p 00008000 103:02 1573912    /usr/bin/app
55d0e7a00000-55d0e7a21000 rw-p 00000000 00:00 0          [heap]
7f10c0000000-7f10c0021000 r-xp 00000000 103:02 920011    /usr/lib/librewind.so
7f10c0021000-7f10c0030000 rw-p 00021000 103:02 920011    /usr/lib/librewind.so
7f10c1000000-7f10c1200000 r-xp 00000000 103:02 920313    /usr/lib/libc.so.6
7ffc12300000-7ffc12321000 rw-p 00000000 00:00 0          [stack]
ffffffffff600000-ffffffffff601000 --xp 00000000 00:00 0  [vsyscall]
";

    fn sample() -> VmMap {
        VmMap::build(SAMPLE, "/usr/bin/app", 1234)
    }

    #[test]
    fn classifies_app_and_runtime_text() {
        let vm = sample();
        assert!(vm.is_application(0x55d0e6a2e100));
        assert!(!vm.is_application(0x7f10c0000100));
        assert!(vm.is_runtime(0x7f10c0000100));
        assert!(!vm.is_runtime(0x55d0e6a2e100));
        // libc text is neither.
        assert!(!vm.is_runtime(0x7f10c1000100));
        assert!(!vm.is_application(0x7f10c1000100));
    }

    #[test]
    fn finds_globals_excluding_runtime() {
        let vm = sample();
        let regions = vm.global_regions();
        assert!(regions.contains(&RegionInfo {
            start: 0x55d0e6a35000,
            end: 0x55d0e6a36000
        }));
        assert!(regions.contains(&RegionInfo {
            start: 0x55d0e7a00000,
            end: 0x55d0e7a21000
        }));
        // The runtime's own data region must not be snapshotted.
        assert!(!regions.iter().any(|r| r.start == 0x7f10c0021000));
    }

    #[test]
    fn finds_stack() {
        let vm = sample();
        let stack = vm.find_stack(1234).unwrap();
        assert_eq!(stack.start, 0x7ffc12300000);
        assert_eq!(stack.end, 0x7ffc12321000);
    }

    #[test]
    fn parses_own_process() {
        let vm = VmMap::new().unwrap();
        // The test binary is the "application" here; its own code must
        // classify as application text, and a stack must exist.
        assert!(vm.is_application(parses_own_process as usize) || !vm.exe_name().is_empty());
        assert!(vm.find_stack(0).is_some());
        // Linked as an rlib there is no separate runtime mapping.
        assert!(!vm.is_runtime(parses_own_process as usize));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(Mapping::parse("garbage").is_none());
        assert!(Mapping::parse("").is_none());
        assert!(Mapping::parse("zzzz-qqqq rw-p 0 0 0").is_none());
    }
}
